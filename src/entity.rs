//! The entity layer: a strict tree of handle-registered objects.
//!
//! Entities do not link to each other through their handle links; the parent
//! owns its children in a guarded map and each child keeps a weak back-link.
//! Lifetime is driven entirely by the handle server: creating a child adds a
//! reference to its parent, deleting it drops that reference, and an
//! implicit parent disappears with its last child.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::handle::{self, Handle, HandleLink};
use crate::loan::LoanPool;
use crate::rhc::Rhc;
use crate::sample::SerType;

/// Raised when the reader history cache holds unread data.
pub const DATA_AVAILABLE_STATUS: u32 = 1 << 10;
/// Raised on a subscriber when any of its readers has data.
pub const DATA_ON_READERS_STATUS: u32 = 1 << 9;
/// Shift from a status bit to its "materialized" enable bit in the status
/// word's upper half.
pub const SAM_ENABLED_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A container node: participant, publisher, subscriber.
    Node,
    Reader,
    CondRead,
    CondQuery,
}

/// Reader-specific state. The loan pools are guarded by one lock, held
/// across the whole read call including the cache drain.
pub struct ReaderData {
    pub(crate) rhc: Box<dyn Rhc>,
    pub(crate) stype: Arc<dyn SerType>,
    pub(crate) loans: Mutex<ReaderLoans>,
}

/// The two per-reader pools: loans currently out with the application, and
/// returned heap loans available for reuse.
#[derive(Default)]
pub struct ReaderLoans {
    pub(crate) loans: LoanPool,
    pub(crate) heap_loan_cache: LoanPool,
}

enum Specific {
    None,
    Reader(ReaderData),
    Condition { mask: u32 },
}

pub struct Entity {
    kind: EntityKind,
    link: Arc<HandleLink>,
    parent: Option<Weak<Entity>>,
    children: Mutex<HashMap<Handle, Arc<Entity>>>,
    /// Low half: raised status bits. High half: which statuses are
    /// materialized for the application.
    status: AtomicU32,
    specific: Specific,
}

impl Entity {
    fn create(
        kind: EntityKind,
        parent: Option<&Arc<Entity>>,
        implicit: bool,
        user_access: bool,
        specific: Specific,
    ) -> Result<Arc<Entity>> {
        let allow_children = matches!(kind, EntityKind::Node | EntityKind::Reader);
        let link = HandleLink::new();
        let hdl = handle::create(&link, implicit, allow_children, user_access)?;

        let entity = Arc::new(Entity {
            kind,
            link: link.clone(),
            parent: parent.map(Arc::downgrade),
            children: Mutex::new(HashMap::new()),
            status: AtomicU32::new(0),
            specific,
        });
        let entity_any: Arc<dyn Any + Send + Sync> = entity.clone();
        let object: Weak<dyn Any + Send + Sync> = Arc::downgrade(&entity_any);
        link.bind_object(object);

        if let Some(parent) = parent {
            parent.children.lock().insert(hdl, entity.clone());
            handle::add_ref(&parent.link);
        }
        handle::unpend(&link);
        Ok(entity)
    }

    /// Creates a root container node (e.g. a participant).
    ///
    /// Root creation initializes the handle server; deleting the root
    /// releases that initialization again.
    pub fn new_node() -> Result<Arc<Entity>> {
        handle::server_init()?;
        match Entity::create(EntityKind::Node, None, false, true, Specific::None) {
            Ok(entity) => Ok(entity),
            Err(e) => {
                handle::server_fini();
                Err(e)
            }
        }
    }

    /// Creates a reader under `parent` with the given history cache and
    /// serializer.
    pub fn new_reader(
        parent: &Arc<Entity>,
        rhc: Box<dyn Rhc>,
        stype: Arc<dyn SerType>,
    ) -> Result<Arc<Entity>> {
        Entity::create(
            EntityKind::Reader,
            Some(parent),
            false,
            true,
            Specific::Reader(ReaderData {
                rhc,
                stype,
                loans: Mutex::new(ReaderLoans::default()),
            }),
        )
    }

    /// Creates a read condition on `reader` with the given state mask.
    pub fn new_read_condition(reader: &Arc<Entity>, mask: u32) -> Result<Arc<Entity>> {
        if reader.kind != EntityKind::Reader {
            return Err(Error::IllegalOperation);
        }
        Entity::create(
            EntityKind::CondRead,
            Some(reader),
            false,
            true,
            Specific::Condition { mask },
        )
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn handle(&self) -> Handle {
        self.link.handle()
    }

    pub fn link(&self) -> &Arc<HandleLink> {
        &self.link
    }

    pub fn parent(&self) -> Option<Arc<Entity>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn reader_data(&self) -> Option<&ReaderData> {
        match &self.specific {
            Specific::Reader(rd) => Some(rd),
            _ => None,
        }
    }

    pub(crate) fn condition_mask(&self) -> Option<u32> {
        match &self.specific {
            Specific::Condition { mask } => Some(*mask),
            _ => None,
        }
    }

    /// Raises status bits (normally the cache's job on delivery).
    pub fn status_set(&self, mask: u32) {
        self.status.fetch_or(mask & 0xffff, Ordering::AcqRel);
    }

    /// Marks statuses as materialized for the application.
    pub fn status_enable(&self, mask: u32) {
        self.status.fetch_or((mask & 0xffff) << SAM_ENABLED_SHIFT, Ordering::AcqRel);
    }

    /// Clears status bits and returns the previous word.
    pub(crate) fn status_reset_ov(&self, mask: u32) -> u32 {
        self.status.fetch_and(!(mask & 0xffff), Ordering::AcqRel)
    }

    /// Clears status bits.
    pub(crate) fn status_reset(&self, mask: u32) {
        let _ = self.status_reset_ov(mask);
    }

    /// Current raised-status word (low half).
    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Relaxed) & 0xffff
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &self.kind)
            .field("link", &self.link)
            .finish()
    }
}

fn entity_of(link: &Arc<HandleLink>) -> Result<Arc<Entity>> {
    let object = link.object().ok_or(Error::BadParameter)?;
    object.downcast::<Entity>().map_err(|_| Error::BadParameter)
}

/// Pins the entity behind `hdl` on behalf of the application.
pub fn pin(hdl: Handle) -> Result<Arc<Entity>> {
    pin_with_origin(hdl, true)
}

/// Pins the entity behind `hdl`, internal callers passing
/// `from_user = false`.
pub fn pin_with_origin(hdl: Handle, from_user: bool) -> Result<Arc<Entity>> {
    let link = handle::pin_with_origin(hdl, from_user)?;
    match entity_of(&link) {
        Ok(entity) => Ok(entity),
        Err(e) => {
            handle::unpin(&link);
            Err(e)
        }
    }
}

/// Releases a pin taken with [`pin`].
pub fn unpin(entity: &Arc<Entity>) {
    handle::unpin(&entity.link);
}

/// Deletes the entity behind `hdl` and, recursively, all of its children.
pub fn delete(hdl: Handle) -> Result<()> {
    delete_impl(hdl, true, true)
}

fn delete_impl(hdl: Handle, explicit: bool, from_user: bool) -> Result<()> {
    match handle::pin_for_delete(hdl, explicit, from_user) {
        Ok(link) => {
            let entity = entity_of(&link)?;
            really_delete(&entity)
        }
        // The entity's own reference was dropped but other owners keep it
        // alive; deletion completes when the last of them lets go.
        Err(Error::TryAgain) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Tears down a pinned, closing entity: children first, then the handle,
/// then the parent's child reference.
fn really_delete(entity: &Arc<Entity>) -> Result<()> {
    loop {
        let child = entity.children.lock().values().next().cloned();
        match child {
            None => break,
            Some(child) => {
                let hdl = child.handle();
                // The parent deletes its children deliberately, so this is
                // an explicit call regardless of how we got here.
                let _ = delete_impl(hdl, true, false);
                // Make sure a failed child delete can't wedge the loop.
                entity.children.lock().remove(&hdl);
            }
        }
    }

    handle::close_wait(&entity.link);
    handle::delete(&entity.link)?;

    if let Some(parent) = entity.parent() {
        parent.children.lock().remove(&entity.handle());
        if handle::drop_childref_and_pin(&parent.link, true) {
            handle::close(&parent.link);
            really_delete(&parent)?;
        }
    } else if entity.kind == EntityKind::Node {
        handle::server_fini();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::rhc::SampleCollector;
    use crate::sample::{InstanceHandle, Serdata};

    struct NullRhc;
    impl Rhc for NullRhc {
        fn peek(&self, _: i32, _: u32, _: InstanceHandle, _: &mut dyn SampleCollector) -> Result<i32> {
            Ok(0)
        }
        fn read(&self, _: i32, _: u32, _: InstanceHandle, _: &mut dyn SampleCollector) -> Result<i32> {
            Ok(0)
        }
        fn take(&self, _: i32, _: u32, _: InstanceHandle, _: &mut dyn SampleCollector) -> Result<i32> {
            Ok(0)
        }
    }

    struct NullType;
    impl SerType for NullType {
        fn alloc_sample(&self) -> *mut u8 {
            Box::into_raw(Box::new(0u64)) as *mut u8
        }
        unsafe fn free_sample(&self, sample: *mut u8) {
            drop(Box::from_raw(sample as *mut u64));
        }
        unsafe fn free_sample_contents(&self, _: *mut u8) {}
        unsafe fn zero_sample(&self, sample: *mut u8) {
            *(sample as *mut u64) = 0;
        }
        unsafe fn to_sample(&self, _: &Serdata, _: *mut u8) -> bool {
            true
        }
        unsafe fn untyped_to_sample(&self, _: &Serdata, _: *mut u8) -> bool {
            true
        }
    }

    #[test]
    fn tree_lifecycle() {
        let node = Entity::new_node().unwrap();
        let reader = Entity::new_reader(&node, Box::new(NullRhc), Arc::new(NullType)).unwrap();
        let cond = Entity::new_read_condition(&reader, 0).unwrap();

        // Child references: node has the reader, the reader has the cond.
        assert_eq!(node.link().ref_count(), 2);
        assert_eq!(reader.link().ref_count(), 2);

        let pinned = pin(reader.handle()).unwrap();
        assert_eq!(pinned.kind(), EntityKind::Reader);
        assert!(Arc::ptr_eq(&pinned, &reader));
        unpin(&pinned);

        // Deleting the node takes the whole tree with it.
        delete(node.handle()).unwrap();
        assert!(pin(node.handle()).is_err());
        assert!(pin(reader.handle()).is_err());
        assert!(pin(cond.handle()).is_err());
    }

    #[test]
    fn delete_child_first() {
        let node = Entity::new_node().unwrap();
        let reader = Entity::new_reader(&node, Box::new(NullRhc), Arc::new(NullType)).unwrap();
        delete(reader.handle()).unwrap();
        assert_eq!(pin(reader.handle()).unwrap_err(), Error::BadParameter);
        assert_eq!(node.link().ref_count(), 1);
        delete(node.handle()).unwrap();
    }

    #[test]
    fn condition_requires_reader() {
        let node = Entity::new_node().unwrap();
        assert_eq!(
            Entity::new_read_condition(&node, 0).unwrap_err(),
            Error::IllegalOperation
        );
        delete(node.handle()).unwrap();
    }

    #[test]
    fn status_word() {
        let node = Entity::new_node().unwrap();
        node.status_set(DATA_AVAILABLE_STATUS);
        node.status_enable(DATA_ON_READERS_STATUS);
        assert_eq!(node.status(), DATA_AVAILABLE_STATUS);
        let old = node.status_reset_ov(DATA_AVAILABLE_STATUS);
        assert!(old & DATA_AVAILABLE_STATUS != 0);
        assert!(old & (DATA_ON_READERS_STATUS << SAM_ENABLED_SHIFT) != 0);
        assert_eq!(node.status(), 0);
        delete(node.handle()).unwrap();
    }
}
