//! The process-wide handle server.
//!
//! Every live entity is registered here under a positive 32-bit handle. The
//! whole lifecycle state of a handle lives in one packed atomic word so that
//! even the most involved transitions (e.g. "drop the last reference, set
//! `CLOSING` and take a pin" in `pin_for_delete`) are a single
//! compare-and-swap, never exposing an intermediate state.
//!
//! Word layout, low to high:
//!
//! * bits 0..=11: pin count, the in-flight operations holding the entity
//!   alive;
//! * bits 12..=25: reference count (unit `0x1000`), the owners that must
//!   release the entity before it can disappear;
//! * bits 26..=31: the flags `NO_USER_ACCESS`, `ALLOW_CHILDREN`, `IMPLICIT`,
//!   `PENDING`, `DELETE_DEFERRED`, `CLOSING`.
//!
//! The server mutex guards only the table; it is a leaf lock, and no other
//! lock may be taken while holding it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_utils::{Backoff, CachePadded};
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Positive 32-bit identifier of a live entity.
pub type Handle = i32;

/// Handles at and above this value are reserved for pre-agreed
/// pseudo-handles registered through [`register_special`].
pub const PSEUDO_HANDLE_BASE: Handle = 0x7fff_0000;

/* The allocator relies on a random generator for finding a free handle, so
   the time spent in `create` increases with the number of live handles.  16M
   handles seems likely to be enough and keeps the expected cost of
   allocating a new one reasonable. */
const MAX_HANDLES: usize = (i32::MAX / 128) as usize;

const PINCOUNT_MASK: u32 = 0x0000_0fff;
const REFCOUNT_MASK: u32 = 0x03ff_f000;
const REFCOUNT_UNIT: u32 = 0x0000_1000;
const REFCOUNT_SHIFT: u32 = 12;

/* Closing and pending could be collapsed into fewer states, but keeping them
   distinct enforces that close() is called first, then close_wait(), and
   then delete(). */
const FLAG_CLOSING: u32 = 0x8000_0000;
const FLAG_DELETE_DEFERRED: u32 = 0x4000_0000;
const FLAG_PENDING: u32 = 0x2000_0000;
const FLAG_IMPLICIT: u32 = 0x1000_0000;
/// Refcount counts children rather than co-owners.
const FLAG_ALLOW_CHILDREN: u32 = 0x0800_0000;
const FLAG_NO_USER_ACCESS: u32 = 0x0400_0000;

/// The per-entity record a handle resolves to.
///
/// The handle value is constant after creation; all lifecycle state is in
/// the packed `bits` word. A link may carry a type-erased weak reference to
/// the object it stands for, installed once right after creation.
pub struct HandleLink {
    handle: AtomicI32,
    /// The packed pin/ref/flags word; cache-padded since it is the one
    /// location every pin and unpin hammers on.
    bits: CachePadded<AtomicU32>,
    object: OnceLock<Weak<dyn Any + Send + Sync>>,
}

impl HandleLink {
    /// Returns a fresh, unregistered link.
    pub fn new() -> Arc<HandleLink> {
        Arc::new(HandleLink {
            handle: AtomicI32::new(0),
            bits: CachePadded::new(AtomicU32::new(0)),
            object: OnceLock::new(),
        })
    }

    /// The handle this link is registered under, or 0 before registration.
    pub fn handle(&self) -> Handle {
        self.handle.load(Ordering::Relaxed)
    }

    /// Installs the back-reference to the owning object. Only the first call
    /// has any effect.
    pub fn bind_object(&self, object: Weak<dyn Any + Send + Sync>) {
        let _ = self.object.set(object);
    }

    /// The owning object, if one was bound and is still alive.
    pub fn object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.object.get().and_then(Weak::upgrade)
    }

    /// True once `close` (or a deletion path) marked the handle closing.
    ///
    /// Useful for holders of a pin that must abandon long-running work when
    /// the entity is being torn down.
    pub fn is_closed(&self) -> bool {
        self.bits.load(Ordering::Relaxed) & FLAG_CLOSING != 0
    }

    /// True when no references remain.
    pub fn is_not_refd(&self) -> bool {
        self.bits.load(Ordering::Relaxed) & REFCOUNT_MASK == 0
    }

    /// Current pin count.
    pub fn pin_count(&self) -> u32 {
        self.bits.load(Ordering::Relaxed) & PINCOUNT_MASK
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        (self.bits.load(Ordering::Relaxed) & REFCOUNT_MASK) >> REFCOUNT_SHIFT
    }

    fn load(&self) -> u32 {
        self.bits.load(Ordering::Relaxed)
    }

    fn cas(&self, current: u32, new: u32) -> bool {
        self.bits
            .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl std::fmt::Debug for HandleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let cf = self.load();
        f.debug_struct("HandleLink")
            .field("handle", &self.handle())
            .field("pins", &(cf & PINCOUNT_MASK))
            .field("refs", &((cf & REFCOUNT_MASK) >> REFCOUNT_SHIFT))
            .field("closing", &(cf & FLAG_CLOSING != 0))
            .field("delete_deferred", &(cf & FLAG_DELETE_DEFERRED != 0))
            .field("pending", &(cf & FLAG_PENDING != 0))
            .field("implicit", &(cf & FLAG_IMPLICIT != 0))
            .finish()
    }
}

struct ServerState {
    /// `None` while the server is not initialized.
    table: Option<HashMap<Handle, Arc<HandleLink>>>,
    count: usize,
    initrc: u32,
}

struct HandleServer {
    state: Mutex<ServerState>,
    /// Signaled when a `close_wait` condition may have become true.
    cond: Condvar,
}

lazy_static! {
    static ref SERVER: HandleServer = HandleServer {
        state: Mutex::new(ServerState {
            table: None,
            count: 0,
            initrc: 0,
        }),
        cond: Condvar::new(),
    };
}

/// Initializes the handle server singleton.
///
/// Reference-counted: each `server_init` must be matched by a
/// [`server_fini`]; only the first call allocates the table.
pub fn server_init() -> Result<()> {
    let mut st = SERVER.state.lock();
    if st.initrc == 0 {
        st.table = Some(HashMap::with_capacity(128));
        st.count = 0;
    }
    st.initrc += 1;
    Ok(())
}

/// Tears down the handle server once `server_fini` has been called as often
/// as [`server_init`].
///
/// All handles must have been deleted by then; survivors are logged and, in
/// debug builds, fail an assertion.
pub fn server_fini() {
    let mut st = SERVER.state.lock();
    debug_assert!(st.initrc > 0);
    st.initrc = st.initrc.saturating_sub(1);
    if st.initrc == 0 {
        if let Some(table) = st.table.take() {
            for link in table.values() {
                let cf = link.load();
                log::error!(
                    "handle {} pin {} refc {}{}{}{}",
                    link.handle(),
                    cf & PINCOUNT_MASK,
                    (cf & REFCOUNT_MASK) >> REFCOUNT_SHIFT,
                    if cf & FLAG_PENDING != 0 { " pending" } else { "" },
                    if cf & FLAG_CLOSING != 0 { " closing" } else { "" },
                    if cf & FLAG_DELETE_DEFERRED != 0 { " delete-deferred" } else { "" },
                );
            }
            debug_assert!(table.is_empty());
        }
        st.count = 0;
    }
}

/// Registers `link` and returns a fresh pseudo-random handle for it.
///
/// The new link starts out `PENDING` (invisible to [`pin`]) with one pin held
/// by the creator; [`unpend`] publishes it and releases that pin. Explicit
/// entities start with one reference, implicit ones with none.
pub fn create(
    link: &Arc<HandleLink>,
    implicit: bool,
    allow_children: bool,
    user_access: bool,
) -> Result<Handle> {
    let mut st = SERVER.state.lock();
    if st.table.is_none() {
        return Err(Error::PreconditionNotMet);
    }
    if st.count == MAX_HANDLES {
        return Err(Error::OutOfResources);
    }

    let mut flags = FLAG_PENDING;
    flags |= if implicit { FLAG_IMPLICIT } else { REFCOUNT_UNIT };
    if allow_children {
        flags |= FLAG_ALLOW_CHILDREN;
    }
    if !user_access {
        flags |= FLAG_NO_USER_ACCESS;
    }
    link.bits.store(flags | 1, Ordering::Relaxed);

    let table = match st.table.as_mut() {
        Some(t) => t,
        None => return Err(Error::PreconditionNotMet),
    };
    let hdl = loop {
        // Handles are pseudo-random, so the table hashes the value as-is.
        let hdl = (rand::random::<u32>() & i32::MAX as u32) as Handle;
        if hdl == 0 || hdl >= PSEUDO_HANDLE_BASE || table.contains_key(&hdl) {
            continue;
        }
        table.insert(hdl, link.clone());
        break hdl;
    };
    link.handle.store(hdl, Ordering::Relaxed);
    st.count += 1;
    Ok(hdl)
}

/// Like [`create`], but installs a caller-specified handle value.
///
/// Used for the pre-agreed pseudo-handles. Fails with `BadParameter` when
/// the value is not positive or is already taken.
pub fn register_special(
    link: &Arc<HandleLink>,
    implicit: bool,
    allow_children: bool,
    handle: Handle,
) -> Result<Handle> {
    if handle <= 0 {
        return Err(Error::BadParameter);
    }
    let mut st = SERVER.state.lock();
    if st.table.is_none() {
        return Err(Error::PreconditionNotMet);
    }
    if st.count == MAX_HANDLES {
        return Err(Error::OutOfResources);
    }

    let mut flags = FLAG_PENDING;
    flags |= if implicit { FLAG_IMPLICIT } else { REFCOUNT_UNIT };
    if allow_children {
        flags |= FLAG_ALLOW_CHILDREN;
    }
    link.bits.store(flags | 1, Ordering::Relaxed);

    let table = match st.table.as_mut() {
        Some(t) => t,
        None => return Err(Error::PreconditionNotMet),
    };
    if table.contains_key(&handle) {
        return Err(Error::BadParameter);
    }
    table.insert(handle, link.clone());
    link.handle.store(handle, Ordering::Relaxed);
    st.count += 1;
    Ok(handle)
}

/// Publishes a freshly created link and releases the creator's pin.
pub fn unpend(link: &Arc<HandleLink>) {
    let cf = link.load();
    debug_assert!(cf & FLAG_PENDING != 0);
    debug_assert!(cf & FLAG_DELETE_DEFERRED == 0);
    debug_assert!(cf & FLAG_CLOSING == 0);
    debug_assert!(cf & REFCOUNT_MASK >= REFCOUNT_UNIT || cf & FLAG_IMPLICIT != 0);
    debug_assert!(cf & PINCOUNT_MASK >= 1);
    link.bits.fetch_and(!FLAG_PENDING, Ordering::AcqRel);
    unpin(link);
}

/// Removes the link from the table.
///
/// The caller must hold the only remaining pin, with `CLOSING` set and no
/// references left (or the link still `PENDING` after a failed creation).
pub fn delete(link: &Arc<HandleLink>) -> Result<()> {
    let cf = link.load();
    if cf & FLAG_PENDING == 0 {
        debug_assert!(cf & FLAG_CLOSING != 0);
        debug_assert!(cf & REFCOUNT_MASK == 0);
    }
    debug_assert!(cf & PINCOUNT_MASK == 1);
    let mut st = SERVER.state.lock();
    if let Some(table) = st.table.as_mut() {
        table.remove(&link.handle());
    }
    debug_assert!(st.count > 0);
    st.count = st.count.saturating_sub(1);
    Ok(())
}

fn pin_int(hdl: Handle, delta: u32, from_user: bool) -> Result<Arc<HandleLink>> {
    /* Checking initialization here pays off: pinning the supplied entity is
       the first thing almost every operation does, so this catches use of
       the library before anything was set up. */
    let st = SERVER.state.lock();
    let table = st.table.as_ref().ok_or(Error::PreconditionNotMet)?;
    let link = table.get(&hdl).ok_or(Error::BadParameter)?;

    // Assume success; bail out if the object turns out to be in the process
    // of being deleted.
    let backoff = Backoff::new();
    loop {
        let cf = link.load();
        if cf & (FLAG_CLOSING | FLAG_PENDING) != 0 {
            return Err(Error::BadParameter);
        }
        if from_user && cf & FLAG_NO_USER_ACCESS != 0 {
            return Err(Error::BadParameter);
        }
        if link.cas(cf, cf + delta) {
            return Ok(link.clone());
        }
        backoff.spin();
    }
}

/// Looks up `hdl` and takes a pin on it on behalf of an application caller.
pub fn pin(hdl: Handle) -> Result<Arc<HandleLink>> {
    pin_int(hdl, 1, true)
}

/// [`pin`] with an explicit caller origin; internal callers pass
/// `from_user = false` and may pin entities hidden from the application.
pub fn pin_with_origin(hdl: Handle, from_user: bool) -> Result<Arc<HandleLink>> {
    pin_int(hdl, 1, from_user)
}

/// Atomically takes a pin and a reference in one step.
pub fn pin_and_ref_with_origin(hdl: Handle, from_user: bool) -> Result<Arc<HandleLink>> {
    pin_int(hdl, REFCOUNT_UNIT + 1, from_user)
}

/// Takes an additional pin on a link the caller already has pinned.
pub fn repin(link: &Arc<HandleLink>) {
    link.bits.fetch_add(1, Ordering::AcqRel);
}

/// Acquires the authority to delete the entity behind `hdl`.
///
/// On success the link is returned pinned with `CLOSING` set and the
/// relevant reference dropped. `Err(TryAgain)` means the caller's reference
/// was dropped but other owners still keep the entity alive: deletion is
/// deferred and somebody else will finish it.
///
/// `explicit` distinguishes a deliberate delete (application call, or a
/// parent deleting its children) from a child releasing its parent.
pub fn pin_for_delete(hdl: Handle, explicit: bool, from_user: bool) -> Result<Arc<HandleLink>> {
    let st = SERVER.state.lock();
    let table = st.table.as_ref().ok_or(Error::PreconditionNotMet)?;
    let link = table.get(&hdl).ok_or(Error::BadParameter)?;

    let backoff = Backoff::new();
    loop {
        let cf = link.load();
        let cf1;
        if from_user && cf & FLAG_NO_USER_ACCESS != 0 {
            // Not deletable by the application, so pretend it doesn't exist.
            return Err(Error::BadParameter);
        } else if cf & (FLAG_CLOSING | FLAG_PENDING) != 0 {
            // Only one deleter can win (and if closing is already set, the
            // handle's reference has already been dropped).
            return Err(Error::BadParameter);
        } else if cf & FLAG_DELETE_DEFERRED != 0 {
            /* Someone already called delete but the operation was deferred
               because of outstanding references.  This implies there are no
               children, else the entire hierarchy would simply have been
               deleted. */
            debug_assert!(cf & FLAG_ALLOW_CHILDREN == 0);
            if cf & REFCOUNT_MASK != 0 {
                return Err(Error::AlreadyDeleted);
            }
            // Refcount reached zero; pin to allow deletion.
            cf1 = (cf + 1) | FLAG_CLOSING;
        } else if explicit {
            if cf & FLAG_IMPLICIT != 0 {
                // Entity is implicit, so the handle holds no reference.
                cf1 = (cf + 1) | FLAG_CLOSING;
            } else {
                debug_assert!(cf & REFCOUNT_MASK > 0);
                if cf & REFCOUNT_MASK == REFCOUNT_UNIT {
                    // Last reference is closing; pin and mark closing.
                    cf1 = (cf - REFCOUNT_UNIT + 1) | FLAG_CLOSING;
                } else if cf & FLAG_ALLOW_CHILDREN == 0 {
                    // Other owners remain; defer the close.
                    cf1 = (cf - REFCOUNT_UNIT) | FLAG_DELETE_DEFERRED;
                } else {
                    // Refcount only counts children, not our concern here.
                    cf1 = (cf - REFCOUNT_UNIT + 1) | FLAG_CLOSING;
                }
            }
        } else {
            // A child invoking delete on its parent.
            if cf & FLAG_IMPLICIT != 0 {
                debug_assert!(cf & REFCOUNT_MASK > 0);
                if cf & REFCOUNT_MASK == REFCOUNT_UNIT {
                    cf1 = (cf - REFCOUNT_UNIT + 1) | FLAG_CLOSING;
                } else if cf & FLAG_ALLOW_CHILDREN == 0 {
                    cf1 = (cf - REFCOUNT_UNIT) | FLAG_DELETE_DEFERRED;
                } else {
                    // Just drop the child reference.
                    cf1 = cf - REFCOUNT_UNIT;
                }
            } else {
                // A child can't delete an explicit parent.
                return Err(Error::IllegalOperation);
            }
        }

        // Exactly the branches that set CLOSING hand over the deletion
        // authority; everything else only dropped a reference.
        let ready = cf1 & FLAG_CLOSING != 0;
        if link.cas(cf, cf1) {
            return if ready { Ok(link.clone()) } else { Err(Error::TryAgain) };
        }
        backoff.spin();
    }
}

/// Drops a child's reference on its parent, pinning the parent when this
/// call makes it deletable.
///
/// Returns true iff the caller should now delete the parent.
pub fn drop_childref_and_pin(link: &Arc<HandleLink>, may_delete_parent: bool) -> bool {
    let _st = SERVER.state.lock();
    let backoff = Backoff::new();
    loop {
        let cf = link.load();
        let cf1;
        let del_parent;
        if cf & (FLAG_CLOSING | FLAG_PENDING) != 0 {
            // A deleter already won; the child reference still goes.
            debug_assert!(cf & REFCOUNT_MASK > 0);
            cf1 = cf - REFCOUNT_UNIT;
            del_parent = false;
        } else if cf & FLAG_IMPLICIT != 0 {
            if cf & REFCOUNT_MASK == REFCOUNT_UNIT && may_delete_parent {
                // Implicit parent loses its last child: delete it.
                cf1 = cf - REFCOUNT_UNIT + 1;
                del_parent = true;
            } else {
                debug_assert!(cf & REFCOUNT_MASK > 0);
                cf1 = cf - REFCOUNT_UNIT;
                del_parent = false;
            }
        } else {
            // A child can't delete an explicit parent.
            debug_assert!(cf & REFCOUNT_MASK > 0);
            cf1 = cf - REFCOUNT_UNIT;
            del_parent = false;
        }
        if link.cas(cf, cf1) {
            return del_parent;
        }
        backoff.spin();
    }
}

/// Releases a pin, waking a blocked [`close_wait`] when this was the
/// second-to-last one on a closing handle.
pub fn unpin(link: &Arc<HandleLink>) {
    let cf = link.load();
    if cf & FLAG_CLOSING != 0 {
        debug_assert!(cf & PINCOUNT_MASK > 1);
    } else {
        debug_assert!(cf & PINCOUNT_MASK >= 1);
    }
    let st = SERVER.state.lock();
    let new = link.bits.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
    if new & (FLAG_CLOSING | PINCOUNT_MASK) == FLAG_CLOSING | 1 {
        SERVER.cond.notify_all();
    }
    drop(st);
}

/// Adds one reference.
pub fn add_ref(link: &Arc<HandleLink>) {
    link.bits.fetch_add(REFCOUNT_UNIT, Ordering::AcqRel);
}

/// Drops one reference; returns true when the count reached zero.
pub fn drop_ref(link: &Arc<HandleLink>) -> bool {
    let backoff = Backoff::new();
    let new = loop {
        let old = link.load();
        debug_assert!(old & REFCOUNT_MASK > 0);
        if link.cas(old, old - REFCOUNT_UNIT) {
            break old - REFCOUNT_UNIT;
        }
        backoff.spin();
    };
    let st = SERVER.state.lock();
    if new & (FLAG_CLOSING | PINCOUNT_MASK) == FLAG_CLOSING | 1 {
        SERVER.cond.notify_all();
    }
    drop(st);
    new & REFCOUNT_MASK == 0
}

/// Fused [`unpin`] + [`drop_ref`] for terminal release paths.
pub fn unpin_and_drop_ref(link: &Arc<HandleLink>) -> bool {
    let backoff = Backoff::new();
    let new = loop {
        let old = link.load();
        debug_assert!(old & REFCOUNT_MASK > 0);
        debug_assert!(old & PINCOUNT_MASK > 0);
        if link.cas(old, old - REFCOUNT_UNIT - 1) {
            break old - REFCOUNT_UNIT - 1;
        }
        backoff.spin();
    };
    let st = SERVER.state.lock();
    if new & (FLAG_CLOSING | PINCOUNT_MASK) == FLAG_CLOSING | 1 {
        SERVER.cond.notify_all();
    }
    drop(st);
    new & REFCOUNT_MASK == 0
}

/// Forbids new pins. Returns true iff the reference count was already zero
/// at the moment `CLOSING` was set.
pub fn close(link: &Arc<HandleLink>) -> bool {
    let old = link.bits.fetch_or(FLAG_CLOSING, Ordering::AcqRel);
    old & REFCOUNT_MASK == 0
}

/// Blocks until the pin count drops to 1 (the caller's own pin).
///
/// Only one thread may close-wait a given link; `CLOSING` must already be
/// set so no new pins can appear.
pub fn close_wait(link: &Arc<HandleLink>) {
    let cf = link.load();
    debug_assert!(cf & FLAG_CLOSING != 0);
    debug_assert!(cf & PINCOUNT_MASK >= 1);
    let mut st = SERVER.state.lock();
    while link.load() & PINCOUNT_MASK != 1 {
        SERVER.cond.wait(&mut st);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn explicit_lifecycle() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, false, false, true).unwrap();
        assert!(h > 0 && h < PSEUDO_HANDLE_BASE);
        assert_eq!(link.pin_count(), 1);
        unpend(&link);
        assert_eq!(link.pin_count(), 0);
        assert_eq!(link.ref_count(), 1);

        let pinned = pin(h).unwrap();
        assert_eq!(pinned.pin_count(), 1);
        unpin(&pinned);
        assert_eq!(link.pin_count(), 0);

        let del = pin_for_delete(h, true, true).unwrap();
        assert!(del.is_closed());
        assert_eq!(del.ref_count(), 0);
        assert_eq!(del.pin_count(), 1);
        delete(&del).unwrap();
        assert_eq!(pin(h).unwrap_err(), Error::BadParameter);
        server_fini();
    }

    #[test]
    fn implicit_with_two_children() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, true, true, false).unwrap();
        assert!(h > 0);
        // One child reference stands in for the creator.
        add_ref(&link);
        unpend(&link);
        assert_eq!(link.pin_count(), 0);
        assert_eq!(link.ref_count(), 1);
        add_ref(&link);
        assert_eq!(link.ref_count(), 2);

        assert!(!drop_childref_and_pin(&link, true));
        assert_eq!(link.ref_count(), 1);
        assert!(drop_childref_and_pin(&link, true));
        assert_eq!(link.ref_count(), 0);
        assert_eq!(link.pin_count(), 1);
        close(&link);
        delete(&link).unwrap();
        server_fini();
    }

    #[test]
    fn implicit_entity_not_user_accessible() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, true, false, false).unwrap();
        add_ref(&link);
        unpend(&link);
        // Hidden from the application entirely.
        assert_eq!(pin(h).unwrap_err(), Error::BadParameter);
        assert_eq!(pin_for_delete(h, true, true).unwrap_err(), Error::BadParameter);
        let internal = pin_with_origin(h, false).unwrap();
        unpin(&internal);

        let del = pin_for_delete(h, false, false).unwrap();
        delete(&del).unwrap();
        server_fini();
    }

    #[test]
    fn deferred_delete() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, false, false, true).unwrap();
        unpend(&link);
        add_ref(&link); // a second owner

        // Deletion is deferred while the other owner holds on.
        assert_eq!(pin_for_delete(h, true, true).unwrap_err(), Error::TryAgain);
        assert_eq!(pin(h).unwrap_err(), Error::BadParameter);
        // A second deleter is told it is already gone.
        assert_eq!(pin_for_delete(h, true, true).unwrap_err(), Error::AlreadyDeleted);

        // The last owner lets go; now the deferred delete can finish.
        assert!(drop_ref(&link));
        let del = pin_for_delete(h, true, true).unwrap();
        assert!(del.is_closed());
        delete(&del).unwrap();
        server_fini();
    }

    #[test]
    fn child_cannot_delete_explicit_parent() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, false, true, true).unwrap();
        unpend(&link);
        assert_eq!(pin_for_delete(h, false, false).unwrap_err(), Error::IllegalOperation);
        let del = pin_for_delete(h, true, true).unwrap();
        delete(&del).unwrap();
        server_fini();
    }

    #[test]
    fn register_special_handles() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = register_special(&link, false, false, PSEUDO_HANDLE_BASE + 1).unwrap();
        unpend(&link);
        assert_eq!(h, PSEUDO_HANDLE_BASE + 1);
        let dup = HandleLink::new();
        assert_eq!(
            register_special(&dup, false, false, h).unwrap_err(),
            Error::BadParameter
        );
        assert_eq!(register_special(&dup, false, false, 0).unwrap_err(), Error::BadParameter);

        let pinned = pin(h).unwrap();
        unpin(&pinned);
        let del = pin_for_delete(h, true, true).unwrap();
        delete(&del).unwrap();
        server_fini();
    }

    #[test]
    fn pin_and_ref_counts_both() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, false, false, true).unwrap();
        unpend(&link);
        let pinned = pin_and_ref_with_origin(h, true).unwrap();
        assert_eq!(pinned.pin_count(), 1);
        assert_eq!(pinned.ref_count(), 2);
        assert!(!unpin_and_drop_ref(&pinned));
        assert_eq!(link.pin_count(), 0);
        assert_eq!(link.ref_count(), 1);
        let del = pin_for_delete(h, true, true).unwrap();
        delete(&del).unwrap();
        server_fini();
    }

    #[test]
    fn close_wait_drains_pinners() {
        server_init().unwrap();
        let link = HandleLink::new();
        let h = create(&link, false, false, true).unwrap();
        unpend(&link);

        let pinners: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(l) = pin(h) {
                            repin(&l);
                            unpin(&l);
                            unpin(&l);
                        } else {
                            break;
                        }
                    }
                })
            })
            .collect();

        let del = pin_for_delete(h, true, true).unwrap();
        close_wait(&del);
        assert_eq!(del.pin_count(), 1);
        delete(&del).unwrap();
        for t in pinners {
            t.join().unwrap();
        }
        assert_eq!(pin(h).unwrap_err(), Error::BadParameter);
        server_fini();
    }

    proptest! {
        #[test]
        fn counts_track_a_model(ops in proptest::collection::vec(0u8..4, 1..64)) {
            server_init().unwrap();
            let link = HandleLink::new();
            let h = create(&link, false, false, true).unwrap();
            unpend(&link);
            let mut pins = 0u32;
            let mut refs = 1u32;
            for &op in &ops {
                match op {
                    0 => {
                        pin(h).unwrap();
                        pins += 1;
                    }
                    1 if pins > 0 => {
                        unpin(&link);
                        pins -= 1;
                    }
                    2 => {
                        add_ref(&link);
                        refs += 1;
                    }
                    3 if refs > 1 => {
                        prop_assert!(!drop_ref(&link));
                        refs -= 1;
                    }
                    _ => {}
                }
                prop_assert_eq!(link.pin_count(), pins);
                prop_assert_eq!(link.ref_count(), refs);
                prop_assert!(link.pin_count() <= 4095);
                prop_assert!(link.ref_count() <= 16383);
                prop_assert!(link.handle() > 0 && link.handle() < PSEUDO_HANDLE_BASE);
                prop_assert!(!link.is_closed());
            }
            for _ in 0..pins {
                unpin(&link);
            }
            for _ in 1..refs {
                drop_ref(&link);
            }
            let del = pin_for_delete(h, true, true).unwrap();
            delete(&del).unwrap();
            server_fini();
        }
    }
}
