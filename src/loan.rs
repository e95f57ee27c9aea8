//! Loaned samples and per-reader loan pools.
//!
//! A loan is memory the middleware hands to the application without copying:
//! either a sample deserialized into reader-owned heap memory, or a payload
//! delivered in place by a zero-copy transport. The application must return
//! every loan; returned heap loans are recycled through a per-reader cache
//! instead of being freed and reallocated on every read.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sample::{LoanedSampleState, SerType};

/// Where a loan's payload memory came from, and how to release it.
pub enum LoanOrigin {
    /// Allocated from the heap by the reader; released through the
    /// serializer.
    Heap(Arc<dyn SerType>),
    /// Delivered by a zero-copy transport; released through the closure the
    /// transport supplied.
    Psmx(Box<dyn Fn(*mut u8) + Send + Sync>),
}

/// Borrowed memory for one sample.
///
/// The reference count of the surrounding `Arc` is the loan's reference
/// count: the reader's loan pool holds one reference for as long as the loan
/// is out with the application, and a serdata carrying a zero-copy payload
/// holds another.
pub struct LoanedSample {
    origin: LoanOrigin,
    state: LoanedSampleState,
    sample: *mut u8,
}

// The payload pointer is uniquely managed by the loan; all shared access is
// serialized by the owning reader's lock.
unsafe impl Send for LoanedSample {}
unsafe impl Sync for LoanedSample {}

impl LoanedSample {
    /// Allocates a fresh heap loan through `stype`.
    pub fn heap(stype: &Arc<dyn SerType>, state: LoanedSampleState) -> Result<Arc<LoanedSample>> {
        let sample = stype.alloc_sample();
        if sample.is_null() {
            return Err(Error::OutOfResources);
        }
        Ok(Arc::new(LoanedSample {
            origin: LoanOrigin::Heap(stype.clone()),
            state,
            sample,
        }))
    }

    /// Wraps a payload delivered by a zero-copy transport.
    pub fn psmx(
        sample: *mut u8,
        state: LoanedSampleState,
        release: Box<dyn Fn(*mut u8) + Send + Sync>,
    ) -> Arc<LoanedSample> {
        Arc::new(LoanedSample {
            origin: LoanOrigin::Psmx(release),
            state,
            sample,
        })
    }

    /// The payload pointer published to the application.
    pub fn sample_ptr(&self) -> *mut u8 {
        self.sample
    }

    /// Representation state of the payload.
    pub fn state(&self) -> LoanedSampleState {
        self.state
    }

    /// True for loans whose payload lives on the process heap.
    pub fn is_heap(&self) -> bool {
        matches!(self.origin, LoanOrigin::Heap(_))
    }

    /// Releases memory owned by the sample and zeroes it, making the loan fit
    /// for reuse from the cache.
    ///
    /// Deserialization must be prepared for an arbitrary valid destination
    /// sample anyway, so this is about not holding on to potentially large
    /// amounts of application data, not about correctness.
    pub fn reset(&self) {
        if let LoanOrigin::Heap(stype) = &self.origin {
            unsafe {
                stype.free_sample_contents(self.sample);
                stype.zero_sample(self.sample);
            }
        }
    }
}

impl Drop for LoanedSample {
    fn drop(&mut self) {
        match &self.origin {
            LoanOrigin::Heap(stype) => unsafe { stype.free_sample(self.sample) },
            LoanOrigin::Psmx(release) => release(self.sample),
        }
    }
}

impl std::fmt::Debug for LoanedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LoanedSample")
            .field("sample", &self.sample)
            .field("state", &self.state)
            .field("heap", &self.is_heap())
            .finish()
    }
}

/// An unordered collection of outstanding loans, keyed on the payload
/// pointer the application sees.
///
/// Guarded by the owning reader's lock; never shared across readers.
#[derive(Default)]
pub struct LoanPool {
    loans: HashMap<usize, Arc<LoanedSample>>,
}

impl LoanPool {
    pub fn new() -> LoanPool {
        LoanPool::default()
    }

    /// Inserts a loan. The pool's entry counts as one reference.
    pub fn add(&mut self, loan: Arc<LoanedSample>) -> Result<()> {
        let key = loan.sample_ptr() as usize;
        if self.loans.insert(key, loan).is_some() {
            // The same payload pointer can't be on loan twice.
            return Err(Error::BadParameter);
        }
        Ok(())
    }

    /// Removes and returns the loan whose payload is at `ptr`.
    pub fn find_and_remove(&mut self, ptr: *const u8) -> Option<Arc<LoanedSample>> {
        self.loans.remove(&(ptr as usize))
    }

    /// Removes and returns an arbitrary loan, e.g. when recycling from the
    /// heap-loan cache or draining at teardown.
    pub fn take_any(&mut self) -> Option<Arc<LoanedSample>> {
        let key = *self.loans.keys().next()?;
        self.loans.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }
}
