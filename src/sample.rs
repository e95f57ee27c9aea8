//! Samples, serialized data and the serializer contract.
//!
//! The pipeline never interprets sample memory itself: all allocation,
//! destruction and deserialization goes through the [`SerType`] vtable of
//! the topic's serializer, operating on raw payload pointers. This module
//! only defines the contracts; concrete serializers live outside the core.

use std::sync::Arc;

use crate::loan::LoanedSample;

/// Instance handle as used in sample infos and instance-scoped reads.
pub type InstanceHandle = u64;

/// The nil instance handle; instance-scoped reads reject it.
pub const INSTANCE_HANDLE_NIL: InstanceHandle = 0;

/// Per-sample metadata delivered alongside the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleInfo {
    /// Sample state bit (read / not-read).
    pub sample_state: u32,
    /// View state bit (new / not-new).
    pub view_state: u32,
    /// Instance state bit (alive / disposed / no-writers).
    pub instance_state: u32,
    /// True when the payload carries data, false for key-only samples
    /// (e.g. dispose notifications).
    pub valid_data: bool,
    /// Instance this sample belongs to.
    pub instance_handle: InstanceHandle,
    /// Source timestamp in nanoseconds.
    pub source_timestamp: i64,
}

/// Representation state of a loaned sample's payload.
///
/// Only `RawData` and `RawKey` payloads can be handed to the application
/// as-is; serialized payloads must first go through the heap-loan path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanedSampleState {
    Uninitialized,
    RawKey,
    RawData,
    SerializedKey,
    SerializedData,
}

/// Type-erased serializer operations over raw sample memory.
///
/// Pointer-taking methods are `unsafe`: the caller guarantees the pointer
/// came from [`SerType::alloc_sample`] of the same serializer (or equivalent
/// caller-owned storage of the right layout) and is not aliased for the
/// duration of the call.
pub trait SerType: Send + Sync {
    /// Allocates a zeroed sample and returns its payload pointer.
    ///
    /// Returns null on allocation failure.
    fn alloc_sample(&self) -> *mut u8;

    /// Releases the sample and everything it owns.
    ///
    /// # Safety
    ///
    /// `sample` must come from `alloc_sample` of this serializer and must
    /// not be used afterwards.
    unsafe fn free_sample(&self, sample: *mut u8);

    /// Releases memory owned by the sample (sequences, strings) without
    /// releasing the sample itself.
    ///
    /// # Safety
    ///
    /// `sample` must be a valid sample of this serializer's type.
    unsafe fn free_sample_contents(&self, sample: *mut u8);

    /// Resets the sample to the all-zero state.
    ///
    /// # Safety
    ///
    /// `sample` must be a valid sample of this serializer's type whose owned
    /// memory has already been released.
    unsafe fn zero_sample(&self, sample: *mut u8);

    /// Deserializes the full sample into `dst`. Returns false on failure.
    ///
    /// # Safety
    ///
    /// `dst` must be a valid sample of this serializer's type.
    unsafe fn to_sample(&self, sd: &Serdata, dst: *mut u8) -> bool;

    /// Deserializes only the key fields into `dst`. Returns false on
    /// failure.
    ///
    /// # Safety
    ///
    /// `dst` must be a valid sample of this serializer's type.
    unsafe fn untyped_to_sample(&self, sd: &Serdata, dst: *mut u8) -> bool;
}

/// A refcounted serialized sample as delivered by a writer or transport.
///
/// Reference counting is the `Arc` holding it; collectors that keep a
/// serdata simply clone the `Arc`.
pub struct Serdata {
    blob: Box<[u8]>,
    /// Loan attached by a zero-copy transport, if any.
    loan: Option<Arc<LoanedSample>>,
}

impl Serdata {
    /// A serdata backed by serialized bytes only.
    pub fn new(blob: Box<[u8]>) -> Arc<Serdata> {
        Arc::new(Serdata { blob, loan: None })
    }

    /// A serdata carrying a transport loan alongside its serialized form.
    pub fn with_loan(blob: Box<[u8]>, loan: Arc<LoanedSample>) -> Arc<Serdata> {
        Arc::new(Serdata { blob, loan: Some(loan) })
    }

    /// The serialized representation.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// The attached loan, if the sample arrived over a zero-copy path.
    pub fn loan(&self) -> Option<&Arc<LoanedSample>> {
        self.loan.as_ref()
    }
}

impl std::fmt::Debug for Serdata {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Serdata")
            .field("len", &self.blob.len())
            .field("loan", &self.loan.is_some())
            .finish()
    }
}
