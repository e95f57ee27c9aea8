//! The reader history cache contract.
//!
//! The cache interior belongs to another component; the pipeline only drains
//! it. A drain operation walks up to `maxs` samples matching a state mask
//! and an optional instance, invoking the caller's collector once per sample
//! under the cache's own lock. The cache must never call back into the
//! reader's lock.

use std::sync::Arc;

use crate::error::Result;
use crate::sample::{InstanceHandle, SampleInfo, SerType, Serdata};

/// Sample-state mask bits.
pub const READ_SAMPLE_STATE: u32 = 1;
pub const NOT_READ_SAMPLE_STATE: u32 = 2;
pub const ANY_SAMPLE_STATE: u32 = READ_SAMPLE_STATE | NOT_READ_SAMPLE_STATE;

/// View-state mask bits.
pub const NEW_VIEW_STATE: u32 = 4;
pub const NOT_NEW_VIEW_STATE: u32 = 8;
pub const ANY_VIEW_STATE: u32 = NEW_VIEW_STATE | NOT_NEW_VIEW_STATE;

/// Instance-state mask bits.
pub const ALIVE_INSTANCE_STATE: u32 = 16;
pub const NOT_ALIVE_DISPOSED_INSTANCE_STATE: u32 = 32;
pub const NOT_ALIVE_NO_WRITERS_INSTANCE_STATE: u32 = 64;
pub const ANY_INSTANCE_STATE: u32 =
    ALIVE_INSTANCE_STATE | NOT_ALIVE_DISPOSED_INSTANCE_STATE | NOT_ALIVE_NO_WRITERS_INSTANCE_STATE;

pub const ANY_STATE: u32 = ANY_SAMPLE_STATE | ANY_VIEW_STATE | ANY_INSTANCE_STATE;

/// Passed in place of a zero mask when reading through a condition, so the
/// cache falls back to the condition's own mask.
pub const NO_STATE_MASK_SET: u32 = 1 << 31;

/// Per-sample callback invoked by the cache during a drain.
///
/// Collectors run under the cache's lock and must be bounded; they report
/// failure to abort the drain.
pub trait SampleCollector {
    fn collect(&mut self, si: &SampleInfo, st: &Arc<dyn SerType>, sd: &Arc<Serdata>) -> Result<()>;
}

/// The drain interface of a reader history cache.
///
/// Each method returns the number of samples collected. `peek` leaves
/// sample states untouched, `read` marks samples read, `take` removes them.
pub trait Rhc: Send + Sync {
    fn peek(
        &self,
        maxs: i32,
        mask: u32,
        instance: InstanceHandle,
        collector: &mut dyn SampleCollector,
    ) -> Result<i32>;

    fn read(
        &self,
        maxs: i32,
        mask: u32,
        instance: InstanceHandle,
        collector: &mut dyn SampleCollector,
    ) -> Result<i32>;

    fn take(
        &self,
        maxs: i32,
        mask: u32,
        instance: InstanceHandle,
        collector: &mut dyn SampleCollector,
    ) -> Result<i32>;
}
