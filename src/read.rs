//! The read/take/peek pipeline.
//!
//! A read drains the reader history cache through a per-sample collector
//! into caller-supplied arrays. The caller either owns the sample memory
//! (first buffer entry non-null) or borrows it from the reader as loans
//! (first entry null); mixing the two in one buffer is an application error.
//!
//! The reader's lock is held across the whole drain, including the cache
//! callout. Status bits are reset *before* the drain: the cache publishes
//! data under its own lock, not the reader's, so resetting afterwards could
//! lose a concurrent arrival.

use std::ptr;
use std::sync::Arc;

use scopeguard::defer;

use crate::entity::{self, Entity, EntityKind, ReaderLoans, DATA_AVAILABLE_STATUS, DATA_ON_READERS_STATUS, SAM_ENABLED_SHIFT};
use crate::error::{Error, Result};
use crate::handle::{self, Handle};
use crate::loan::{LoanPool, LoanedSample};
use crate::rhc::{SampleCollector, NO_STATE_MASK_SET};
use crate::sample::{InstanceHandle, LoanedSampleState, SampleInfo, SerType, Serdata, INSTANCE_HANDLE_NIL};

/// Shared collector state: a write cursor over the caller's output arrays,
/// plus the loan pools of the reader when loans are in play.
pub struct CollectSampleArg<'a> {
    next_idx: usize,
    ptrs: &'a mut [*mut u8],
    infos: &'a mut [SampleInfo],
    loan_pool: Option<&'a mut LoanPool>,
    heap_loan_cache: Option<&'a mut LoanPool>,
}

impl<'a> CollectSampleArg<'a> {
    pub fn new(
        ptrs: &'a mut [*mut u8],
        infos: &'a mut [SampleInfo],
        loan_pool: Option<&'a mut LoanPool>,
        heap_loan_cache: Option<&'a mut LoanPool>,
    ) -> CollectSampleArg<'a> {
        CollectSampleArg {
            next_idx: 0,
            ptrs,
            infos,
            loan_pool,
            heap_loan_cache,
        }
    }

    /// Number of samples collected so far.
    pub fn next_idx(&self) -> usize {
        self.next_idx
    }
}

fn collect_sample_into(
    arg: &mut CollectSampleArg,
    si: &SampleInfo,
    st: &Arc<dyn SerType>,
    sd: &Arc<Serdata>,
) -> Result<()> {
    arg.infos[arg.next_idx] = *si;
    let dst = arg.ptrs[arg.next_idx];
    let ok = if si.valid_data {
        unsafe { st.to_sample(sd, dst) }
    } else {
        /* Key-only deserialization leaves the non-key attributes alone; for
           an invalid sample they would be garbage the application would
           nonetheless have to free in the end.  Zeroing them explicitly
           solves that problem. */
        unsafe {
            st.free_sample_contents(dst);
            st.zero_sample(dst);
            st.untyped_to_sample(sd, dst)
        }
    };
    arg.next_idx += 1;
    if ok {
        Ok(())
    } else {
        Err(Error::Generic)
    }
}

/// Collector that deserializes each sample into the caller-allocated memory
/// at the cursor.
pub struct CollectSample<'a>(pub CollectSampleArg<'a>);

impl SampleCollector for CollectSample<'_> {
    fn collect(&mut self, si: &SampleInfo, st: &Arc<dyn SerType>, sd: &Arc<Serdata>) -> Result<()> {
        collect_sample_into(&mut self.0, si, st, sd)
    }
}

/// Outcome of the zero-copy attempt in the loan-based collector.
///
/// `NoLoan` and `UnusableState` both mean "fall through to the heap path";
/// they are distinct because the serdata may carry a loan that simply isn't
/// in a directly publishable representation.
enum LoanCollect {
    Done,
    NoLoan,
    UnusableState,
}

fn collect_sample_loan_zerocopy(
    arg: &mut CollectSampleArg,
    si: &SampleInfo,
    sd: &Arc<Serdata>,
) -> Result<LoanCollect> {
    let ls = match sd.loan() {
        Some(ls) => ls,
        None => return Ok(LoanCollect::NoLoan),
    };
    match ls.state() {
        LoanedSampleState::RawData | LoanedSampleState::RawKey => {}
        _ => return Ok(LoanCollect::UnusableState),
    }
    let pool = match arg.loan_pool.as_deref_mut() {
        Some(pool) => pool,
        None => return Err(Error::BadParameter),
    };
    // The pool's entry is one reference, on top of the serdata's own.
    pool.add(ls.clone())?;
    arg.ptrs[arg.next_idx] = ls.sample_ptr();
    arg.infos[arg.next_idx] = *si;
    arg.next_idx += 1;
    Ok(LoanCollect::Done)
}

/// Collector that borrows memory for each sample: zero-copy when the serdata
/// carries a publishable loan, otherwise a (possibly recycled) heap loan the
/// sample is deserialized into.
pub struct CollectSampleLoan<'a>(pub CollectSampleArg<'a>);

impl SampleCollector for CollectSampleLoan<'_> {
    fn collect(&mut self, si: &SampleInfo, st: &Arc<dyn SerType>, sd: &Arc<Serdata>) -> Result<()> {
        let arg = &mut self.0;
        match collect_sample_loan_zerocopy(arg, si, sd)? {
            LoanCollect::Done => return Ok(()),
            LoanCollect::NoLoan | LoanCollect::UnusableState => {}
        }

        let state = if si.valid_data {
            LoanedSampleState::RawData
        } else {
            LoanedSampleState::RawKey
        };
        let ls = match arg.heap_loan_cache.as_deref_mut().and_then(LoanPool::take_any) {
            // Lucky us, a cached loan can be reused.
            Some(ls) => ls,
            None => LoanedSample::heap(st, state)?,
        };

        let slot = arg.next_idx;
        arg.ptrs[slot] = ls.sample_ptr();
        let ret = collect_sample_into(arg, si, st, sd).and_then(|()| match arg.loan_pool.as_deref_mut() {
            Some(pool) => pool.add(ls.clone()),
            None => Err(Error::BadParameter),
        });
        if let Err(e) = ret {
            /* The application assumes all non-null pointers in the array are
               valid (if the first one is non-null), so the slot of a dropped
               loan must be reset to null to avoid a use-after-free. */
            drop(ls);
            arg.ptrs[slot] = ptr::null_mut();
            return Err(e);
        }
        Ok(())
    }
}

/// Collector that stores a reference to each serdata without deserializing.
pub struct CollectSerdataRefs<'a> {
    next_idx: usize,
    serdatas: &'a mut [Option<Arc<Serdata>>],
    infos: &'a mut [SampleInfo],
}

impl<'a> CollectSerdataRefs<'a> {
    pub fn new(
        serdatas: &'a mut [Option<Arc<Serdata>>],
        infos: &'a mut [SampleInfo],
    ) -> CollectSerdataRefs<'a> {
        CollectSerdataRefs {
            next_idx: 0,
            serdatas,
            infos,
        }
    }
}

impl SampleCollector for CollectSerdataRefs<'_> {
    fn collect(&mut self, si: &SampleInfo, _st: &Arc<dyn SerType>, sd: &Arc<Serdata>) -> Result<()> {
        self.infos[self.next_idx] = *si;
        self.serdatas[self.next_idx] = Some(sd.clone());
        self.next_idx += 1;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ReadOper {
    Peek,
    Read,
    Take,
}

/// Resolves the entity behind a read call to its reader, rejecting entities
/// reads are not defined on.
fn read_impl_setup(
    hdl: Handle,
    only_reader: bool,
) -> Result<(Arc<Entity>, Arc<Entity>)> {
    let entity = entity::pin(hdl)?;
    match entity.kind() {
        EntityKind::Reader => {
            let rd = entity.clone();
            Ok((entity, rd))
        }
        _ if only_reader => {
            entity::unpin(&entity);
            Err(Error::IllegalOperation)
        }
        EntityKind::CondRead | EntityKind::CondQuery => match entity.parent() {
            Some(rd) if rd.kind() == EntityKind::Reader => Ok((entity, rd)),
            _ => {
                entity::unpin(&entity);
                Err(Error::BadParameter)
            }
        },
        _ => {
            entity::unpin(&entity);
            Err(Error::IllegalOperation)
        }
    }
}

/// A zero mask through a condition defers to the condition's own mask.
fn resolve_mask(entity: &Entity, mask: u32) -> u32 {
    if mask != 0 {
        return mask;
    }
    match entity.condition_mask() {
        Some(0) | None => {
            if entity.kind() == EntityKind::Reader {
                0
            } else {
                NO_STATE_MASK_SET
            }
        }
        Some(m) => m,
    }
}

fn read_impl_common(
    oper: ReadOper,
    rd: &Arc<Entity>,
    maxs: u32,
    mask: u32,
    hand: InstanceHandle,
    collector: &mut dyn SampleCollector,
) -> Result<i32> {
    /* Read/take resets the data-available status, and must do so before
       reading: the actual writing is protected by the cache's lock, not the
       reader's. */
    let sm_old = rd.status_reset_ov(DATA_AVAILABLE_STATUS);
    if sm_old & (DATA_ON_READERS_STATUS << SAM_ENABLED_SHIFT) != 0 {
        if let Some(parent) = rd.parent() {
            parent.status_reset(DATA_ON_READERS_STATUS);
        }
    }

    let rdata = rd.reader_data().ok_or(Error::IllegalOperation)?;
    debug_assert!(maxs <= i32::MAX as u32);
    match oper {
        ReadOper::Peek => rdata.rhc.peek(maxs as i32, mask, hand, collector),
        ReadOper::Read => rdata.rhc.read(maxs as i32, mask, hand, collector),
        ReadOper::Take => rdata.rhc.take(maxs as i32, mask, hand, collector),
    }
}

fn read_impl(
    oper: ReadOper,
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
    hand: InstanceHandle,
    only_reader: bool,
) -> Result<i32> {
    if buf.is_empty()
        || infos.is_empty()
        || maxs == 0
        || maxs > i32::MAX as u32
        || (buf.len() as u64) < maxs as u64
        || (infos.len() as u64) < maxs as u64
    {
        return Err(Error::BadParameter);
    }

    let (entity, rd) = read_impl_setup(hdl, only_reader)?;
    let entity_link = entity.link().clone();
    defer! {
        handle::unpin(&entity_link);
    }
    let mask = resolve_mask(&entity, mask);
    let rdata = rd.reader_data().ok_or(Error::IllegalOperation)?;
    let mut loans = rdata.loans.lock();

    /* Either all memory is user-supplied or all of it is borrowed, and the
       array is fully initialized up to the first null pointer.  A loan
       followed by user memory is detected and reported; the reverse cannot
       be told apart from user memory and ends in tears. */
    if !buf[0].is_null() {
        return_reader_loan_locked(&mut loans, buf)?;
    }
    let use_loan = buf[0].is_null();

    let ret = {
        let ReaderLoans { loans: pool, heap_loan_cache: cache } = &mut *loans;
        let arg = CollectSampleArg::new(&mut *buf, &mut *infos, Some(pool), Some(cache));
        if use_loan {
            read_impl_common(oper, &rd, maxs, mask, hand, &mut CollectSampleLoan(arg))
        } else {
            read_impl_common(oper, &rd, maxs, mask, hand, &mut CollectSample(arg))
        }
    };

    // With loans the buffer must end on a null pointer (unless full), so the
    // paths returning loans know when to stop.
    if use_loan {
        if let Ok(n) = ret {
            if n > 0 && (n as usize) < buf.len() - 1 {
                buf[n as usize] = ptr::null_mut();
            }
        }
    }

    /* Drop any remaining cached heap loans.  Some conversions grow the
       cache during the call (a zero-copy transport delivering serialized
       data that gets deserialized into a heap loan), and simply keeping
       everything would let it grow without bounds. */
    while let Some(loan) = loans.heap_loan_cache.take_any() {
        drop(loan);
    }

    ret
}

fn read_with_collector_impl(
    oper: ReadOper,
    hdl: Handle,
    maxs: u32,
    mask: u32,
    hand: InstanceHandle,
    only_reader: bool,
    collector: &mut dyn SampleCollector,
) -> Result<i32> {
    if maxs == 0 || maxs > i32::MAX as u32 {
        return Err(Error::BadParameter);
    }
    let (entity, rd) = read_impl_setup(hdl, only_reader)?;
    let entity_link = entity.link().clone();
    defer! {
        handle::unpin(&entity_link);
    }
    let mask = resolve_mask(&entity, mask);
    read_impl_common(oper, &rd, maxs, mask, hand, collector)
}

fn readcdr_impl(
    oper: ReadOper,
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
    hand: InstanceHandle,
) -> Result<i32> {
    if serdatas.is_empty()
        || infos.is_empty()
        || maxs == 0
        || maxs > i32::MAX as u32
        || (serdatas.len() as u64) < maxs as u64
        || (infos.len() as u64) < maxs as u64
    {
        return Err(Error::BadParameter);
    }
    let mut collector = CollectSerdataRefs::new(serdatas, infos);
    read_with_collector_impl(oper, hdl, maxs, mask, hand, true, &mut collector)
}

/// Reads up to `maxs` samples without changing their read state.
pub fn peek(hdl: Handle, buf: &mut [*mut u8], infos: &mut [SampleInfo], maxs: u32) -> Result<i32> {
    read_impl(ReadOper::Peek, hdl, buf, infos, maxs, 0, INSTANCE_HANDLE_NIL, false)
}

/// [`peek`] restricted to samples matching `mask`.
pub fn peek_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    read_impl(ReadOper::Peek, hdl, buf, infos, maxs, mask, INSTANCE_HANDLE_NIL, false)
}

/// [`peek`] restricted to one instance.
pub fn peek_instance(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Peek, hdl, buf, infos, maxs, 0, instance, false)
}

/// [`peek`] restricted to one instance and a state mask.
pub fn peek_instance_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Peek, hdl, buf, infos, maxs, mask, instance, false)
}

/// Reads up to `maxs` samples, marking them read.
pub fn read(hdl: Handle, buf: &mut [*mut u8], infos: &mut [SampleInfo], maxs: u32) -> Result<i32> {
    read_impl(ReadOper::Read, hdl, buf, infos, maxs, 0, INSTANCE_HANDLE_NIL, false)
}

/// [`read`] restricted to samples matching `mask`.
pub fn read_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    read_impl(ReadOper::Read, hdl, buf, infos, maxs, mask, INSTANCE_HANDLE_NIL, false)
}

/// [`read`] restricted to one instance.
pub fn read_instance(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Read, hdl, buf, infos, maxs, 0, instance, false)
}

/// [`read`] restricted to one instance and a state mask.
pub fn read_instance_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Read, hdl, buf, infos, maxs, mask, instance, false)
}

/// Takes up to `maxs` samples out of the history cache.
pub fn take(hdl: Handle, buf: &mut [*mut u8], infos: &mut [SampleInfo], maxs: u32) -> Result<i32> {
    read_impl(ReadOper::Take, hdl, buf, infos, maxs, 0, INSTANCE_HANDLE_NIL, false)
}

/// [`take`] restricted to samples matching `mask`.
pub fn take_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    read_impl(ReadOper::Take, hdl, buf, infos, maxs, mask, INSTANCE_HANDLE_NIL, false)
}

/// [`take`] restricted to one instance.
pub fn take_instance(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Take, hdl, buf, infos, maxs, 0, instance, false)
}

/// [`take`] restricted to one instance and a state mask.
pub fn take_instance_mask(
    hdl: Handle,
    buf: &mut [*mut u8],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    read_impl(ReadOper::Take, hdl, buf, infos, maxs, mask, instance, false)
}

/// [`peek`] of the serialized representations, without deserializing.
pub fn peekcdr(
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    readcdr_impl(ReadOper::Peek, hdl, serdatas, infos, maxs, mask, INSTANCE_HANDLE_NIL)
}

/// [`read`] of the serialized representations, without deserializing.
pub fn readcdr(
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    readcdr_impl(ReadOper::Read, hdl, serdatas, infos, maxs, mask, INSTANCE_HANDLE_NIL)
}

/// [`readcdr`] restricted to one instance.
pub fn readcdr_instance(
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    readcdr_impl(ReadOper::Read, hdl, serdatas, infos, maxs, mask, instance)
}

/// [`take`] of the serialized representations, without deserializing.
pub fn takecdr(
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    mask: u32,
) -> Result<i32> {
    readcdr_impl(ReadOper::Take, hdl, serdatas, infos, maxs, mask, INSTANCE_HANDLE_NIL)
}

/// [`takecdr`] restricted to one instance.
pub fn takecdr_instance(
    hdl: Handle,
    serdatas: &mut [Option<Arc<Serdata>>],
    infos: &mut [SampleInfo],
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
) -> Result<i32> {
    if instance == INSTANCE_HANDLE_NIL {
        return Err(Error::PreconditionNotMet);
    }
    readcdr_impl(ReadOper::Take, hdl, serdatas, infos, maxs, mask, instance)
}

/// [`peek`] through a caller-supplied collector; no loan bookkeeping.
pub fn peek_with_collector(
    hdl: Handle,
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
    collector: &mut dyn SampleCollector,
) -> Result<i32> {
    read_with_collector_impl(ReadOper::Peek, hdl, maxs, mask, instance, false, collector)
}

/// [`read`] through a caller-supplied collector; no loan bookkeeping.
pub fn read_with_collector(
    hdl: Handle,
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
    collector: &mut dyn SampleCollector,
) -> Result<i32> {
    read_with_collector_impl(ReadOper::Read, hdl, maxs, mask, instance, false, collector)
}

/// [`take`] through a caller-supplied collector; no loan bookkeeping.
pub fn take_with_collector(
    hdl: Handle,
    maxs: u32,
    instance: InstanceHandle,
    mask: u32,
    collector: &mut dyn SampleCollector,
) -> Result<i32> {
    read_with_collector_impl(ReadOper::Take, hdl, maxs, mask, instance, false, collector)
}

/// Recycles or releases one returned loan.
fn return_reader_loan_one(loans: &mut ReaderLoans, loan: Arc<LoanedSample>) {
    if !loan.is_heap() || Arc::strong_count(&loan) != 1 {
        drop(loan);
    } else {
        loan.reset();
        if loans.heap_loan_cache.add(loan).is_err() {
            // Duplicate payload pointer in the cache; nothing sane to do.
            debug_assert!(false);
        }
    }
}

fn return_reader_loan_loop(
    loans: &mut ReaderLoans,
    buf: &mut [*mut u8],
    first: usize,
) -> Result<()> {
    let mut rc = Ok(());
    for s in first..buf.len() {
        if buf[s].is_null() {
            break;
        }
        match loans.loans.find_and_remove(buf[s]) {
            None => {
                /* Not supposed to happen: either all memory is borrowed or
                   none is, so the application screwed up.  Continue so that
                   afterwards the only non-null pointers are to memory. */
                rc = Err(Error::BadParameter);
            }
            Some(loan) => return_reader_loan_one(loans, loan),
        }
    }
    rc
}

/// Probes the first buffer entry: if it is an outstanding loan the whole
/// buffer is treated as loans to return; user-owned memory is left alone.
fn return_reader_loan_locked(loans: &mut ReaderLoans, buf: &mut [*mut u8]) -> Result<()> {
    match loans.loans.find_and_remove(buf[0]) {
        // First entry is not a loan: assume application-owned memory.
        None => Ok(()),
        Some(loan) => {
            buf[0] = ptr::null_mut();
            return_reader_loan_one(loans, loan);
            return_reader_loan_loop(loans, buf, 1)
        }
    }
}

/// Returns the loans in `buf` to the reader they were borrowed from.
///
/// Heap loans no longer referenced elsewhere go back into the reader's
/// recycling cache; everything else is released. Fails with
/// `PRECONDITION_NOT_MET` when the first entry is not an outstanding loan.
pub fn return_loan(hdl: Handle, buf: &mut [*mut u8]) -> Result<()> {
    if buf.is_empty() || buf[0].is_null() {
        // No data, or an invocation following a failed or empty read; those
        // already restored the state prior to their invocation.
        return Ok(());
    }

    let (entity, rd) = read_impl_setup(hdl, false)?;
    let entity_link = entity.link().clone();
    defer! {
        handle::unpin(&entity_link);
    }
    let rdata = rd.reader_data().ok_or(Error::IllegalOperation)?;
    let mut loans = rdata.loans.lock();
    match loans.loans.find_and_remove(buf[0]) {
        // First entry is not a loan; that is not what this function is for.
        None => Err(Error::PreconditionNotMet),
        Some(loan) => {
            buf[0] = ptr::null_mut();
            return_reader_loan_one(&mut loans, loan);
            return_reader_loan_loop(&mut loans, buf, 1)
        }
    }
}
