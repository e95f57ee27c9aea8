//! Cooperative finite-state machines on a single worker thread.
//!
//! A control owns one background thread that drives any number of machines:
//! it pops queued events in FIFO order (LIFO for priority dispatches and
//! state timeouts), looks up the transition for (current state, event),
//! switches state, and runs the transition and entry actions with the
//! control lock released. Because exactly one thread ever runs actions, an
//! action may touch its machine's data without further locking, and
//! teardown can guarantee that no action runs after `free` returns.
//!
//! Timers live in an ordered map keyed `(deadline, sequence)`; a timer is
//! armed exactly when its slot's deadline is not `NEVER`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::time;

/// Dispatched automatically: as the initial transition when a machine
/// starts, and after an action when the current state has an AUTO
/// transition (the "auto-chain").
pub const EVENT_AUTO: i32 = -1;
/// Dispatched (with priority) when a state timeout expires.
pub const EVENT_TIMEOUT: i32 = -2;
/// Reserved for teardown notifications routed through transition tables.
pub const EVENT_DELETE: i32 = -3;

/// User argument handed to every callback of a machine.
pub type FsmArg = Arc<dyn Any + Send + Sync>;

/// A transition or state-entry action.
pub type Action = fn(&Fsm, &FsmArg);

/// What a debug hook is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAct {
    /// An event was appended to the queue.
    Dispatch,
    /// An event was prepended to the queue (priority dispatch).
    DispatchDirect,
    /// An event is being handled.
    Handling,
}

/// Per-machine debug hook; observes every dispatched and handled event.
///
/// Runs with the control lock held: it must not call back into the
/// machine's API.
pub type DebugFn = fn(&Fsm, DebugAct, Option<&'static State>, i32, &FsmArg);

/// A state of a machine.
///
/// `entry` runs on every transition into the state. A positive `timeout`
/// arms a state timer on entry, cleared again on exit; `0` and
/// [`time::NEVER`] both disable it.
pub struct State {
    pub entry: Option<Action>,
    pub timeout: i64,
}

/// One row of a transition table.
///
/// The initial transition has `begin = None` and `event_id = EVENT_AUTO`;
/// a transition with `end = None` terminates the machine. States are
/// compared by identity, so a table refers to each state through one
/// `&'static` reference.
pub struct Transition {
    pub begin: Option<&'static State>,
    pub event_id: i32,
    pub action: Option<Action>,
    pub end: Option<&'static State>,
}

type FsmId = u64;

struct Event {
    fsm: FsmId,
    event_id: i32,
}

#[derive(Clone, Copy)]
enum TimerKind {
    State,
    Overall,
}

#[derive(Clone, Copy)]
struct TimerRef {
    fsm: FsmId,
    kind: TimerKind,
}

/// A machine's slot for one timer. Armed ⇔ `endtime != NEVER` ⇔ present in
/// the control's timer map under `(endtime, seq)`.
#[derive(Clone, Copy)]
struct TimerSlot {
    endtime: i64,
    seq: u64,
}

impl TimerSlot {
    const UNARMED: TimerSlot = TimerSlot { endtime: time::NEVER, seq: 0 };
}

struct FsmState {
    transitions: &'static [Transition],
    current: Option<&'static State>,
    arg: FsmArg,
    /// An action of this machine is executing (control lock released).
    busy: bool,
    /// Teardown requested; suppresses dispatch, timers and auto-chaining.
    deleting: bool,
    /// `free` was called from within an action; the worker removes the
    /// machine when the action returns.
    pending_free: bool,
    state_timer: TimerSlot,
    overall_timer: TimerSlot,
    overall_action: Option<Action>,
    debug: Option<DebugFn>,
}

struct ControlState {
    running: bool,
    worker_thread: Option<ThreadId>,
    events: VecDeque<Event>,
    timers: BTreeMap<(i64, u64), TimerRef>,
    fsms: HashMap<FsmId, FsmState>,
    next_id: FsmId,
    next_seq: u64,
}

struct ControlShared {
    lock: Mutex<ControlState>,
    cond: Condvar,
}

/// The scheduler: owns the worker thread, the event queue and the timers.
pub struct FsmControl {
    shared: Arc<ControlShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to one machine on a control.
///
/// Cheap to clone; all methods are safe from any thread, including from
/// within the machine's own actions.
#[derive(Clone)]
pub struct Fsm {
    shared: Arc<ControlShared>,
    id: FsmId,
}

impl PartialEq for Fsm {
    fn eq(&self, other: &Fsm) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl Eq for Fsm {}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fsm").field("id", &self.id).finish()
    }
}

fn opt_state_eq(a: Option<&'static State>, b: Option<&'static State>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => ptr::eq(a, b),
        _ => false,
    }
}

fn dispatch_locked(
    shared: &Arc<ControlShared>,
    st: &mut ControlState,
    id: FsmId,
    event_id: i32,
    lifo: bool,
) {
    if let Some(f) = st.fsms.get(&id) {
        if let Some(dbg) = f.debug {
            let fsm = Fsm { shared: shared.clone(), id };
            let act = if lifo { DebugAct::DispatchDirect } else { DebugAct::Dispatch };
            dbg(&fsm, act, f.current, event_id, &f.arg);
        }
        log::trace!("fsm {}: dispatch event {} ({})", id, event_id, if lifo { "lifo" } else { "fifo" });
    }
    let event = Event { fsm: id, event_id };
    if lifo {
        st.events.push_front(event);
    } else {
        st.events.push_back(event);
    }
}

fn arm_state_timer(st: &mut ControlState, id: FsmId) {
    let ControlState { fsms, timers, next_seq, .. } = st;
    let f = match fsms.get_mut(&id) {
        Some(f) => f,
        None => return,
    };
    match f.current {
        Some(state) if state.timeout > 0 && state.timeout != time::NEVER => {
            let endtime = time::add_duration(time::now(), state.timeout);
            let seq = *next_seq;
            *next_seq += 1;
            f.state_timer = TimerSlot { endtime, seq };
            timers.insert((endtime, seq), TimerRef { fsm: id, kind: TimerKind::State });
        }
        _ => f.state_timer = TimerSlot::UNARMED,
    }
}

fn clear_state_timer(st: &mut ControlState, id: FsmId) {
    let ControlState { fsms, timers, .. } = st;
    if let Some(f) = fsms.get_mut(&id) {
        if f.state_timer.endtime != time::NEVER {
            let removed = timers.remove(&(f.state_timer.endtime, f.state_timer.seq));
            debug_assert!(removed.is_some());
        }
        f.state_timer = TimerSlot::UNARMED;
    }
}

fn clear_overall_timer(st: &mut ControlState, id: FsmId) {
    let ControlState { fsms, timers, .. } = st;
    if let Some(f) = fsms.get_mut(&id) {
        if f.overall_timer.endtime != time::NEVER {
            let removed = timers.remove(&(f.overall_timer.endtime, f.overall_timer.seq));
            debug_assert!(removed.is_some());
        }
        f.overall_timer = TimerSlot::UNARMED;
    }
}

fn first_timeout(st: &ControlState) -> i64 {
    st.timers.keys().next().map(|&(t, _)| t).unwrap_or(time::NEVER)
}

/// Cancels everything queued or armed for the machine and detaches it from
/// its current state. The machine stays allocated until `free`.
fn deactivate(st: &mut ControlState, id: FsmId) {
    clear_state_timer(st, id);
    clear_overall_timer(st, id);
    st.events.retain(|e| e.fsm != id);
    if let Some(f) = st.fsms.get_mut(&id) {
        f.deleting = true;
        f.current = None;
    }
}

fn check_auto_state_change(shared: &Arc<ControlShared>, st: &mut ControlState, id: FsmId) {
    let current = match st.fsms.get(&id) {
        Some(f) => match f.current {
            Some(c) => c,
            None => return,
        },
        None => return,
    };
    let has_auto = match st.fsms.get(&id) {
        Some(f) => f
            .transitions
            .iter()
            .any(|t| opt_state_eq(t.begin, Some(current)) && t.event_id == EVENT_AUTO),
        None => false,
    };
    if has_auto {
        dispatch_locked(shared, st, id, EVENT_AUTO, true);
    }
}

fn fsm_state_change<'a>(
    shared: &'a Arc<ControlShared>,
    mut st: MutexGuard<'a, ControlState>,
    ev: Event,
) -> MutexGuard<'a, ControlState> {
    let id = ev.fsm;
    let (transition, arg) = {
        let f = match st.fsms.get(&id) {
            Some(f) => f,
            None => return st,
        };
        if let Some(dbg) = f.debug {
            let fsm = Fsm { shared: shared.clone(), id };
            dbg(&fsm, DebugAct::Handling, f.current, ev.event_id, &f.arg);
        }
        let transition = f
            .transitions
            .iter()
            .find(|t| opt_state_eq(t.begin, f.current) && t.event_id == ev.event_id);
        match transition {
            // No transition for this event in the current state: drop it.
            None => return st,
            Some(t) => (t, f.arg.clone()),
        }
    };

    clear_state_timer(&mut st, id);
    if let Some(f) = st.fsms.get_mut(&id) {
        f.current = transition.end;
        f.busy = true;
    }
    arm_state_timer(&mut st, id);
    let fsm = Fsm { shared: shared.clone(), id };

    drop(st);
    if let Some(action) = transition.action {
        action(&fsm, &arg);
    }
    st = shared.lock.lock();

    // The transition action may have stopped or deleted the machine, in
    // which case the new state's entry action is skipped.
    let entry = match st.fsms.get(&id) {
        Some(f) if !f.deleting && opt_state_eq(f.current, transition.end) => {
            transition.end.and_then(|s| s.entry)
        }
        _ => None,
    };
    if let Some(entry) = entry {
        drop(st);
        entry(&fsm, &arg);
        st = shared.lock.lock();
    }

    let (pending_free, deleting) = match st.fsms.get_mut(&id) {
        Some(f) => {
            f.busy = false;
            (f.pending_free, f.deleting)
        }
        None => (false, true),
    };
    if pending_free {
        st.fsms.remove(&id);
        shared.cond.notify_all();
    } else if !deleting {
        check_auto_state_change(shared, &mut st, id);
    } else {
        shared.cond.notify_all();
    }
    st
}

fn fsm_handle_timeout<'a>(
    shared: &'a Arc<ControlShared>,
    mut st: MutexGuard<'a, ControlState>,
    tref: TimerRef,
) -> MutexGuard<'a, ControlState> {
    match tref.kind {
        TimerKind::State => {
            // Preempts older queued events for this machine.
            dispatch_locked(shared, &mut st, tref.fsm, EVENT_TIMEOUT, true);
        }
        TimerKind::Overall => {
            let id = tref.fsm;
            let (action, arg) = match st.fsms.get_mut(&id) {
                Some(f) => match f.overall_action {
                    Some(action) => {
                        // Busy here too, so `free` from another thread waits
                        // for the callback to return.
                        f.busy = true;
                        (action, f.arg.clone())
                    }
                    None => return st,
                },
                None => return st,
            };
            let fsm = Fsm { shared: shared.clone(), id };
            drop(st);
            action(&fsm, &arg);
            st = shared.lock.lock();
            let pending_free = match st.fsms.get_mut(&id) {
                Some(f) => {
                    f.busy = false;
                    if f.deleting {
                        shared.cond.notify_all();
                    }
                    f.pending_free
                }
                None => false,
            };
            if pending_free {
                st.fsms.remove(&id);
                shared.cond.notify_all();
            }
        }
    }
    st
}

fn handle_events(shared: Arc<ControlShared>) {
    let mut st = shared.lock.lock();
    st.worker_thread = Some(thread::current().id());
    while st.running {
        if let Some(event) = st.events.pop_front() {
            st = fsm_state_change(&shared, st, event);
        } else {
            let timeout = first_timeout(&st);
            if timeout > time::now() {
                if timeout == time::NEVER {
                    shared.cond.wait(&mut st);
                } else {
                    let _ = shared.cond.wait_until(&mut st, time::instant_at(timeout));
                }
            } else {
                let (key, tref) = match st.timers.iter().next() {
                    Some((&key, &tref)) => (key, tref),
                    None => continue,
                };
                st.timers.remove(&key);
                // Maintain the invariant that armed ⇔ endtime != NEVER.
                if let Some(f) = st.fsms.get_mut(&tref.fsm) {
                    match tref.kind {
                        TimerKind::State => f.state_timer = TimerSlot::UNARMED,
                        TimerKind::Overall => f.overall_timer = TimerSlot::UNARMED,
                    }
                }
                st = fsm_handle_timeout(&shared, st, tref);
            }
        }
    }
    st.worker_thread = None;
}

impl FsmControl {
    /// Creates a control with no worker thread yet.
    pub fn new() -> FsmControl {
        FsmControl {
            shared: Arc::new(ControlShared {
                lock: Mutex::new(ControlState {
                    running: false,
                    worker_thread: None,
                    events: VecDeque::new(),
                    timers: BTreeMap::new(),
                    fsms: HashMap::new(),
                    next_id: 1,
                    next_seq: 0,
                }),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread under the given name.
    pub fn start(&self, name: &str) -> Result<()> {
        self.shared.lock.lock().running = true;
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name(name.to_string())
            .spawn(move || handle_events(shared))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.shared.lock.lock().running = false;
                Err(Error::OutOfResources)
            }
        }
    }

    /// Signals the worker to exit and joins it.
    pub fn stop(&self) {
        {
            let mut st = self.shared.lock.lock();
            st.running = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Creates a machine on this control. It does not run until
    /// [`Fsm::start`].
    pub fn create_fsm(&self, transitions: &'static [Transition], arg: FsmArg) -> Fsm {
        debug_assert!(!transitions.is_empty());
        debug_assert!(transitions
            .iter()
            .any(|t| t.begin.is_none() && t.event_id == EVENT_AUTO));
        let mut st = self.shared.lock.lock();
        let id = st.next_id;
        st.next_id += 1;
        st.fsms.insert(
            id,
            FsmState {
                transitions,
                current: None,
                arg,
                busy: false,
                deleting: false,
                pending_free: false,
                state_timer: TimerSlot::UNARMED,
                overall_timer: TimerSlot::UNARMED,
                overall_action: None,
                debug: None,
            },
        );
        Fsm { shared: self.shared.clone(), id }
    }
}

impl Default for FsmControl {
    fn default() -> Self {
        FsmControl::new()
    }
}

impl Drop for FsmControl {
    fn drop(&mut self) {
        let running = self.shared.lock.lock().running;
        if running {
            self.stop();
        }
    }
}

impl Fsm {
    /// Starts the machine by dispatching the initial AUTO transition.
    pub fn start(&self) {
        self.dispatch(EVENT_AUTO, false);
    }

    /// Enqueues an event for this machine. `prio` prepends it, overtaking
    /// older queued events. Dispatching from within an action is permitted.
    pub fn dispatch(&self, event_id: i32, prio: bool) {
        let mut st = self.shared.lock.lock();
        let deleting = match st.fsms.get(&self.id) {
            Some(f) => f.deleting,
            None => return,
        };
        if !deleting {
            dispatch_locked(&self.shared, &mut st, self.id, event_id, prio);
            self.shared.cond.notify_all();
        }
    }

    /// Arms (or re-arms) the overall timeout: `action` fires once after
    /// `timeout` nanoseconds. Re-arming clears the previous arming;
    /// [`time::NEVER`] clears without arming.
    pub fn set_timeout(&self, action: Action, timeout: i64) {
        assert!(timeout > 0);
        let mut st = self.shared.lock.lock();
        let deleting = match st.fsms.get(&self.id) {
            Some(f) => f.deleting,
            None => return,
        };
        if deleting {
            return;
        }
        clear_overall_timer(&mut st, self.id);
        if timeout != time::NEVER {
            let endtime = time::add_duration(time::now(), timeout);
            let ControlState { fsms, timers, next_seq, .. } = &mut *st;
            if let Some(f) = fsms.get_mut(&self.id) {
                f.overall_action = Some(action);
                let seq = *next_seq;
                *next_seq += 1;
                f.overall_timer = TimerSlot { endtime, seq };
                timers.insert((endtime, seq), TimerRef { fsm: self.id, kind: TimerKind::Overall });
            }
            // The worker may be sleeping past the new deadline.
            self.shared.cond.notify_all();
        }
    }

    /// Installs or removes the debug hook.
    pub fn set_debug(&self, debug: Option<DebugFn>) {
        let mut st = self.shared.lock.lock();
        if let Some(f) = st.fsms.get_mut(&self.id) {
            f.debug = debug;
        }
    }

    /// True iff the machine is in a state or an action of it is executing.
    pub fn running(&self) -> bool {
        let st = self.shared.lock.lock();
        match st.fsms.get(&self.id) {
            Some(f) => f.current.is_some() || f.busy,
            None => false,
        }
    }

    /// Cancels queued events and timers and detaches the machine from its
    /// state. The machine cannot be used afterwards, except to [`free`] it.
    ///
    /// [`free`]: Fsm::free
    pub fn stop(&self) {
        let mut st = self.shared.lock.lock();
        if st.fsms.contains_key(&self.id) {
            deactivate(&mut st, self.id);
        }
    }

    /// Stops and removes the machine.
    ///
    /// From any thread other than the worker this blocks until a concurrent
    /// action of this machine has returned; afterwards no callback of the
    /// machine will ever run. From within one of the machine's own actions
    /// it does not block: the worker completes the removal when the action
    /// returns.
    pub fn free(&self) {
        let mut st = self.shared.lock.lock();
        if !st.fsms.contains_key(&self.id) {
            return;
        }
        deactivate(&mut st, self.id);

        let on_worker = st.worker_thread == Some(thread::current().id());
        if on_worker {
            let busy = match st.fsms.get_mut(&self.id) {
                Some(f) => {
                    if f.busy {
                        f.pending_free = true;
                    }
                    f.busy
                }
                None => false,
            };
            if !busy {
                st.fsms.remove(&self.id);
            }
            return;
        }

        loop {
            match st.fsms.get(&self.id) {
                Some(f) if f.busy => self.shared.cond.wait(&mut st),
                _ => break,
            }
        }
        st.fsms.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[derive(Default)]
    struct CtxState {
        visited: Vec<&'static str>,
        validate_count: u32,
        times: Vec<i64>,
        cb_count: u32,
    }

    #[derive(Default)]
    struct Ctx {
        lock: Mutex<CtxState>,
        cond: Condvar,
    }

    fn ctx(arg: &FsmArg) -> &Ctx {
        arg.downcast_ref::<Ctx>().expect("wrong arg type")
    }

    fn record(arg: &FsmArg, tag: &'static str) {
        let c = ctx(arg);
        c.lock.lock().visited.push(tag);
        c.cond.notify_all();
    }

    fn wait_until<F: Fn(&CtxState) -> bool>(c: &Ctx, pred: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut s = c.lock.lock();
        while !pred(&s) {
            if c.cond.wait_until(&mut s, deadline).timed_out() {
                panic!("condition not reached in time");
            }
        }
    }

    fn new_ctx() -> (FsmArg, Arc<Ctx>) {
        let c = Arc::new(Ctx::default());
        let arg: FsmArg = c.clone();
        (arg, c)
    }

    // A few states of the handshake state machine: validation retries on a
    // 100 ms state timeout, then waits for the peer's message, replies, and
    // terminates on success.
    const VALIDATION_PENDING_RETRY: i32 = 0;
    const VALIDATION_OK: i32 = 1;
    const VALIDATION_PENDING_HANDSHAKE_MESSAGE: i32 = 2;
    const SHM_MSG_RECEIVED: i32 = 3;

    fn act_a(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "a");
    }
    fn act_b(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "b");
    }
    fn act_c(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "c");
    }
    fn act_d(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "d");
    }
    fn act_e(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "e");
    }
    fn act_g(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "g");
    }

    fn validate_remote_identity(fsm: &Fsm, arg: &FsmArg) {
        let c = ctx(arg);
        let first = {
            let mut s = c.lock.lock();
            s.validate_count += 1;
            s.validate_count == 1
        };
        fsm.dispatch(
            if first { VALIDATION_PENDING_RETRY } else { VALIDATION_PENDING_HANDSHAKE_MESSAGE },
            false,
        );
    }

    fn on_msg_wait(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "msg_wait");
    }

    fn begin_handshake_reply(fsm: &Fsm, arg: &FsmArg) {
        record(arg, "reply");
        fsm.dispatch(VALIDATION_OK, false);
    }

    static STATE_VALIDATE: State = State { entry: Some(validate_remote_identity), timeout: 0 };
    static STATE_RETRY_WAIT: State = State { entry: None, timeout: time::msecs(100) };
    static STATE_MSG_WAIT: State = State { entry: Some(on_msg_wait), timeout: 0 };
    static STATE_REPLY: State = State { entry: Some(begin_handshake_reply), timeout: 0 };

    static HANDSHAKE: [Transition; 6] = [
        Transition { begin: None, event_id: EVENT_AUTO, action: Some(act_a), end: Some(&STATE_VALIDATE) },
        Transition {
            begin: Some(&STATE_VALIDATE),
            event_id: VALIDATION_PENDING_RETRY,
            action: Some(act_b),
            end: Some(&STATE_RETRY_WAIT),
        },
        Transition {
            begin: Some(&STATE_VALIDATE),
            event_id: VALIDATION_PENDING_HANDSHAKE_MESSAGE,
            action: Some(act_c),
            end: Some(&STATE_MSG_WAIT),
        },
        Transition {
            begin: Some(&STATE_RETRY_WAIT),
            event_id: EVENT_TIMEOUT,
            action: Some(act_d),
            end: Some(&STATE_VALIDATE),
        },
        Transition {
            begin: Some(&STATE_MSG_WAIT),
            event_id: SHM_MSG_RECEIVED,
            action: Some(act_e),
            end: Some(&STATE_REPLY),
        },
        Transition { begin: Some(&STATE_REPLY), event_id: VALIDATION_OK, action: Some(act_g), end: None },
    ];

    #[test]
    fn handshake_scenario() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&HANDSHAKE, arg);
        fsm.start();

        wait_until(&c, |s| s.visited.contains(&"msg_wait"));
        fsm.dispatch(SHM_MSG_RECEIVED, false);
        wait_until(&c, |s| s.visited.contains(&"g"));

        let deadline = Instant::now() + Duration::from_secs(10);
        while fsm.running() {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        assert_eq!(
            c.lock.lock().visited,
            vec!["a", "b", "d", "c", "msg_wait", "e", "reply", "g"]
        );

        fsm.free();
        control.stop();
    }

    static STATE_IDLE: State = State { entry: None, timeout: 0 };
    static IDLE_TABLE: [Transition; 1] =
        [Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_IDLE) }];

    fn overall_cb(_fsm: &Fsm, arg: &FsmArg) {
        let c = ctx(arg);
        {
            let mut s = c.lock.lock();
            s.cb_count += 1;
            s.times.push(time::now());
        }
        c.cond.notify_all();
    }

    #[test]
    fn overall_timeout_fires_once() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&IDLE_TABLE, arg);
        fsm.start();

        let t0 = time::now();
        fsm.set_timeout(overall_cb, time::secs(1));
        wait_until(&c, |s| s.cb_count == 1);
        let dt = c.lock.lock().times[0] - t0;
        assert!(dt >= time::msecs(750) && dt <= time::msecs(2000), "dt = {dt}");

        fsm.free();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(c.lock.lock().cb_count, 1);
        control.stop();
    }

    #[test]
    fn overall_timeout_cancelled_by_free() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&IDLE_TABLE, arg);
        fsm.start();
        fsm.set_timeout(overall_cb, time::msecs(200));
        fsm.free();
        thread::sleep(Duration::from_millis(500));
        assert_eq!(c.lock.lock().cb_count, 0);
        control.stop();
    }

    #[test]
    fn overall_timeout_rearm_replaces() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&IDLE_TABLE, arg);
        fsm.start();

        let t0 = time::now();
        fsm.set_timeout(overall_cb, time::secs(30));
        fsm.set_timeout(overall_cb, time::msecs(100));
        wait_until(&c, |s| s.cb_count == 1);
        let dt = c.lock.lock().times[0] - t0;
        assert!(dt < time::secs(5), "dt = {dt}");

        fsm.free();
        control.stop();
    }

    fn timed_out(_fsm: &Fsm, arg: &FsmArg) {
        let c = ctx(arg);
        c.lock.lock().times.push(time::now());
        c.cond.notify_all();
    }

    static STATE_PAR_1S: State = State { entry: None, timeout: time::secs(1) };
    static STATE_PAR_2S: State = State { entry: None, timeout: time::secs(2) };
    static PAR_1S: [Transition; 2] = [
        Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_PAR_1S) },
        Transition { begin: Some(&STATE_PAR_1S), event_id: EVENT_TIMEOUT, action: Some(timed_out), end: None },
    ];
    static PAR_2S: [Transition; 2] = [
        Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_PAR_2S) },
        Transition { begin: Some(&STATE_PAR_2S), event_id: EVENT_TIMEOUT, action: Some(timed_out), end: None },
    ];

    #[test]
    fn parallel_state_timeouts() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let ctxs: Vec<_> = (0..3).map(|_| new_ctx()).collect();
        let tables: [&'static [Transition]; 3] = [&PAR_1S, &PAR_2S, &PAR_1S];
        let t0 = time::now();
        let fsms: Vec<_> = ctxs
            .iter()
            .zip(tables)
            .map(|((arg, _), table)| {
                let fsm = control.create_fsm(table, arg.clone());
                fsm.start();
                fsm
            })
            .collect();

        let expected = [time::secs(1), time::secs(2), time::secs(1)];
        for ((_, c), expected) in ctxs.iter().zip(expected) {
            wait_until(c, |s| !s.times.is_empty());
            let dt = c.lock.lock().times[0] - t0;
            assert!((dt - expected).abs() <= time::msecs(250), "dt = {dt}, expected {expected}");
        }

        for fsm in fsms {
            fsm.free();
        }
        control.stop();
    }

    fn act_chain_1(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "chain-1");
    }
    fn act_chain_2(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "chain-2");
    }

    static STATE_CHAIN_1: State = State { entry: Some(act_chain_1), timeout: 0 };
    static STATE_CHAIN_2: State = State { entry: Some(act_chain_2), timeout: 0 };
    static CHAIN: [Transition; 2] = [
        Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_CHAIN_1) },
        Transition { begin: Some(&STATE_CHAIN_1), event_id: EVENT_AUTO, action: None, end: Some(&STATE_CHAIN_2) },
    ];

    #[test]
    fn auto_chain_advances_without_events() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&CHAIN, arg);
        fsm.start();
        wait_until(&c, |s| s.visited.contains(&"chain-2"));
        assert_eq!(c.lock.lock().visited, vec!["chain-1", "chain-2"]);
        assert!(fsm.running());
        fsm.free();
        control.stop();
    }

    fn act_self_free(fsm: &Fsm, arg: &FsmArg) {
        record(arg, "self-free");
        fsm.free();
    }

    static STATE_SELF_FREE: State = State { entry: Some(act_self_free), timeout: 0 };
    static SELF_FREE: [Transition; 1] =
        [Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_SELF_FREE) }];

    #[test]
    fn free_from_within_action() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&SELF_FREE, arg);
        fsm.start();
        wait_until(&c, |s| s.visited.contains(&"self-free"));

        let deadline = Instant::now() + Duration::from_secs(10);
        while fsm.running() {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        // Dispatch on a freed machine is a no-op.
        fsm.dispatch(42, false);
        fsm.free();
        control.stop();
    }

    fn act_slow(_fsm: &Fsm, arg: &FsmArg) {
        record(arg, "slow");
        thread::sleep(Duration::from_millis(500));
    }

    static STATE_SLOW: State = State { entry: Some(act_slow), timeout: 0 };
    static SLOW: [Transition; 1] =
        [Transition { begin: None, event_id: EVENT_AUTO, action: None, end: Some(&STATE_SLOW) }];

    #[test]
    fn free_waits_for_running_action() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&SLOW, arg);
        fsm.start();
        wait_until(&c, |s| s.visited.contains(&"slow"));

        let before = Instant::now();
        fsm.free();
        assert!(before.elapsed() >= Duration::from_millis(100));
        assert!(!fsm.running());
        control.stop();
    }

    #[test]
    fn stop_detaches_the_machine() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&CHAIN, arg);
        fsm.start();
        wait_until(&c, |s| s.visited.contains(&"chain-2"));
        fsm.stop();
        let deadline = Instant::now() + Duration::from_secs(10);
        while fsm.running() {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        // Events after stop are ignored.
        fsm.dispatch(EVENT_AUTO, false);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(c.lock.lock().visited, vec!["chain-1", "chain-2"]);
        fsm.free();
        control.stop();
    }

    fn count_debug(_fsm: &Fsm, _act: DebugAct, _state: Option<&'static State>, _ev: i32, arg: &FsmArg) {
        ctx(arg).lock.lock().cb_count += 1;
    }

    #[test]
    fn debug_hook_sees_dispatch_and_handling() {
        let control = FsmControl::new();
        control.start("fsm").unwrap();
        let (arg, c) = new_ctx();
        let fsm = control.create_fsm(&IDLE_TABLE, arg);
        fsm.set_debug(Some(count_debug));
        fsm.start();
        let deadline = Instant::now() + Duration::from_secs(10);
        // One dispatch plus one handling of the initial AUTO event.
        while c.lock.lock().cb_count < 2 {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        fsm.free();
        control.stop();
    }
}
