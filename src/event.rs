//! Completion events.
//!
//! An [`Event`] is the completion primitive handed back from every
//! submission. It carries an execution status, four profiling timestamps and
//! a list of status-threshold callbacks, and comes in three closed variants:
//!
//! - **Command event**: produced by a queue for a submitted command. Its
//!   waitable is a timeline [`ConditionVariable`] bound to the queue's
//!   semaphore, so the driver can complete it without host coordination.
//! - **Combined event**: a pair of (start, end) events standing in for a
//!   whole batch. Status is the minimum of the two; waiting delegates to the
//!   end event.
//! - **User event**: created by the application, completed or errored from
//!   the host via [`Event::set_user_event_status`]. Backed by a host
//!   condition variable since there is no device-side signal.
//!
//! # Status model
//!
//! Execution statuses are the wire values in [`status`]: `QUEUED` (3) down to
//! `COMPLETE` (0), with any negative value a terminal error. Status only
//! decreases, and once it reaches `COMPLETE` or a negative value it is frozen.
//! A callback registered for threshold `T` fires exactly once: immediately if
//! the status is already at or below `T`, otherwise when the status first
//! crosses it. Callbacks always run with the event lock released, so they may
//! call back into the API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use smallvec::SmallVec;

use crate::command::CommandType;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::object::ObjectMagic;
use crate::queue::Queue;
use crate::sync::ConditionVariable;
use crate::tracking;

/// Execution status values, as surfaced through the host API.
///
/// Negative values are terminal errors; [`ERROR_WAIT_LIST`](status::ERROR_WAIT_LIST)
/// is the one produced by this crate when a wait-list dependency fails.
pub mod status {
    pub const QUEUED: i32 = 3;
    pub const SUBMITTED: i32 = 2;
    pub const RUNNING: i32 = 1;
    pub const COMPLETE: i32 = 0;
    pub const ERROR_WAIT_LIST: i32 = crate::Error::ExecStatusErrorForEventsInWaitList.code();
}

/// Profiling timestamp selector, with OpenCL wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ProfilingInfo {
    Queued = 0x1280,
    Submit = 0x1281,
    Start = 0x1282,
    End = 0x1283,
}

impl ProfilingInfo {
    fn index(self) -> usize {
        self as usize - ProfilingInfo::Queued as usize
    }
}

/// Nanoseconds on a steady monotonic host clock.
pub(crate) fn sample_clock() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

type Callback = Box<dyn FnOnce(&Event, i32) + Send>;

/// Handle to an event. Cloning retains, dropping releases.
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

struct EventInner {
    #[allow(dead_code)]
    context: Context,
    command_type: CommandType,
    queue: Option<Queue>,
    kind: EventKind,
}

enum EventKind {
    Command(CommandState),
    Combined { start: Event, end: Event },
}

struct CommandState {
    state: Mutex<EventState>,
    cv: ConditionVariable,
}

struct EventState {
    status: i32,
    profiling: [u64; 4],
    callbacks: HashMap<i32, Vec<Callback>>,
}

/// Applies a status transition to locked event state.
///
/// Returns `false` without touching anything when the event is already
/// frozen or the new status would not be a decrease.
fn advance(st: &mut EventState, new_status: i32) -> bool {
    if st.status <= status::COMPLETE || new_status >= st.status {
        return false;
    }
    match new_status {
        status::SUBMITTED => st.profiling[ProfilingInfo::Submit.index()] = sample_clock(),
        status::RUNNING => st.profiling[ProfilingInfo::Start.index()] = sample_clock(),
        status::COMPLETE => st.profiling[ProfilingInfo::End.index()] = sample_clock(),
        _ => {}
    }
    st.status = new_status;
    true
}

/// Removes every callback whose threshold the current status has crossed,
/// in descending threshold order.
fn take_crossed_callbacks(st: &mut EventState) -> Vec<Callback> {
    let mut thresholds: SmallVec<[i32; 4]> = st
        .callbacks
        .keys()
        .copied()
        .filter(|t| *t >= st.status)
        .collect();
    thresholds.sort_unstable_by(|a, b| b.cmp(a));
    let mut fired = Vec::new();
    for t in thresholds {
        fired.extend(st.callbacks.remove(&t).unwrap());
    }
    fired
}

impl Event {
    fn build(
        context: Context,
        command_type: CommandType,
        queue: Option<Queue>,
        kind: EventKind,
        desc: &str,
    ) -> Event {
        let vm = tracking::vm_snapshot_kb();
        let inner = Arc::new(EventInner {
            context,
            command_type,
            queue,
            kind,
        });
        tracking::track_new(Arc::as_ptr(&inner) as usize, ObjectMagic::Event, desc, vm);
        Event(inner)
    }

    /// An event for a command submitted to `queue`, waitable through `cv`.
    pub(crate) fn new_command(
        queue: &Queue,
        command_type: CommandType,
        cv: ConditionVariable,
    ) -> Event {
        let mut profiling = [0u64; 4];
        profiling[ProfilingInfo::Queued.index()] = sample_clock();
        Self::build(
            queue.context().clone(),
            command_type,
            Some(queue.clone()),
            EventKind::Command(CommandState {
                state: Mutex::new(EventState {
                    status: status::QUEUED,
                    profiling,
                    callbacks: HashMap::new(),
                }),
                cv,
            }),
            "command event",
        )
    }

    /// Creates a user event. Its status starts at `QUEUED` and is driven
    /// exclusively by [`set_user_event_status`](Self::set_user_event_status).
    pub fn new_user(context: &Context) -> Event {
        Self::build(
            context.clone(),
            CommandType::User,
            None,
            EventKind::Command(CommandState {
                state: Mutex::new(EventState {
                    status: status::QUEUED,
                    profiling: [0; 4],
                    callbacks: HashMap::new(),
                }),
                cv: ConditionVariable::host(),
            }),
            "user event",
        )
    }

    /// An event spanning `start` and `end`, both retained.
    pub(crate) fn new_combined(queue: &Queue, start: Event, end: Event) -> Event {
        Self::build(
            queue.context().clone(),
            CommandType::CommandBuffer,
            Some(queue.clone()),
            EventKind::Combined { start, end },
            "combined event",
        )
    }

    pub fn command_type(&self) -> CommandType {
        self.0.command_type
    }

    pub fn is_user_event(&self) -> bool {
        self.0.command_type == CommandType::User
    }

    /// The queue this event is bound to; `None` for user events.
    pub fn queue(&self) -> Option<&Queue> {
        self.0.queue.as_ref()
    }

    /// The reference count visible to the host API.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Current execution status.
    ///
    /// For command events this first polls the condition variable: a timeline
    /// counter may have reached its target without anyone updating the
    /// status, in which case the event transitions to `COMPLETE` here (with
    /// profiling and callback side effects).
    pub fn get_status(&self) -> i32 {
        match &self.0.kind {
            EventKind::Command(cs) => {
                if cs.cv.is_complete() {
                    self.transition(cs, status::COMPLETE);
                }
                cs.state.lock().unwrap().status
            }
            EventKind::Combined { start, end } => start.get_status().min(end.get_status()),
        }
    }

    pub fn completed(&self) -> bool {
        self.get_status() == status::COMPLETE
    }

    pub fn terminated(&self) -> bool {
        self.get_status() < status::COMPLETE
    }

    /// Moves a command event to `new_status`, firing crossed callbacks and
    /// recording boundary profiling timestamps. Frozen events and
    /// non-decreasing updates are ignored. Returns whether the status moved.
    pub(crate) fn set_status(&self, new_status: i32) -> bool {
        let EventKind::Command(cs) = &self.0.kind else {
            unreachable!("set_status on a combined event");
        };
        self.transition(cs, new_status)
    }

    fn transition(&self, cs: &CommandState, new_status: i32) -> bool {
        let fired;
        let snapshot;
        {
            let mut st = cs.state.lock().unwrap();
            if !advance(&mut st, new_status) {
                return false;
            }
            tracing::debug!(
                command_type = ?self.0.command_type,
                status = st.status,
                "event transition"
            );
            fired = take_crossed_callbacks(&mut st);
            snapshot = st.status;
        }
        if cs.cv.is_host() {
            cs.cv.notify();
        }
        for cb in fired {
            cb(self, snapshot);
        }
        true
    }

    /// Completes (`0`) or terminally errors (negative) a user event.
    ///
    /// Fails with `InvalidEvent` on non-user events, `InvalidValue` for
    /// positive statuses, and `InvalidOperation` if the status was already
    /// set.
    pub fn set_user_event_status(&self, new_status: i32) -> Result<()> {
        if !self.is_user_event() {
            return Err(Error::InvalidEvent);
        }
        if new_status > status::COMPLETE {
            return Err(Error::InvalidValue);
        }
        if self.set_status(new_status) {
            Ok(())
        } else {
            Err(Error::InvalidOperation)
        }
    }

    /// Registers `callback` to run when the status reaches `threshold`.
    ///
    /// Runs it on the calling thread right away if the status is already at
    /// or below the threshold. On combined events, `COMPLETE` callbacks
    /// attach to the end event and everything else to the start event.
    pub fn register_callback(
        &self,
        threshold: i32,
        callback: impl FnOnce(&Event, i32) + Send + 'static,
    ) {
        match &self.0.kind {
            EventKind::Combined { start, end } => {
                if threshold == status::COMPLETE {
                    end.register_callback(threshold, callback);
                } else {
                    start.register_callback(threshold, callback);
                }
            }
            EventKind::Command(cs) => {
                let mut st = cs.state.lock().unwrap();
                if st.status <= threshold {
                    let snapshot = st.status;
                    drop(st);
                    callback(self, snapshot);
                } else {
                    st.callbacks
                        .entry(threshold)
                        .or_default()
                        .push(Box::new(callback));
                }
            }
        }
    }

    /// Blocks until the event leaves the executing states, returning the
    /// final status. With `poll`, the timeline variant busy-polls before
    /// blocking.
    ///
    /// A timeline counter can complete without updating the event, so on a
    /// successful wait the `COMPLETE` transition (profiling, callbacks) is
    /// applied here. A failed wait terminates the event with
    /// [`status::ERROR_WAIT_LIST`].
    pub fn wait(&self, poll: bool) -> i32 {
        let cs = match &self.0.kind {
            EventKind::Combined { end, .. } => return end.wait(poll),
            EventKind::Command(cs) => cs,
        };
        let fired;
        let snapshot;
        {
            let mut st = cs.state.lock().unwrap();
            let mut pending = Vec::new();
            while st.status > status::COMPLETE {
                let (guard, ok) = cs.cv.wait(st, &cs.state, poll);
                st = guard;
                if !ok {
                    if advance(&mut st, status::ERROR_WAIT_LIST) {
                        pending = take_crossed_callbacks(&mut st);
                    }
                    break;
                }
                if cs.cv.is_complete() {
                    if advance(&mut st, status::COMPLETE) {
                        pending = take_crossed_callbacks(&mut st);
                    }
                    break;
                }
                // Host-variant wakeup: re-check the status predicate.
            }
            fired = pending;
            snapshot = st.status;
        }
        // Both transitions above only happen on the timeline variant, so
        // there are no host waiters to notify here.
        for cb in fired {
            cb(self, snapshot);
        }
        snapshot
    }

    /// One of the four profiling timestamps, in host-clock nanoseconds.
    ///
    /// Unavailable for user events, for events whose queue was created
    /// without [`QUEUE_PROFILING_ENABLE`](crate::queue::QUEUE_PROFILING_ENABLE),
    /// and until the event reaches `COMPLETE`. Combined events answer with
    /// the start event's value for everything except `End`.
    pub fn profiling_info(&self, info: ProfilingInfo) -> Result<u64> {
        match &self.0.kind {
            EventKind::Combined { start, end } => {
                if info == ProfilingInfo::End {
                    end.profiling_info(info)
                } else {
                    start.profiling_info(info)
                }
            }
            EventKind::Command(cs) => {
                let queue = self.0.queue.as_ref().ok_or(Error::ProfilingInfoNotAvailable)?;
                if !queue.profiling_enabled() {
                    return Err(Error::ProfilingInfoNotAvailable);
                }
                if self.get_status() != status::COMPLETE {
                    return Err(Error::ProfilingInfoNotAvailable);
                }
                Ok(cs.state.lock().unwrap().profiling[info.index()])
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("command_type", &self.0.command_type)
            .field("status", &self.get_status())
            .finish()
    }
}

impl Drop for EventInner {
    fn drop(&mut self) {
        tracking::track_drop(self as *const EventInner as usize, ObjectMagic::Event);
    }
}

/// Waits for every event in `events`, then fails with
/// `ExecStatusErrorForEventsInWaitList` if any of them ended in an error.
pub fn wait_for_events(events: &[Event]) -> Result<()> {
    for event in events {
        event.wait(false);
    }
    if events.iter().any(|e| e.terminated()) {
        return Err(Error::ExecStatusErrorForEventsInWaitList);
    }
    Ok(())
}
