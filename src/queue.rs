//! Queue management and in-order command submission.
//!
//! # Overview
//!
//! A [`Queue`] accepts commands and executes them on a dedicated worker
//! thread, strictly in submission order. Each submission is assigned the next
//! value on the queue's timeline semaphore; the worker advances the timeline
//! to that value once the command's final status is in place, which is what
//! wakes host-side waiters and lets events observe completion lazily.
//!
//! Submission hands back a freshly retained [`Event`] per command. Wait-list
//! dependencies are waited on by the worker before execution; if any of them
//! ended in an error the command is skipped and its event terminates with
//! [`status::ERROR_WAIT_LIST`].
//!
//! The submission channel is bounded. A full channel rejects the submission
//! with `OutOfResources` and leaves the command detached from any event,
//! which is the backpressure surface command buffers report to callers.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use smallvec::SmallVec;

use crate::command::Command;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::{Event, status};
use crate::object::ObjectMagic;
use crate::sync::{ConditionVariable, HostSemaphore, Semaphore};
use crate::tracking;

/// Queue property bit: submissions may be reordered. Accepted for API
/// compatibility; execution is in-order regardless.
pub const QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE: u64 = 1 << 0;
/// Queue property bit: events on this queue record profiling timestamps.
pub const QUEUE_PROFILING_ENABLE: u64 = 1 << 1;

/// Submission channel capacity used by [`Queue::new`].
pub const DEFAULT_SUBMIT_CAPACITY: usize = 1024;

/// Handle to a command queue. Cloning retains, dropping releases.
///
/// Handles compare and hash by queue identity, so they can key the per-queue
/// command maps in command buffers.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

struct QueueInner {
    context: Context,
    properties: u64,
    timeline: Arc<dyn Semaphore>,
    submit: Mutex<SubmitState>,
}

/// Sender and counter live under one lock so that channel order matches
/// timeline value order.
struct SubmitState {
    sender: Sender<Submission>,
    next_value: u64,
}

struct Submission {
    command: Command,
    event: Event,
    value: u64,
}

impl Queue {
    pub fn new(context: &Context, properties: u64) -> Result<Queue> {
        Self::with_capacity(context, properties, DEFAULT_SUBMIT_CAPACITY)
    }

    /// A queue whose submission channel holds at most `capacity` pending
    /// commands before submissions fail with `OutOfResources`.
    pub fn with_capacity(context: &Context, properties: u64, capacity: usize) -> Result<Queue> {
        Self::with_timeline(
            context,
            properties,
            capacity,
            Arc::new(HostSemaphore::new(0)),
        )
    }

    /// A queue signalling completion through a caller-provided timeline.
    /// Driver integrations substitute their device-backed [`Semaphore`] here.
    pub fn with_timeline(
        context: &Context,
        properties: u64,
        capacity: usize,
        timeline: Arc<dyn Semaphore>,
    ) -> Result<Queue> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        spawn_worker(timeline.clone(), receiver)?;
        let vm = tracking::vm_snapshot_kb();
        let inner = Arc::new(QueueInner {
            context: context.clone(),
            properties,
            timeline,
            submit: Mutex::new(SubmitState {
                sender,
                next_value: 1,
            }),
        });
        tracking::track_new(
            Arc::as_ptr(&inner) as usize,
            ObjectMagic::CommandQueue,
            "command queue",
            vm,
        );
        Ok(Queue(inner))
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    pub fn properties(&self) -> u64 {
        self.0.properties
    }

    pub fn profiling_enabled(&self) -> bool {
        self.0.properties & QUEUE_PROFILING_ENABLE != 0
    }

    /// Submits `command` with the given wait-list dependencies.
    ///
    /// On success the returned event is freshly retained for the caller and
    /// reaches `COMPLETE` only after every dependency and the command itself
    /// have executed; a dependency error surfaces on it as
    /// [`status::ERROR_WAIT_LIST`]. On failure the command is left without a
    /// result event.
    pub fn enqueue_command_with_deps(&self, command: &Command, waits: &[Event]) -> Result<Event> {
        debug_assert!(
            command.queue() == self,
            "command submitted to a queue it is not bound to"
        );
        let mut submit = self.0.submit.lock().unwrap();
        let value = submit.next_value;
        let event = Event::new_command(
            self,
            command.command_type(),
            ConditionVariable::timeline(self.0.timeline.clone(), value),
        );
        command.attach_event(event.clone());
        command.push_deps(waits);
        let submission = Submission {
            command: command.clone(),
            event: event.clone(),
            value,
        };
        match submit.sender.try_send(submission) {
            Ok(()) => {
                submit.next_value += 1;
                tracing::debug!(command_type = ?command.command_type(), value, "command submitted");
                Ok(event)
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                command.reset_event();
                command.take_deps();
                tracing::warn!(
                    command_type = ?command.command_type(),
                    "submission rejected, queue saturated"
                );
                Err(Error::OutOfResources)
            }
        }
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Queue {}
impl std::hash::Hash for Queue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &Arc::as_ptr(&self.0))
            .field("properties", &self.0.properties)
            .finish()
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        tracking::track_drop(self as *const QueueInner as usize, ObjectMagic::CommandQueue);
    }
}

/// The worker drains submissions until every queue handle is gone and the
/// channel disconnects.
fn spawn_worker(timeline: Arc<dyn Semaphore>, receiver: Receiver<Submission>) -> Result<()> {
    std::thread::Builder::new()
        .name("scoria queue worker".to_string())
        .spawn(move || {
            while let Ok(submission) = receiver.recv() {
                run_submission(&timeline, submission);
            }
        })
        .map(drop)
        .map_err(|err| {
            tracing::error!(%err, "failed to spawn queue worker");
            Error::OutOfHostMemory
        })
}

fn run_submission(timeline: &Arc<dyn Semaphore>, submission: Submission) {
    let Submission {
        command,
        event,
        value,
    } = submission;

    event.set_status(status::SUBMITTED);

    let deps: SmallVec<[Event; 4]> = command.take_deps();
    let mut wait_list_failed = false;
    for dep in &deps {
        if dep.wait(false) < status::COMPLETE {
            wait_list_failed = true;
        }
    }

    if wait_list_failed {
        event.set_status(status::ERROR_WAIT_LIST);
    } else {
        event.set_status(status::RUNNING);
        match command.execute() {
            Ok(()) => {
                event.set_status(status::COMPLETE);
            }
            Err(err) => {
                tracing::warn!(code = err.code(), "command execution failed");
                event.set_status(err.code());
            }
        }
    }

    // The command retains its dependencies until it has completed; that has
    // happened by now, and releasing them must precede the timeline signal
    // that wakes waiters.
    drop(deps);
    timeline.notify(value);
}
