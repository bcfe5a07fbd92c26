//! Checkpoints and the interpreter's event queue.
//!
//! [`check_events`] runs at every dispatch and before each command or
//! variable substitution.  It raises pending interrupts (abort, deletion,
//! halt, cancel) and drains due events.  Events are host-scheduled work:
//! deferred cancels and halts, scripts, and native callbacks.

use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::hook::{self, Notification};

use super::cancel::{Interrupt, LockMode};
use super::context::{ChildScope, EvalContext};
use super::eval;
use super::interp::Interpreter;
use super::lock;
use super::result::{EvalResult, Fault, Flow, ScriptError};
use super::trace::ErrorSnapshot;

pub type EventId = u64;

/// Message of the cancel raised by an expired script timeout.
pub const TIMEOUT_MESSAGE: &str = "script timeout exceeded";

pub type EventCallback = std::sync::Arc<dyn Fn(&Interpreter) -> EvalResult + Send + Sync>;

#[derive(Clone)]
pub enum EventKind {
    Cancel { unwind: bool, message: Option<String> },
    Halt(Option<String>),
    Script(String),
    Callback(EventCallback),
}

impl std::fmt::Debug for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Cancel { unwind, .. } => write!(f, "Cancel(unwind={unwind})"),
            EventKind::Halt(_) => f.write_str("Halt"),
            EventKind::Script(s) => write!(f, "Script({s:?})"),
            EventKind::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl EventKind {
    fn is_script(&self) -> bool {
        matches!(self, EventKind::Script(_) | EventKind::Callback(_))
    }
}

#[derive(Debug)]
struct Event {
    id: EventId,
    due: Instant,
    /// Scheduled with a non-zero delay.
    timer: bool,
    kind: EventKind,
}

#[derive(Debug, Default)]
struct Queue {
    next_id: EventId,
    events: Vec<Event>,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    queue: Mutex<Queue>,
    processing: AtomicBool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `kind` to run at the first checkpoint after `delay`.
    pub fn schedule(&self, delay: Duration, kind: EventKind) -> EventId {
        let mut q = lock(&self.queue);
        q.next_id += 1;
        let id = q.next_id;
        q.events.push(Event { id, due: Instant::now() + delay, timer: !delay.is_zero(), kind });
        id
    }

    /// Remove a queued event.  Returns whether it was still pending.
    pub fn cancel(&self, id: EventId) -> bool {
        let mut q = lock(&self.queue);
        let before = q.events.len();
        q.events.retain(|e| e.id != id);
        q.events.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the events due at `now` that `ctx` allows, in
    /// scheduling order.
    fn take_due(&self, now: Instant, ctx: &EvalContext) -> Vec<EventKind> {
        let mut q = lock(&self.queue);
        let mut due = Vec::new();
        let mut kept = Vec::with_capacity(q.events.len());
        for event in q.events.drain(..) {
            let allowed = event.due <= now
                && (!event.timer || ctx.processes_timers())
                && (!event.kind.is_script() || ctx.processes_queued_scripts());
            if allowed {
                due.push(event.kind);
            } else {
                kept.push(event);
            }
        }
        q.events = kept;
        due
    }
}

/// Checkpoint: raise pending interrupts and run due events.
pub fn check_events(interp: &Interpreter, ctx: &EvalContext) -> Result<(), Flow> {
    if ctx.checks_ready() {
        ready(interp)?;
    }
    if ctx.processes_events() && !interp.events().is_empty() {
        process_events(interp, ctx);
        if ctx.checks_ready() {
            ready(interp)?;
        }
    }
    Ok(())
}

/// Raise the abort fault, or the error for a pending deletion, halt or cancel.
pub fn ready(interp: &Interpreter) -> Result<(), Flow> {
    if interp.abort_requested() {
        resume_unwind(Box::new(Fault::interrupted()));
    }
    match interp.gate().check_ready(LockMode::Block, true)? {
        None => Ok(()),
        Some(detected) => {
            let code = match detected.interrupt {
                Interrupt::Canceled => "CANCEL EVAL",
                Interrupt::Unwound => "CANCEL UNWIND",
                Interrupt::Halted => "HALT",
                Interrupt::Deleted => "DELETED",
            };
            Err(Flow::from(ScriptError::new(detected.message).with_code(code)))
        }
    }
}

fn process_events(interp: &Interpreter, ctx: &EvalContext) {
    let queue = interp.events();
    if queue.processing.swap(true, Ordering::AcqRel) {
        return;
    }
    let due = queue.take_due(Instant::now(), ctx);
    for kind in due {
        run_event(interp, ctx, kind);
    }
    queue.processing.store(false, Ordering::Release);
}

fn run_event(interp: &Interpreter, ctx: &EvalContext, kind: EventKind) {
    debug!(event = ?kind, "running queued event");
    let gate = interp.gate();
    let outcome = match kind {
        EventKind::Cancel { unwind, message } => {
            gate.cancel_evaluate(LockMode::Block, unwind, message).map_err(Flow::from)
        }
        EventKind::Halt(message) => gate.halt_evaluate(LockMode::Block, message).map_err(Flow::from),
        EventKind::Script(text) => {
            let snapshot = ErrorSnapshot::take(interp);
            let result = eval::evaluate_text(interp, &text, &ctx.child_for(ChildScope::Fresh));
            snapshot.restore(interp);
            result.map(drop)
        }
        EventKind::Callback(callback) => {
            let snapshot = ErrorSnapshot::take(interp);
            let result = callback(interp);
            snapshot.restore(interp);
            result.map(drop)
        }
    };
    if let Err(flow) = outcome {
        if flow.is_error() {
            let message = flow.to_string();
            warn!(%message, "background event failed");
            hook::notify(interp, &Notification::BackgroundError { message: &message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_events_respect_flags() {
        let q = EventQueue::new();
        q.schedule(Duration::ZERO, EventKind::Script("a".into()));
        q.schedule(Duration::ZERO, EventKind::Halt(None));
        q.schedule(Duration::from_secs(3600), EventKind::Halt(None));

        let no_scripts = EvalContext::new().with_events(super::super::context::EventFlags {
            no_scripts: true,
            ..Default::default()
        });
        let due = q.take_due(Instant::now(), &no_scripts);
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0], EventKind::Halt(_)));
        assert_eq!(q.len(), 2);

        let later = Instant::now() + Duration::from_secs(7200);
        let no_timers = EvalContext::new().with_events(super::super::context::EventFlags {
            no_timers: true,
            ..Default::default()
        });
        assert_eq!(q.take_due(later, &no_timers).len(), 1);
        assert_eq!(q.take_due(later, &EvalContext::new()).len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_removes_pending_event() {
        let q = EventQueue::new();
        let id = q.schedule(Duration::from_secs(1), EventKind::Halt(None));
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
    }
}
