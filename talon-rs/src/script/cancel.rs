//! Interpreter-wide cancel / halt / delete state.
//!
//! Every operation follows the same four steps: check that the interpreter
//! is usable, take the state lock in the requested [`LockMode`], check or
//! transition the state, and then, with the lock released, fire the
//! interrupt callback.  Callers that already hold the lock use the
//! `*_locked` variants with the guard they obtained from
//! [`CancellationGate::lock`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use tracing::{debug, trace, warn};

/// Message of a canceled evaluation.
pub const CANCELED: &str = "eval canceled";
/// Message of an evaluation canceled with unwinding.
pub const UNWOUND: &str = "eval unwound";
/// Message of a halted interpreter.
pub const HALTED: &str = "interpreter halted";
/// Message of a deleted interpreter.
pub const DELETED: &str = "attempt to call eval in deleted interpreter";

/// Host-facing gate failures, distinct from the interrupt states themselves.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("interpreter is unusable (disposed)")]
    Unusable,
    #[error("unable to acquire lock")]
    LockUnavailable,
}

/// How an operation acquires the state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Block,
    /// Fail with [`GateError::LockUnavailable`] instead of waiting.
    Try,
}

/// Which interrupt condition was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    Deleted,
    Halted,
    Canceled,
    Unwound,
}

impl Interrupt {
    pub fn message(self) -> &'static str {
        match self {
            Interrupt::Deleted => DELETED,
            Interrupt::Halted => HALTED,
            Interrupt::Canceled => CANCELED,
            Interrupt::Unwound => UNWOUND,
        }
    }

    fn bit(self) -> u8 {
        match self {
            Interrupt::Deleted => 1,
            Interrupt::Halted => 2,
            Interrupt::Canceled => 4,
            Interrupt::Unwound => 8,
        }
    }
}

/// Callback fired (outside the lock) the first time an interrupt is observed.
pub type InterruptCallback = Arc<dyn Fn(Interrupt, &str) -> Result<(), String> + Send + Sync>;

/// State guarded by the gate lock.
#[derive(Debug, Default)]
pub struct CancelState {
    canceled: bool,
    unwind: bool,
    halted: bool,
    deleted: bool,
    cancel_message: Option<String>,
    halt_message: Option<String>,
    /// Interrupts whose callback has already fired.
    notified: u8,
}

impl CancelState {
    pub fn canceled(&self) -> bool {
        self.canceled
    }

    pub fn unwinding(&self) -> bool {
        self.canceled && self.unwind
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Message to report for `interrupt`, honouring a custom cancel/halt reason.
    pub fn message_for(&self, interrupt: Interrupt) -> String {
        let custom = match interrupt {
            Interrupt::Canceled | Interrupt::Unwound => self.cancel_message.as_deref(),
            Interrupt::Halted => self.halt_message.as_deref(),
            Interrupt::Deleted => None,
        };
        custom.unwrap_or(interrupt.message()).to_owned()
    }

    /// Mark `interrupt` as notified; returns true if this is the first time.
    fn first_notice(&mut self, interrupt: Interrupt) -> bool {
        let fresh = self.notified & interrupt.bit() == 0;
        self.notified |= interrupt.bit();
        fresh
    }
}

/// A detected interrupt with the message to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub interrupt: Interrupt,
    pub message: String,
}

pub struct CancellationGate {
    state: Mutex<CancelState>,
    disposed: AtomicBool,
    callback: RwLock<Option<InterruptCallback>>,
}

impl Default for CancellationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationGate")
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl CancellationGate {
    pub fn new() -> Self {
        CancellationGate {
            state: Mutex::new(CancelState::default()),
            disposed: AtomicBool::new(false),
            callback: RwLock::new(None),
        }
    }

    pub fn set_callback(&self, callback: Option<InterruptCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn is_usable(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<(), GateError> {
        if self.is_usable() {
            Ok(())
        } else {
            debug!("gate operation rejected: interpreter disposed");
            Err(GateError::Unusable)
        }
    }

    /// Acquire the state lock.
    pub fn lock(&self, mode: LockMode) -> Result<MutexGuard<'_, CancelState>, GateError> {
        match mode {
            LockMode::Block => Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner)),
            LockMode::Try => match self.state.try_lock() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
                Err(TryLockError::WouldBlock) => Err(GateError::LockUnavailable),
            },
        }
    }

    fn fire(&self, detected: &Detected) {
        let callback = self.callback.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(callback) = callback else { return };
        trace!(interrupt = ?detected.interrupt, "firing interrupt callback");
        if let Err(e) = callback(detected.interrupt, &detected.message) {
            warn!(interrupt = ?detected.interrupt, error = %e, "interrupt callback failed");
        }
    }

    /// Run a check under the lock, then fire the callback with the lock released.
    fn check_with(
        &self,
        mode: LockMode,
        notify: bool,
        check: impl FnOnce(&mut CancelState) -> Option<Detected>,
    ) -> Result<Option<Detected>, GateError> {
        self.check_usable()?;
        let (detected, fire) = {
            let mut state = self.lock(mode)?;
            match check(&mut state) {
                Some(d) => {
                    let fire = notify && state.first_notice(d.interrupt);
                    (Some(d), fire)
                }
                None => (None, false),
            }
        };
        if let (Some(d), true) = (&detected, fire) {
            self.fire(d);
        }
        Ok(detected)
    }

    // ── Cancel ────────────────────────────────────────────────────────────

    pub fn is_canceled_locked(&self, state: &CancelState) -> Option<Detected> {
        if !state.canceled {
            return None;
        }
        let interrupt = if state.unwind { Interrupt::Unwound } else { Interrupt::Canceled };
        Some(Detected { interrupt, message: state.message_for(interrupt) })
    }

    pub fn is_canceled(&self, mode: LockMode, notify: bool) -> Result<Option<Detected>, GateError> {
        self.check_with(mode, notify, |s| self.is_canceled_locked(s))
    }

    /// Clear a pending cancel.  Returns whether anything changed.
    pub fn reset_cancel_locked(&self, state: &mut CancelState) -> bool {
        let changed = state.canceled || state.unwind;
        state.canceled = false;
        state.unwind = false;
        state.cancel_message = None;
        state.notified &= !(Interrupt::Canceled.bit() | Interrupt::Unwound.bit());
        changed
    }

    pub fn reset_cancel(&self, mode: LockMode) -> Result<bool, GateError> {
        self.check_usable()?;
        let mut state = self.lock(mode)?;
        Ok(self.reset_cancel_locked(&mut state))
    }

    pub fn cancel_evaluate_locked(
        &self,
        state: &mut CancelState,
        unwind: bool,
        message: Option<String>,
    ) {
        state.canceled = true;
        state.unwind = unwind;
        state.cancel_message = message;
    }

    /// Request cancellation of the running evaluation chain.
    pub fn cancel_evaluate(
        &self,
        mode: LockMode,
        unwind: bool,
        message: Option<String>,
    ) -> Result<(), GateError> {
        self.check_usable()?;
        let mut state = self.lock(mode)?;
        self.cancel_evaluate_locked(&mut state, unwind, message);
        debug!(unwind, "evaluation cancel requested");
        Ok(())
    }

    // ── Halt ──────────────────────────────────────────────────────────────

    pub fn is_halted_locked(&self, state: &CancelState) -> Option<Detected> {
        state.halted.then(|| Detected {
            interrupt: Interrupt::Halted,
            message: state.message_for(Interrupt::Halted),
        })
    }

    pub fn is_halted(&self, mode: LockMode, notify: bool) -> Result<Option<Detected>, GateError> {
        self.check_with(mode, notify, |s| self.is_halted_locked(s))
    }

    /// Halt check for engine internals: no usability check, no callback, and
    /// a busy lock reads as "not halted".
    pub fn internal_is_halted(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.halted,
            Err(TryLockError::Poisoned(p)) => p.into_inner().halted,
            Err(TryLockError::WouldBlock) => false,
        }
    }

    pub fn reset_halt_locked(&self, state: &mut CancelState) -> bool {
        let changed = state.halted;
        state.halted = false;
        state.halt_message = None;
        state.notified &= !Interrupt::Halted.bit();
        changed
    }

    pub fn reset_halt(&self, mode: LockMode) -> Result<bool, GateError> {
        self.check_usable()?;
        let mut state = self.lock(mode)?;
        Ok(self.reset_halt_locked(&mut state))
    }

    pub fn halt_evaluate(&self, mode: LockMode, message: Option<String>) -> Result<(), GateError> {
        self.check_usable()?;
        let mut state = self.lock(mode)?;
        state.halted = true;
        state.halt_message = message;
        debug!("interpreter halt requested");
        Ok(())
    }

    // ── Delete / dispose ──────────────────────────────────────────────────

    pub fn is_deleted_locked(&self, state: &CancelState) -> Option<Detected> {
        state.deleted.then(|| Detected {
            interrupt: Interrupt::Deleted,
            message: DELETED.to_owned(),
        })
    }

    pub fn is_deleted(&self, mode: LockMode, notify: bool) -> Result<Option<Detected>, GateError> {
        self.check_with(mode, notify, |s| self.is_deleted_locked(s))
    }

    /// Mark the interpreter deleted.  There is no reset.
    pub fn mark_deleted(&self, mode: LockMode) -> Result<(), GateError> {
        self.check_usable()?;
        self.lock(mode)?.deleted = true;
        Ok(())
    }

    /// Make the interpreter unusable.  Idempotent.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Readiness check: deleted, then halted, then canceled.
    pub fn check_ready(&self, mode: LockMode, notify: bool) -> Result<Option<Detected>, GateError> {
        self.check_with(mode, notify, |s| {
            self.is_deleted_locked(s)
                .or_else(|| self.is_halted_locked(s))
                .or_else(|| self.is_canceled_locked(s))
        })
    }
}
