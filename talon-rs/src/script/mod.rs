//! The talon evaluation engine.
//!
//! Source text flows through four layers:
//!
//! - [`parser`] turns text into a flat pre-order token tree ([`token`])
//! - [`expand`] substitutes the words of one command
//! - [`dispatch`] resolves the command name and runs it
//! - [`eval`] loops over the commands of a script and owns the
//!   per-level entry and exit bookkeeping
//!
//! [`subst`] and [`expr`] are the substitution-only and expression
//! evaluators built on the same pieces.  Cancellation, recursion limits and
//! error traces live in [`cancel`], [`levels`] and [`trace`].
//!
//! # Quick start
//!
//! ```rust
//! use talon::script::Interpreter;
//!
//! let interp = Interpreter::new();
//! let v = interp.evaluate_script("set x 6; expr {$x * 7}").unwrap();
//! assert_eq!(v.to_string(), "42");
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod background;
pub mod builtins;
pub mod cancel;
pub mod context;
pub mod dispatch;
pub mod eval;
pub mod events;
pub mod expand;
pub mod expr;
pub mod interp;
pub mod levels;
pub mod parser;
pub mod procedure;
pub mod result;
pub mod subst;
pub mod token;
pub mod trace;
pub mod value;

// Re-exports for convenience.
pub use context::EvalContext;
pub use interp::Interpreter;
pub use result::{EvalResult, Flow, ReturnCode, ScriptError};
pub use value::Value;

// Poisoning only means another thread panicked while holding the lock; the
// engine state behind every lock stays consistent, so recover the guard.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
