//! talon: an embeddable Tcl-like script evaluation engine.
//!
//! The engine lives in [`script`]; [`hook`], [`policy`], [`history`] and
//! [`frame`] are the collaborators it consults, and [`config`] and
//! [`error`] carry settings and host-facing errors.

pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod history;
pub mod hook;
pub mod policy;
pub mod script;

pub use error::EngineError;
pub use script::{EvalContext, EvalResult, Flow, Interpreter, ReturnCode, ScriptError, Value};
