//! Debugger breakpoints and observer notifications.
//!
//! The engine calls out to two optional collaborators: a [`Debugger`] that
//! may stop (or veto) evaluation at any of the named [`BreakpointType`]
//! checkpoints, and an [`Observer`] that is told about every major
//! transition but can never influence the outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

use tracing::warn;

use crate::config::runtime_config;
use crate::script::interp::Interpreter;
use crate::script::result::{Flow, ReturnCode};
use crate::script::value::Value;

// ── BreakpointType ────────────────────────────────────────────────────────────

/// A checkpoint at which an active debugger is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum BreakpointType {
    BeforeCommand    =  0,
    AfterCommand     =  1,
    BeforeSubCommand =  2,
    AfterSubCommand  =  3,
    BeforeProcedure  =  4,
    AfterProcedure   =  5,
    BeforeFunction   =  6,
    AfterFunction    =  7,
    BeforeOperator   =  8,
    AfterOperator    =  9,
    BeforeExecute    = 10,
    AfterExecute     = 11,
    Text             = 12,
    Backslash        = 13,
    Command          = 14,
    Variable         = 15,
    Expression       = 16,
    ScriptExit       = 17,
    BeforeFile       = 18,
    BeforeStream     = 19,
    Unknown          = 20,
}

impl BreakpointType {
    pub const ALL: &'static [BreakpointType] = &[
        BreakpointType::BeforeCommand,
        BreakpointType::AfterCommand,
        BreakpointType::BeforeSubCommand,
        BreakpointType::AfterSubCommand,
        BreakpointType::BeforeProcedure,
        BreakpointType::AfterProcedure,
        BreakpointType::BeforeFunction,
        BreakpointType::AfterFunction,
        BreakpointType::BeforeOperator,
        BreakpointType::AfterOperator,
        BreakpointType::BeforeExecute,
        BreakpointType::AfterExecute,
        BreakpointType::Text,
        BreakpointType::Backslash,
        BreakpointType::Command,
        BreakpointType::Variable,
        BreakpointType::Expression,
        BreakpointType::ScriptExit,
        BreakpointType::BeforeFile,
        BreakpointType::BeforeStream,
        BreakpointType::Unknown,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn name(self) -> &'static str {
        match self {
            BreakpointType::BeforeCommand => "BeforeCommand",
            BreakpointType::AfterCommand => "AfterCommand",
            BreakpointType::BeforeSubCommand => "BeforeSubCommand",
            BreakpointType::AfterSubCommand => "AfterSubCommand",
            BreakpointType::BeforeProcedure => "BeforeProcedure",
            BreakpointType::AfterProcedure => "AfterProcedure",
            BreakpointType::BeforeFunction => "BeforeFunction",
            BreakpointType::AfterFunction => "AfterFunction",
            BreakpointType::BeforeOperator => "BeforeOperator",
            BreakpointType::AfterOperator => "AfterOperator",
            BreakpointType::BeforeExecute => "BeforeExecute",
            BreakpointType::AfterExecute => "AfterExecute",
            BreakpointType::Text => "Text",
            BreakpointType::Backslash => "Backslash",
            BreakpointType::Command => "Command",
            BreakpointType::Variable => "Variable",
            BreakpointType::Expression => "Expression",
            BreakpointType::ScriptExit => "ScriptExit",
            BreakpointType::BeforeFile => "BeforeFile",
            BreakpointType::BeforeStream => "BeforeStream",
            BreakpointType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for BreakpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BreakpointType {
    type Err = String;

    /// Case-insensitive parse of a breakpoint name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BreakpointType::ALL
            .iter()
            .copied()
            .find(|b| b.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown breakpoint type: {s}"))
    }
}

// ── Debugger ──────────────────────────────────────────────────────────────────

/// What the debugger is shown at a checkpoint.
#[derive(Debug, Clone)]
pub struct BreakpointContext<'a> {
    pub kind: BreakpointType,
    /// Entity name, when the checkpoint concerns one.
    pub name: Option<&'a str>,
    pub arguments: &'a [Value],
    /// Completion code of the step, for `After*` and `ScriptExit`.
    pub code: Option<ReturnCode>,
    /// Source text of the token, for token checkpoints.
    pub text: Option<&'a str>,
}

impl<'a> BreakpointContext<'a> {
    pub fn new(kind: BreakpointType) -> Self {
        BreakpointContext { kind, name: None, arguments: &[], code: None, text: None }
    }

    pub fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_arguments(mut self, arguments: &'a [Value]) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_code(mut self, code: ReturnCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_text(mut self, text: &'a str) -> Self {
        self.text = Some(text);
        self
    }
}

/// Interactive debugger hook.  Returning an error from
/// [`breakpoint`](Debugger::breakpoint) aborts the step being inspected.
pub trait Debugger: Send + Sync {
    /// Whether the checkpoint is armed; unarmed checkpoints are skipped
    /// without building a context.
    fn is_active(&self, kind: BreakpointType) -> bool;

    fn breakpoint(&self, interp: &Interpreter, context: &BreakpointContext<'_>) -> Result<(), Flow>;
}

/// Consult the installed debugger at `context.kind`, if any.
pub fn breakpoint(interp: &Interpreter, context: &BreakpointContext<'_>) -> Result<(), Flow> {
    match interp.debugger() {
        Some(debugger) if debugger.is_active(context.kind) => debugger.breakpoint(interp, context),
        _ => Ok(()),
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

/// A transition the observer is told about.
#[derive(Debug, Clone)]
pub enum Notification<'a> {
    /// A command is about to be dispatched.
    Executing { name: &'a str, arguments: &'a [Value] },
    /// A dispatched entity finished.
    Executed { name: &'a str, code: ReturnCode },
    /// A script evaluation boundary exited.
    ScriptExited { level: usize, code: ReturnCode },
    /// A native fault was contained.
    Fault { method: &'a str, message: &'a str },
    /// A queued event failed outside any foreground evaluation.
    BackgroundError { message: &'a str },
}

/// Fire-and-forget telemetry hook.  Panics are contained and logged.
pub trait Observer: Send + Sync {
    fn notify(&self, interp: &Interpreter, notification: &Notification<'_>);
}

/// Deliver `notification` to the installed observer.
pub fn notify(interp: &Interpreter, notification: &Notification<'_>) {
    let Some(observer) = interp.observer() else {
        return;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| observer.notify(interp, notification)));
    if outcome.is_err() && runtime_config().log_hook_panics {
        warn!(?notification, "observer panicked; notification dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(BreakpointType::COUNT, 21);
        for &b in BreakpointType::ALL {
            assert_eq!(b.name().to_lowercase().parse::<BreakpointType>(), Ok(b));
        }
        assert!("nope".parse::<BreakpointType>().is_err());
    }

    #[test]
    fn discriminants_index_all() {
        for (i, &b) in BreakpointType::ALL.iter().enumerate() {
            assert_eq!(b as usize, i);
        }
    }
}
