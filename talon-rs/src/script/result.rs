//! Result channel shared by every evaluation primitive.
//!
//! Every step returns an [`EvalResult`]: either the step's value or a
//! [`Flow`] describing how the evaluation is unwinding.  Only
//! [`Flow::Error`] is a failure; `Return`, `Break` and `Continue` are
//! control-flow signals with their own absorption points (procedure
//! boundaries and loop commands respectively).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::value::Value;

/// Outcome of an evaluation step.
pub type EvalResult = Result<Value, Flow>;

/// Error message used when the native stack or nesting limit is exhausted.
pub const STACK_OVERFLOW: &str = "stack overflow";
/// Error message used when an allocation fails during accumulation.
pub const OUT_OF_MEMORY: &str = "out of memory";
/// Error message used when an interrupt fault unwinds a command.
pub const INTERRUPTED: &str = "eval interrupted";

// ── ReturnCode ────────────────────────────────────────────────────────────────

/// Numeric completion code of an evaluation, as seen by scripts (`catch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    #[default]
    Ok = 0,
    Error = 1,
    Return = 2,
    Break = 3,
    Continue = 4,
}

impl ReturnCode {
    pub fn as_int(self) -> i64 {
        self as i64
    }

    /// Parse the `-code` argument of `return`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" | "0" => Some(ReturnCode::Ok),
            "error" | "1" => Some(ReturnCode::Error),
            "return" | "2" => Some(ReturnCode::Return),
            "break" | "3" => Some(ReturnCode::Break),
            "continue" | "4" => Some(ReturnCode::Continue),
            _ => None,
        }
    }

    pub fn of(result: &EvalResult) -> Self {
        match result {
            Ok(_) => ReturnCode::Ok,
            Err(flow) => flow.code(),
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReturnCode::Ok => "ok",
            ReturnCode::Error => "error",
            ReturnCode::Return => "return",
            ReturnCode::Break => "break",
            ReturnCode::Continue => "continue",
        };
        f.write_str(s)
    }
}

// ── Flow ──────────────────────────────────────────────────────────────────────

/// Non-`Ok` completion: an error or a control-flow signal.
#[derive(Debug, Clone)]
pub enum Flow {
    Error(Box<ScriptError>),
    Return(Value),
    Break,
    Continue,
}

impl Flow {
    pub fn error(message: impl Into<Value>) -> Self {
        Flow::Error(Box::new(ScriptError::new(message)))
    }

    pub fn error_with_code(message: impl Into<Value>, code: impl Into<String>) -> Self {
        Flow::Error(Box::new(ScriptError::new(message).with_code(code)))
    }

    pub fn code(&self) -> ReturnCode {
        match self {
            Flow::Error(_) => ReturnCode::Error,
            Flow::Return(_) => ReturnCode::Return,
            Flow::Break => ReturnCode::Break,
            Flow::Continue => ReturnCode::Continue,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Flow::Error(_))
    }

    pub fn as_error(&self) -> Option<&ScriptError> {
        match self {
            Flow::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_error_mut(&mut self) -> Option<&mut ScriptError> {
        match self {
            Flow::Error(e) => Some(e),
            _ => None,
        }
    }

    /// The payload a script would see for this completion.
    pub fn value(&self) -> Value {
        match self {
            Flow::Error(e) => e.message.clone(),
            Flow::Return(v) => v.clone(),
            Flow::Break | Flow::Continue => Value::empty(),
        }
    }

    /// Build the flow for a `return -code` style completion.
    pub fn from_code(code: ReturnCode, value: Value) -> Result<Value, Flow> {
        match code {
            ReturnCode::Ok => Ok(value),
            ReturnCode::Error => Err(Flow::error(value)),
            ReturnCode::Return => Err(Flow::Return(value)),
            ReturnCode::Break => Err(Flow::Break),
            ReturnCode::Continue => Err(Flow::Continue),
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Error(e) => write!(f, "{}", e.message),
            Flow::Return(v) => write!(f, "return: {v}"),
            Flow::Break => f.write_str("break"),
            Flow::Continue => f.write_str("continue"),
        }
    }
}

impl From<ScriptError> for Flow {
    fn from(e: ScriptError) -> Self {
        Flow::Error(Box::new(e))
    }
}

// ── ScriptError ───────────────────────────────────────────────────────────────

/// Payload of a failed evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScriptError {
    /// Human-readable error message (the script-visible result).
    pub message: Value,
    /// Structured error code, if the failing step set one.
    pub error_code: Option<String>,
    /// Accumulated trace, filled in when the error leaves a public entry point.
    pub error_info: Option<String>,
    /// 1-based line of the failing command within the innermost script
    /// boundary the error has crossed so far.
    pub error_line: usize,
    /// Native fault captured at a dispatch boundary.
    pub fault: Option<Arc<Fault>>,
}

impl ScriptError {
    pub fn new(message: impl Into<Value>) -> Self {
        ScriptError { message: message.into(), ..Default::default() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(Arc::new(fault));
        self
    }

    pub fn message_str(&self) -> String {
        self.message.to_string()
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ScriptError {}

// ── Fault ─────────────────────────────────────────────────────────────────────

/// Classification of a native fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    StackOverflow,
    OutOfMemory,
    /// Host requested that the running evaluation be interrupted.
    Interrupted,
    /// The interpreter was disposed while the call was running.
    Disposed,
    /// Any other panic.
    Panic,
}

/// A native fault caught at a dispatch boundary.
///
/// Hosts raise a typed fault with `std::panic::panic_any(Fault::...)`; any
/// other panic payload is classified as [`FaultKind::Panic`].
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    /// Type name of the fault (`String`, `Interrupted`, ...).
    pub type_name: String,
    /// Entity or operation that raised it.
    pub method: String,
    pub message: String,
    pub cause: Option<Box<Fault>>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        let type_name = match kind {
            FaultKind::StackOverflow => "StackOverflow",
            FaultKind::OutOfMemory => "OutOfMemory",
            FaultKind::Interrupted => "Interrupted",
            FaultKind::Disposed => "Disposed",
            FaultKind::Panic => "Panic",
        };
        Fault {
            kind,
            type_name: type_name.to_owned(),
            method: String::new(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn interrupted() -> Self {
        Fault::new(FaultKind::Interrupted, INTERRUPTED)
    }

    pub fn disposed() -> Self {
        Fault::new(FaultKind::Disposed, "interpreter disposed")
    }

    pub fn caused_by(mut self, cause: Fault) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The innermost fault in the chain.
    pub fn root_cause(&self) -> &Fault {
        let mut f = self;
        while let Some(inner) = f.cause.as_deref() {
            f = inner;
        }
        f
    }

    /// Classify a payload caught by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>, method: &str) -> Fault {
        let mut fault = match payload.downcast::<Fault>() {
            Ok(f) => *f,
            Err(payload) => match payload.downcast::<String>() {
                Ok(s) => Fault { type_name: "String".into(), ..Fault::new(FaultKind::Panic, *s) },
                Err(payload) => match payload.downcast::<&'static str>() {
                    Ok(s) => Fault { type_name: "str".into(), ..Fault::new(FaultKind::Panic, *s) },
                    Err(_) => Fault::new(FaultKind::Panic, "unknown panic payload"),
                },
            },
        };
        if fault.method.is_empty() {
            fault.method = method.to_owned();
        }
        fault
    }

    /// Script-visible text for the fault.
    pub fn describe(&self) -> String {
        match self.kind {
            FaultKind::StackOverflow => STACK_OVERFLOW.to_owned(),
            FaultKind::OutOfMemory => OUT_OF_MEMORY.to_owned(),
            FaultKind::Interrupted => INTERRUPTED.to_owned(),
            FaultKind::Disposed | FaultKind::Panic => {
                format!("caught {}: {}", self.type_name, self.message)
            }
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.type_name, self.method, self.message)
    }
}
