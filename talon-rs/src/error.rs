//! Host-facing error type.
//!
//! Failures that originate outside script semantics (I/O, disposal, lock
//! contention, thread spawning, policy, configuration) are [`EngineError`]s.
//! They convert into script errors so host code can use `?` inside
//! commands.

use crate::config::ConfigError;
use crate::script::cancel::GateError;
use crate::script::result::{Flow, ScriptError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("couldn't read file \"{path}\": {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("unable to spawn background evaluation: {0}")]
    Spawn(std::io::Error),
    #[error("permission denied: {kind} \"{name}\" rejected by policy")]
    PolicyDenied { kind: &'static str, name: String },
    #[error("{path}: {errors} configuration error(s), first: {first}")]
    Config { path: String, errors: usize, first: ConfigError },
}

impl From<EngineError> for ScriptError {
    fn from(e: EngineError) -> Self {
        let code = match &e {
            EngineError::Io { source, .. } => format!("POSIX {:?}", source.kind()),
            EngineError::Gate(_) => "INTERP UNUSABLE".to_owned(),
            EngineError::Spawn(_) => "INTERP SPAWN".to_owned(),
            EngineError::PolicyDenied { .. } => "POLICY DENIED".to_owned(),
            EngineError::Config { .. } => "CONFIG".to_owned(),
        };
        ScriptError::new(e.to_string()).with_code(code)
    }
}

impl From<GateError> for ScriptError {
    fn from(e: GateError) -> Self {
        ScriptError::new(e.to_string())
    }
}

impl From<EngineError> for Flow {
    fn from(e: EngineError) -> Self {
        Flow::from(ScriptError::from(e))
    }
}

impl From<GateError> for Flow {
    fn from(e: GateError) -> Self {
        Flow::from(ScriptError::from(e))
    }
}
