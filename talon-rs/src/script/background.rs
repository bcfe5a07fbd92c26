//! Fire-and-forget evaluation.
//!
//! Each `*_async` function schedules the work and returns.  The evaluation
//! runs on tokio's blocking pool when called from inside a runtime, and on
//! a dedicated thread otherwise.  The callback runs on that same thread with
//! the completion context.

use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::runtime_config;
use crate::error::EngineError;

use super::cancel::GateError;
use super::context::EvalContext;
use super::dispatch::ClientData;
use super::interp::Interpreter;
use super::result::{EvalResult, Fault, ReturnCode};
use super::value::Value;

/// Everything known about a finished background evaluation.
#[derive(Clone)]
pub struct AsyncContext {
    pub code: ReturnCode,
    /// The result value, or the error message.
    pub result: Value,
    pub error_line: usize,
    pub error_info: Option<String>,
    pub client_data: Option<ClientData>,
}

impl std::fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncContext")
            .field("code", &self.code)
            .field("result", &self.result)
            .field("error_line", &self.error_line)
            .field("error_info", &self.error_info)
            .finish_non_exhaustive()
    }
}

impl AsyncContext {
    fn new(interp: &Interpreter, result: &EvalResult, client_data: Option<ClientData>) -> Self {
        let code = ReturnCode::of(result);
        let (value, error_line, error_info) = match result {
            Ok(v) => (v.clone(), 0, None),
            Err(flow) => match flow.as_error() {
                Some(e) => (
                    e.message.clone(),
                    e.error_line,
                    e.error_info.clone().or_else(|| interp.error_info()),
                ),
                None => (flow.value(), 0, None),
            },
        };
        AsyncContext { code, result: value, error_line, error_info, client_data }
    }
}

pub type AsyncCallback = Box<dyn FnOnce(&Interpreter, AsyncContext) + Send>;

type Work = Box<dyn FnOnce(&Interpreter) -> EvalResult + Send>;

fn spawn(
    interp: &Interpreter,
    method: &'static str,
    work: Work,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    if !interp.is_usable() {
        return Err(GateError::Unusable.into());
    }
    let interp: Arc<Interpreter> = interp.arc().ok_or(GateError::Unusable)?;
    let job = move || run(&interp, method, work, client_data, callback);

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            debug!(method, "scheduling background evaluation on the blocking pool");
            drop(handle.spawn_blocking(job));
            Ok(())
        }
        Err(_) => {
            debug!(method, "scheduling background evaluation on a new thread");
            std::thread::Builder::new()
                .name(format!("talon-{method}"))
                .stack_size(runtime_config().background_stack_size)
                .spawn(job)
                .map(drop)
                .map_err(EngineError::Spawn)
        }
    }
}

#[instrument(level = "debug", skip_all, fields(method))]
fn run(
    interp: &Interpreter,
    method: &'static str,
    work: Work,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) {
    let context = {
        // The completion context reads errorInfo, so keep the interpreter
        // until it is built.
        let _owner = interp.eval_lock().acquire();
        let result = work(interp);
        if let Err(flow) = &result {
            if flow.is_error() {
                debug!(method, error = %flow, "background evaluation failed");
            }
        }
        callback.is_some().then(|| AsyncContext::new(interp, &result, client_data))
    };
    let (Some(callback), Some(context)) = (callback, context) else { return };
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(interp, context))) {
        let fault = Fault::from_panic(payload, method);
        warn!(method, fault = %fault.describe(), "background completion callback panicked");
    }
}

pub fn evaluate_script_async(
    interp: &Interpreter,
    script: impl Into<String>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let script = script.into();
    let work: Work = Box::new(move |i| i.evaluate_script_with(&script, &ctx));
    spawn(interp, "evaluate_script", work, client_data, callback)
}

pub fn evaluate_expression_async(
    interp: &Interpreter,
    expression: impl Into<String>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let expression = expression.into();
    let work: Work = Box::new(move |i| i.evaluate_expression_with(&expression, &ctx));
    spawn(interp, "evaluate_expression", work, client_data, callback)
}

pub fn substitute_string_async(
    interp: &Interpreter,
    text: impl Into<String>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let text = text.into();
    let work: Work = Box::new(move |i| i.substitute_string_with(&text, &ctx));
    spawn(interp, "substitute_string", work, client_data, callback)
}

pub fn evaluate_file_async(
    interp: &Interpreter,
    path: impl Into<PathBuf>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let path = path.into();
    let work: Work = Box::new(move |i| i.evaluate_file_with(&path, &ctx));
    spawn(interp, "evaluate_file", work, client_data, callback)
}

pub fn substitute_file_async(
    interp: &Interpreter,
    path: impl Into<PathBuf>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let path = path.into();
    let work: Work = Box::new(move |i| i.substitute_file_with(&path, &ctx));
    spawn(interp, "substitute_file", work, client_data, callback)
}

pub fn evaluate_stream_async(
    interp: &Interpreter,
    reader: impl Read + Send + 'static,
    name: impl Into<String>,
    ctx: EvalContext,
    client_data: Option<ClientData>,
    callback: Option<AsyncCallback>,
) -> Result<(), EngineError> {
    let name = name.into();
    let work: Work = Box::new(move |i| i.evaluate_stream_with(reader, &name, &ctx));
    spawn(interp, "evaluate_stream", work, client_data, callback)
}
