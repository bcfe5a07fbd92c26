//! The command loop.
//!
//! [`guarded`] wraps every script evaluation with the entry and exit hooks
//! (level and stack limits, outermost-only resets, the script timeout,
//! result conversion); [`run_commands`] is the loop itself: parse one
//! command, substitute its words, dispatch it, and on error append the
//! failing command to the trace.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, trace};

use crate::config::runtime_config;
use crate::frame::{CallFrame, FrameKind};
use crate::hook::{self, BreakpointContext, BreakpointType, Notification};

use super::cancel::{GateError, LockMode};
use super::context::EvalContext;
use super::dispatch;
use super::expand;
use super::interp::{FrameGuard, Interpreter};
use super::levels::{check_stack, StackBase};
use super::parser::MISSING_CLOSE_BRACKET;
use super::procedure::Procedure;
use super::result::{
    EvalResult, Fault, FaultKind, Flow, ReturnCode, ScriptError, INTERRUPTED, STACK_OVERFLOW,
};
use super::token::ParseState;
use super::trace::{self, ERROR_CODE, ERROR_INFO, TRUNCATED};
use super::value::Value;

/// Evaluate `text` as a script.
pub fn evaluate_text(interp: &Interpreter, text: &str, ctx: &EvalContext) -> EvalResult {
    let mut state = ParseState::new(text);
    evaluate_range(interp, &mut state, 0, text.len(), ctx)
}

/// Evaluate the commands in `[start, start + len)` of `state`'s text.
pub fn evaluate_range(
    interp: &Interpreter,
    state: &mut ParseState,
    start: usize,
    len: usize,
    ctx: &EvalContext,
) -> EvalResult {
    guarded(interp, ctx, |ctx| run_commands(interp, state, start, len, ctx))
}

/// Evaluate a procedure body, from its pre-parsed commands when caching is
/// allowed.
pub fn evaluate_body(interp: &Interpreter, procedure: &Procedure, ctx: &EvalContext) -> EvalResult {
    let compiled = if ctx.uses_cache() { procedure.compiled(&*interp.parser()) } else { None };
    match compiled {
        Some(commands) => guarded(interp, ctx, |ctx| run_compiled(interp, &commands, ctx)),
        None => evaluate_text(interp, procedure.body(), ctx),
    }
}

/// Run `body` as one script level.
pub fn guarded(
    interp: &Interpreter,
    ctx: &EvalContext,
    body: impl FnOnce(&EvalContext) -> EvalResult,
) -> EvalResult {
    let ctx = ctx.combine(&interp.wide_context());
    if !interp.is_usable() {
        return Err(GateError::Unusable.into());
    }
    let _owner = interp.eval_lock().acquire();
    let _stack = StackBase::enter();
    let level = interp.levels().enter_script();
    let config = interp.config();
    let outermost = level.is_outermost();

    if outermost {
        if !ctx.respects_pending_cancel() {
            interp.gate().reset_cancel(LockMode::Block)?;
        }
        interp.reset_result();
        interp.schedule_timeout(config.script_timeout);
    }

    let too_deep = level.level() > config.max_levels
        || (ctx.checks_stack() && !check_stack(config.stack_limit, runtime_config().extra_stack_reserve));
    let result = if too_deep {
        debug!(level = level.level(), "evaluation nested too deeply");
        Err(stack_overflow(interp, level.level()))
    } else {
        let global = ctx.evaluates_global() || (outermost && config.evaluate_global);
        let _alias = global.then(|| FrameGuard::push(interp, CallFrame::new(FrameKind::GlobalAlias, "#0")));
        body(&ctx)
    };
    finish(interp, &ctx, outermost, level.level(), result)
}

fn stack_overflow(interp: &Interpreter, level: usize) -> Flow {
    interp.errors().flag_overflow(level);
    Flow::from(ScriptError::new(STACK_OVERFLOW).with_fault(Fault::new(FaultKind::StackOverflow, STACK_OVERFLOW)))
}

fn finish(
    interp: &Interpreter,
    ctx: &EvalContext,
    outermost: bool,
    level: usize,
    mut result: EvalResult,
) -> EvalResult {
    let code = ReturnCode::of(&result);
    if ctx.hits_breakpoints() && interp.has_debugger() {
        let context = BreakpointContext::new(BreakpointType::ScriptExit).with_code(code);
        if let Err(flow) = hook::breakpoint(interp, &context) {
            result = Err(flow);
        }
    }
    if ctx.notifies() {
        hook::notify(interp, &Notification::ScriptExited { level, code });
    }
    if !outermost {
        return result;
    }

    interp.collect_garbage();
    let truncated = interp.errors().truncated;
    if truncated {
        trace::append_error_info(interp, TRUNCATED);
    }
    let result = match result {
        Err(Flow::Return(v)) => Ok(v),
        Err(Flow::Break | Flow::Continue)
            if ctx.resets_return_code() || interp.config().reset_return_code =>
        {
            Ok(Value::empty())
        }
        Err(Flow::Error(mut e)) => {
            e.error_info = interp.global_var(ERROR_INFO).map(Value::into_string);
            if e.error_code.is_none() {
                e.error_code = interp.global_var(ERROR_CODE).map(Value::into_string);
            }
            Err(Flow::Error(e))
        }
        other => other,
    };
    interp.errors().reset_unwind();
    interp.cancel_timeout();
    interp.set_last_code(ReturnCode::of(&result));
    interp.set_result(match &result {
        Ok(v) => v.clone(),
        Err(flow) => flow.value(),
    });
    result
}

/// The command loop over `[start, start + len)`.
pub fn run_commands(
    interp: &Interpreter,
    state: &mut ParseState,
    start: usize,
    len: usize,
    ctx: &EvalContext,
) -> EvalResult {
    let end = (start + len).min(state.text().len());
    let bracket = ctx.is_bracket_terminated();
    let parser = interp.parser();
    let mut logged = ctx.has_error_already_logged();
    let mut last = Value::empty();
    let mut p = start;

    loop {
        if interp.exit_requested() {
            trace!("exit requested; leaving command loop");
            break;
        }
        if p >= end && !bracket {
            break;
        }
        if let Err(e) = parser.parse_command(state, p, end.saturating_sub(p), bracket) {
            let mut error = ScriptError::new(e.kind.to_string());
            let command_len = (state.term + 1).saturating_sub(state.command_start);
            trace::log_command_information(
                interp,
                &mut error,
                state.text(),
                start,
                state.command_start,
                command_len,
            );
            return Err(error.into());
        }
        if state.command_words > 0 {
            match run_command(interp, state, ctx) {
                Ok(v) => last = v,
                Err(Flow::Error(mut e)) => {
                    if bracket && !has_close_bracket(interp, state, end) {
                        e.message = Value::from(MISSING_CLOSE_BRACKET);
                    }
                    log_failure(interp, state, start, &mut e, &mut logged);
                    return Err(Flow::Error(e));
                }
                Err(flow) => return Err(flow),
            }
        }
        if bracket && state.text().as_bytes().get(state.term) == Some(&b']') {
            break;
        }
        let next = state.command_start + state.command_len;
        if next <= p {
            break;
        }
        p = next;
    }
    Ok(last)
}

fn run_compiled(interp: &Interpreter, commands: &[ParseState], ctx: &EvalContext) -> EvalResult {
    let mut logged = ctx.has_error_already_logged();
    let mut last = Value::empty();
    for state in commands {
        if interp.exit_requested() {
            break;
        }
        match run_command(interp, state, ctx) {
            Ok(v) => last = v,
            Err(Flow::Error(mut e)) => {
                log_failure(interp, state, 0, &mut e, &mut logged);
                return Err(Flow::Error(e));
            }
            Err(flow) => return Err(flow),
        }
    }
    Ok(last)
}

/// Whether a `]` closes the bracketed script at or after the failing
/// command.
fn has_close_bracket(interp: &Interpreter, state: &ParseState, end: usize) -> bool {
    if state.text().as_bytes().get(state.term) == Some(&b']') {
        return true;
    }
    let parser = interp.parser();
    let mut scratch = state.fork();
    let mut p = state.term + 1;
    while p < end {
        if parser.parse_command(&mut scratch, p, end - p, true).is_err() {
            return false;
        }
        if scratch.text().as_bytes().get(scratch.term) == Some(&b']') {
            return true;
        }
        let next = scratch.term + 1;
        if next <= p {
            return false;
        }
        p = next;
    }
    false
}

/// Append the failing command to the trace unless the step is suppressed.
fn log_failure(
    interp: &Interpreter,
    state: &ParseState,
    script_start: usize,
    error: &mut ScriptError,
    ctx_logged: &mut bool,
) {
    let suppressed = {
        let mut errors = interp.errors();
        let s = errors.already_logged || *ctx_logged;
        errors.already_logged = false;
        s
    };
    *ctx_logged = false;
    if suppressed {
        let tail = state.text().get(script_start..).unwrap_or("");
        error.error_line = trace::line_of(tail, state.command_start.saturating_sub(script_start));
        return;
    }
    trace::log_command_information(
        interp,
        error,
        state.text(),
        script_start,
        state.command_start,
        state.command_len,
    );
}

/// Substitute and dispatch the command parsed into `state`.  Native faults
/// raised anywhere below are contained here.
fn run_command(interp: &Interpreter, state: &ParseState, ctx: &EvalContext) -> EvalResult {
    let depth = interp.frame_depth();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let args = expand::build_arguments(interp, state, ctx)?;
        let Some(first) = args.first() else {
            return Ok(Value::empty());
        };
        if interp.config().history && ctx.records_history() {
            interp.record_history(&args);
        }
        if ctx.notifies() {
            let name = first.to_string();
            hook::notify(interp, &Notification::Executing { name: &name, arguments: &args });
        }
        let _engine = interp.levels().enter_engine();
        dispatch::invoke(interp, &args, ctx)
    }));
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let fault = Fault::from_panic(payload, "evaluate");
            interp.frames().pop_automatic_until(depth);
            Err(contain(interp, ctx, fault))
        }
    }
}

fn contain(interp: &Interpreter, ctx: &EvalContext, fault: Fault) -> Flow {
    match fault.kind {
        FaultKind::StackOverflow | FaultKind::OutOfMemory => {
            interp.collect_garbage();
            if fault.kind == FaultKind::StackOverflow {
                interp.errors().flag_overflow(interp.levels().script());
            }
            let message = fault.describe();
            Flow::from(ScriptError::new(message).with_fault(fault))
        }
        FaultKind::Interrupted => {
            if ctx.resets_abort() {
                interp.reset_abort();
            }
            Flow::from(ScriptError::new(INTERRUPTED).with_fault(fault))
        }
        FaultKind::Disposed | FaultKind::Panic => {
            let method = fault.method.clone();
            dispatch::fault_to_flow(interp, fault, &method)
        }
    }
}
