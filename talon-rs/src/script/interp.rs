//! The interpreter.
//!
//! An [`Interpreter`] owns every piece of per-interpreter state the engine
//! touches: configuration, the cancellation gate, nesting counters, the call
//! frame stack, the command registry, the error-unwind bookkeeping and the
//! installed hooks.  It is shared as `Arc<Interpreter>`; each piece of
//! mutable state sits behind its own lock, and no lock is held while user
//! code runs.
//!
//! The public entry points (`evaluate_script`, `evaluate_expression`,
//! `substitute_string`, the file and stream variants, `execute_with_frame`)
//! each contain native faults raised anywhere below them.

use std::io::{self, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tracing::{debug, instrument, trace};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::frame::{CallFrame, CallFrameStack, VarError};
use crate::history::CommandHistory;
use crate::hook::{self, BreakpointContext, BreakpointType, Debugger, Observer};
use crate::policy::{Policy, PolicyDecision, PolicyKind, PolicySubject};

use super::builtins;
use super::cancel::{CancellationGate, InterruptCallback, LockMode};
use super::context::EvalContext;
use super::dispatch::{self, DefaultResolver, Entity, Registry, Resolver, UnknownCommand, UnknownHandler, Usage};
use super::eval;
use super::events::{EventId, EventKind, EventQueue, TIMEOUT_MESSAGE};
use super::expr::{self, ExprCache};
use super::levels::{EvalLock, Levels};
use super::parser::{Parser, TclParser};
use super::result::{EvalResult, Fault, FaultKind, Flow, ReturnCode, ScriptError};
use super::subst;
use super::token::ParseState;
use super::trace::{self, ErrorState, ERROR_CODE, ERROR_INFO};
use super::value::Value;
use super::{lock, read, write};

// ── Source loading ────────────────────────────────────────────────────────────

/// Reads the text of a script file.
pub type SourceLoader = Arc<dyn Fn(&Path) -> io::Result<String> + Send + Sync>;

fn filesystem_loader() -> SourceLoader {
    Arc::new(|path: &Path| std::fs::read_to_string(path))
}

// ── Frame guard ───────────────────────────────────────────────────────────────

/// Pops the stack back to its depth before [`push`](FrameGuard::push) when
/// dropped, unwinding included.
#[must_use = "the frame is popped when the guard is dropped"]
pub struct FrameGuard<'a> {
    interp: &'a Interpreter,
    depth: usize,
}

impl<'a> FrameGuard<'a> {
    pub fn push(interp: &'a Interpreter, frame: CallFrame) -> Self {
        let depth = interp.frames().push(frame);
        FrameGuard { interp, depth }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let popped = self.interp.frames().pop_to(self.depth);
        if popped > 1 {
            trace!(popped, "popped nested frames left above a guarded frame");
        }
    }
}

// ── Interpreter ───────────────────────────────────────────────────────────────

pub struct Interpreter {
    self_ref: Weak<Interpreter>,
    config: RwLock<EngineConfig>,
    /// Options OR-ed into every evaluation's context.
    wide: RwLock<EvalContext>,
    gate: CancellationGate,
    /// Held by the thread running an evaluation chain.
    eval_lock: EvalLock,
    levels: Levels,
    frames: Mutex<CallFrameStack>,
    registry: RwLock<Registry>,
    resolver: RwLock<Arc<dyn Resolver>>,
    unknown: RwLock<Option<Arc<dyn UnknownHandler>>>,
    parser: RwLock<Arc<dyn Parser>>,
    errors: Mutex<ErrorState>,
    result: Mutex<Value>,
    last_code: Mutex<ReturnCode>,
    exit: AtomicBool,
    exit_code: AtomicI32,
    abort: AtomicBool,
    history: Mutex<CommandHistory>,
    output: Mutex<String>,
    debugger: RwLock<Option<Arc<dyn Debugger>>>,
    has_debugger: AtomicBool,
    observer: RwLock<Option<Arc<dyn Observer>>>,
    policy: RwLock<Option<Arc<dyn Policy>>>,
    loader: RwLock<SourceLoader>,
    expr_cache: ExprCache,
    events: EventQueue,
    timeout_event: Mutex<Option<EventId>>,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("config", &*read(&self.config))
            .field("levels", &self.levels)
            .field("usable", &self.is_usable())
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    /// A new interpreter with the default configuration and the core commands.
    pub fn new() -> Arc<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Arc<Self> {
        let interp = Arc::new_cyclic(|weak| Interpreter {
            self_ref: weak.clone(),
            config: RwLock::new(config),
            wide: RwLock::new(EvalContext::new()),
            gate: CancellationGate::new(),
            eval_lock: EvalLock::new(),
            levels: Levels::new(),
            frames: Mutex::new(CallFrameStack::new()),
            registry: RwLock::new(Registry::new()),
            resolver: RwLock::new(Arc::new(DefaultResolver)),
            unknown: RwLock::new(Some(Arc::new(UnknownCommand))),
            parser: RwLock::new(Arc::new(TclParser)),
            errors: Mutex::new(ErrorState::default()),
            result: Mutex::new(Value::empty()),
            last_code: Mutex::new(ReturnCode::Ok),
            exit: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            abort: AtomicBool::new(false),
            history: Mutex::new(CommandHistory::new(config.history_size)),
            output: Mutex::new(String::new()),
            debugger: RwLock::new(None),
            has_debugger: AtomicBool::new(false),
            observer: RwLock::new(None),
            policy: RwLock::new(None),
            loader: RwLock::new(filesystem_loader()),
            expr_cache: ExprCache::new(config.expr_cache_capacity),
            events: EventQueue::new(),
            timeout_event: Mutex::new(None),
        });
        builtins::register(&mut interp.registry_mut());
        debug!(safe = config.safe, "interpreter created");
        interp
    }

    pub fn downgrade(&self) -> Weak<Interpreter> {
        self.self_ref.clone()
    }

    /// A strong handle, unless the interpreter is being dropped.
    pub fn arc(&self) -> Option<Arc<Interpreter>> {
        self.self_ref.upgrade()
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    pub fn config(&self) -> EngineConfig {
        *read(&self.config)
    }

    pub fn set_config(&self, config: EngineConfig) {
        *write(&self.config) = config;
        lock(&self.history).set_max_size(config.history_size);
        self.expr_cache.set_capacity(config.expr_cache_capacity);
    }

    pub fn wide_context(&self) -> EvalContext {
        *read(&self.wide)
    }

    pub fn set_wide_context(&self, ctx: EvalContext) {
        *write(&self.wide) = ctx;
    }

    // ── Collaborators ─────────────────────────────────────────────────────────

    pub fn gate(&self) -> &CancellationGate {
        &self.gate
    }

    pub fn eval_lock(&self) -> &EvalLock {
        &self.eval_lock
    }

    pub fn levels(&self) -> &Levels {
        &self.levels
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn expr_cache(&self) -> &ExprCache {
        &self.expr_cache
    }

    pub fn frames(&self) -> MutexGuard<'_, CallFrameStack> {
        lock(&self.frames)
    }

    pub fn frame_depth(&self) -> usize {
        self.frames().depth()
    }

    pub fn errors(&self) -> MutexGuard<'_, ErrorState> {
        lock(&self.errors)
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        read(&self.registry)
    }

    pub fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        write(&self.registry)
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&read(&self.resolver))
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *write(&self.resolver) = resolver;
    }

    pub fn unknown_handler(&self) -> Option<Arc<dyn UnknownHandler>> {
        read(&self.unknown).clone()
    }

    pub fn set_unknown_handler(&self, handler: Option<Arc<dyn UnknownHandler>>) {
        *write(&self.unknown) = handler;
    }

    pub fn parser(&self) -> Arc<dyn Parser> {
        Arc::clone(&read(&self.parser))
    }

    pub fn set_parser(&self, parser: Arc<dyn Parser>) {
        *write(&self.parser) = parser;
    }

    pub fn set_source_loader(&self, loader: SourceLoader) {
        *write(&self.loader) = loader;
    }

    // ── Hooks ─────────────────────────────────────────────────────────────────

    pub fn debugger(&self) -> Option<Arc<dyn Debugger>> {
        read(&self.debugger).clone()
    }

    pub fn set_debugger(&self, debugger: Option<Arc<dyn Debugger>>) {
        self.has_debugger.store(debugger.is_some(), Ordering::Release);
        *write(&self.debugger) = debugger;
    }

    /// Cheap check taken before building a breakpoint context.
    pub fn has_debugger(&self) -> bool {
        self.has_debugger.load(Ordering::Acquire)
    }

    pub fn observer(&self) -> Option<Arc<dyn Observer>> {
        read(&self.observer).clone()
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        *write(&self.observer) = observer;
    }

    pub fn policy(&self) -> Option<Arc<dyn Policy>> {
        read(&self.policy).clone()
    }

    pub fn set_policy(&self, policy: Option<Arc<dyn Policy>>) {
        *write(&self.policy) = policy;
    }

    pub fn set_interrupt_callback(&self, callback: Option<InterruptCallback>) {
        self.gate.set_callback(callback);
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    // The frame-relative accessors wait for a running evaluation on another
    // thread, so they never land in that thread's procedure frame.

    pub fn get_variable(&self, name: &str, index: Option<&str>) -> Result<Value, VarError> {
        let _owner = self.eval_lock.acquire();
        self.frames().get(name, index)
    }

    pub fn set_variable(&self, name: &str, index: Option<&str>, value: Value) -> Result<Value, VarError> {
        let _owner = self.eval_lock.acquire();
        self.frames().set(name, index, value)
    }

    pub fn unset_variable(&self, name: &str, index: Option<&str>) -> Result<(), VarError> {
        let _owner = self.eval_lock.acquire();
        self.frames().unset(name, index)
    }

    pub fn global_var(&self, name: &str) -> Option<Value> {
        self.frames().global_get(name)
    }

    pub fn set_global_var(&self, name: &str, value: Value) {
        self.frames().global_set(name, value);
    }

    pub fn error_info(&self) -> Option<String> {
        self.global_var(ERROR_INFO).map(Value::into_string)
    }

    pub fn error_code(&self) -> Option<String> {
        self.global_var(ERROR_CODE).map(Value::into_string)
    }

    // ── Result state ──────────────────────────────────────────────────────────

    /// Result of the last outermost evaluation, or the last `return`ed value.
    pub fn result(&self) -> Value {
        lock(&self.result).clone()
    }

    pub fn set_result(&self, value: Value) {
        *lock(&self.result) = value;
    }

    /// Clear the result and the unwind bookkeeping before an outermost
    /// evaluation.
    pub fn reset_result(&self) {
        *lock(&self.result) = Value::empty();
        self.errors().reset_unwind();
    }

    pub fn last_return_code(&self) -> ReturnCode {
        *lock(&self.last_code)
    }

    pub fn set_last_code(&self, code: ReturnCode) {
        *lock(&self.last_code) = code;
    }

    /// The last native fault converted into a script error.
    pub fn last_fault(&self) -> Option<Arc<Fault>> {
        self.errors().last_fault.clone()
    }

    // ── Exit and abort ────────────────────────────────────────────────────────

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Stop every command loop after the current command.
    pub fn request_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
        self.exit.store(true, Ordering::Release);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_requested().then(|| self.exit_code.load(Ordering::Acquire))
    }

    /// Interrupt the running evaluation at its next checkpoint.  Unlike a
    /// cancel, `catch` cannot intercept it.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn reset_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Give back memory held by scratch buffers after an outermost
    /// evaluation or a resource fault.
    pub fn collect_garbage(&self) {
        let mut output = lock(&self.output);
        if output.is_empty() {
            output.shrink_to_fit();
        }
        drop(output);
        if self.errors().stack_overflow {
            trace!("stack overflow during evaluation; dropping cached expressions");
            self.expr_cache.clear();
        }
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Cancel the running evaluation.  With `unwind`, `catch` cannot stop it.
    pub fn cancel_evaluate(&self, unwind: bool, message: Option<String>) -> Result<(), EngineError> {
        Ok(self.gate.cancel_evaluate(LockMode::Block, unwind, message)?)
    }

    pub fn halt_evaluate(&self, message: Option<String>) -> Result<(), EngineError> {
        Ok(self.gate.halt_evaluate(LockMode::Block, message)?)
    }

    /// Mark the interpreter deleted: every later checkpoint fails.
    pub fn delete(&self) -> Result<(), EngineError> {
        Ok(self.gate.mark_deleted(LockMode::Block)?)
    }

    /// Make the interpreter unusable.
    pub fn dispose(&self) {
        debug!("interpreter disposed");
        self.gate.dispose();
        if let Some(id) = lock(&self.timeout_event).take() {
            self.events.cancel(id);
        }
    }

    pub fn is_usable(&self) -> bool {
        self.gate.is_usable()
    }

    pub fn schedule_event(&self, delay: Duration, kind: EventKind) -> EventId {
        self.events.schedule(delay, kind)
    }

    /// Arm the script timeout for an outermost evaluation.
    pub fn schedule_timeout(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else { return };
        let id = self.events.schedule(
            timeout,
            EventKind::Cancel { unwind: true, message: Some(TIMEOUT_MESSAGE.to_owned()) },
        );
        if let Some(previous) = lock(&self.timeout_event).replace(id) {
            self.events.cancel(previous);
        }
    }

    pub fn cancel_timeout(&self) {
        if let Some(id) = lock(&self.timeout_event).take() {
            self.events.cancel(id);
        }
    }

    // ── History, output, usage ────────────────────────────────────────────────

    pub fn record_history(&self, arguments: &[Value]) {
        let level = self.levels.script();
        lock(&self.history).record(level, arguments);
    }

    pub fn history(&self) -> MutexGuard<'_, CommandHistory> {
        lock(&self.history)
    }

    /// Append to the buffer `puts` writes to.
    pub fn write_output(&self, text: &str) {
        lock(&self.output).push_str(text);
    }

    pub fn take_output(&self) -> String {
        std::mem::take(&mut *lock(&self.output))
    }

    pub fn usage(&self, name: &str) -> Option<Usage> {
        self.registry().usage(name)
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    #[instrument(level = "debug", skip_all, fields(len = script.len()))]
    pub fn evaluate_script(&self, script: &str) -> EvalResult {
        self.evaluate_script_with(script, &EvalContext::new())
    }

    pub fn evaluate_script_with(&self, script: &str, ctx: &EvalContext) -> EvalResult {
        self.contained("evaluate_script", || eval::evaluate_text(self, script, ctx))
    }

    #[instrument(level = "debug", skip_all, fields(len = expression.len()))]
    pub fn evaluate_expression(&self, expression: &str) -> EvalResult {
        self.evaluate_expression_with(expression, &EvalContext::new())
    }

    pub fn evaluate_expression_with(&self, expression: &str, ctx: &EvalContext) -> EvalResult {
        self.contained("evaluate_expression", || {
            eval::guarded(self, ctx, |ctx| expr::evaluate(self, expression, ctx))
        })
    }

    #[instrument(level = "debug", skip_all, fields(len = text.len()))]
    pub fn substitute_string(&self, text: &str) -> EvalResult {
        self.substitute_string_with(text, &EvalContext::new())
    }

    pub fn substitute_string_with(&self, text: &str, ctx: &EvalContext) -> EvalResult {
        self.contained("substitute_string", || subst::substitute(self, text, ctx))
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn evaluate_file(&self, path: &Path) -> EvalResult {
        self.evaluate_file_with(path, &EvalContext::new())
    }

    pub fn evaluate_file_with(&self, path: &Path, ctx: &EvalContext) -> EvalResult {
        self.contained("evaluate_file", || self.source_file(path, ctx))
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    pub fn evaluate_stream(&self, reader: impl Read, name: &str) -> EvalResult {
        self.evaluate_stream_with(reader, name, &EvalContext::new())
    }

    pub fn evaluate_stream_with(&self, reader: impl Read, name: &str, ctx: &EvalContext) -> EvalResult {
        self.contained("evaluate_stream", || {
            let text = self.read_stream(reader, name, ctx)?;
            self.run_source(text, name, SourceKind::Stream, ctx)
        })
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn substitute_file(&self, path: &Path) -> EvalResult {
        self.substitute_file_with(path, &EvalContext::new())
    }

    pub fn substitute_file_with(&self, path: &Path, ctx: &EvalContext) -> EvalResult {
        self.contained("substitute_file", || {
            let text = self.read_file(path, ctx)?;
            self.substitute_source(text, &path.display().to_string(), ctx)
        })
    }

    #[instrument(level = "debug", skip_all, fields(name = %name))]
    pub fn substitute_stream(&self, reader: impl Read, name: &str) -> EvalResult {
        self.substitute_stream_with(reader, name, &EvalContext::new())
    }

    pub fn substitute_stream_with(&self, reader: impl Read, name: &str, ctx: &EvalContext) -> EvalResult {
        self.contained("substitute_stream", || {
            let text = self.read_stream(reader, name, ctx)?;
            self.substitute_source(text, name, ctx)
        })
    }

    /// Run one resolved entity directly, with an engine frame pushed around
    /// it.  The frame stack is back at its entry depth afterwards, whatever
    /// the entity did.
    #[instrument(level = "debug", skip_all, fields(name = %name))]
    pub fn execute_with_frame(
        &self,
        name: &str,
        entity: &Arc<Entity>,
        args: &[Value],
        ctx: &EvalContext,
    ) -> EvalResult {
        let _owner = self.eval_lock.acquire();
        let depth = self.frame_depth();
        let result = self.contained(name, || {
            let _frame = FrameGuard::push(self, CallFrame::engine(name));
            let _engine = self.levels.enter_engine();
            dispatch::execute(self, name, entity, args, ctx)
        });
        let leaked = self.frames().pop_to(depth);
        if leaked > 0 {
            debug!(name, leaked, "rebalanced frame stack after direct execution");
        }
        result
    }

    /// Evaluate a script file as a nested level (`source`).
    pub fn source_file(&self, path: &Path, ctx: &EvalContext) -> EvalResult {
        let text = self.read_file(path, ctx)?;
        self.run_source(text, &path.display().to_string(), SourceKind::File, ctx)
    }

    /// Contain a native fault that escaped every inner boundary.
    fn contained(&self, method: &str, body: impl FnOnce() -> EvalResult) -> EvalResult {
        let _owner = self.eval_lock.acquire();
        let depth = self.frame_depth();
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(payload) => {
                let fault = Fault::from_panic(payload, method);
                self.frames().pop_to(depth);
                if self.levels.script() == 0 {
                    self.errors().reset_unwind();
                    self.cancel_timeout();
                }
                let flow = match fault.kind {
                    FaultKind::StackOverflow | FaultKind::OutOfMemory => {
                        self.collect_garbage();
                        Flow::from(ScriptError::new(fault.describe()).with_fault(fault))
                    }
                    FaultKind::Interrupted => {
                        self.reset_abort();
                        Flow::from(ScriptError::new(fault.describe()).with_fault(fault))
                    }
                    FaultKind::Disposed | FaultKind::Panic => dispatch::fault_to_flow(self, fault, method),
                };
                if self.levels.script() == 0 {
                    self.set_last_code(ReturnCode::Error);
                }
                Err(flow)
            }
        }
    }

    fn check_read_policy(&self, kind: PolicyKind, name: &str, ctx: &EvalContext) -> Result<(), Flow> {
        if !self.config().safe || !ctx.checks_policy() {
            return Ok(());
        }
        let subject = PolicySubject { kind, name, hidden: false };
        let denied = self.policy().is_some_and(|p| p.check(&subject) == PolicyDecision::Denied);
        if denied {
            return Err(EngineError::PolicyDenied { kind: kind.name(), name: name.to_owned() }.into());
        }
        Ok(())
    }

    fn read_file(&self, path: &Path, ctx: &EvalContext) -> Result<String, Flow> {
        let name = path.display().to_string();
        self.check_read_policy(PolicyKind::File, &name, ctx)?;
        let loader = Arc::clone(&read(&self.loader));
        let text = loader(path).map_err(|source| EngineError::Io { path: name.clone(), source })?;
        if ctx.hits_breakpoints() && self.has_debugger() {
            hook::breakpoint(self, &BreakpointContext::new(BreakpointType::BeforeFile).named(&name))?;
        }
        Ok(text)
    }

    fn read_stream(&self, mut reader: impl Read, name: &str, ctx: &EvalContext) -> Result<String, Flow> {
        self.check_read_policy(PolicyKind::Stream, name, ctx)?;
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|source| EngineError::Io { path: name.to_owned(), source })?;
        if ctx.hits_breakpoints() && self.has_debugger() {
            hook::breakpoint(self, &BreakpointContext::new(BreakpointType::BeforeStream).named(name))?;
        }
        Ok(text)
    }

    fn run_source(&self, text: String, name: &str, kind: SourceKind, ctx: &EvalContext) -> EvalResult {
        let file: Arc<str> = Arc::from(name);
        let len = text.len();
        let mut state = ParseState::new(text).with_file(Some(Arc::clone(&file)));
        eval::guarded(self, ctx, |ctx| {
            let _frame = FrameGuard::push(self, CallFrame::engine(kind.label()));
            let result = eval::run_commands(self, &mut state, 0, len, ctx);
            if let Err(Flow::Error(e)) = &result {
                if e.error_line > 0 {
                    let info = format!("\n    ({} \"{}\" line {})", kind.label(), file, e.error_line);
                    trace::add_error_information(self, e, &info);
                }
            }
            result
        })
    }

    fn substitute_source(&self, text: String, name: &str, ctx: &EvalContext) -> EvalResult {
        let mut state = ParseState::new(text).with_file(Some(Arc::from(name)));
        eval::guarded(self, ctx, |ctx| subst::substitute_state(self, &mut state, ctx))
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    File,
    Stream,
}

impl SourceKind {
    fn label(self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Stream => "stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_and_remembers_result() {
        let interp = Interpreter::new();
        let v = interp.evaluate_script("set a 4; set b [set a]").unwrap();
        assert_eq!(v.to_string(), "4");
        assert_eq!(interp.result().to_string(), "4");
        assert_eq!(interp.last_return_code(), ReturnCode::Ok);
    }

    #[test]
    fn return_at_top_level_is_ok() {
        let interp = Interpreter::new();
        assert_eq!(interp.evaluate_script("return 7").unwrap().to_string(), "7");
    }

    #[test]
    fn expression_entry_point() {
        let interp = Interpreter::new();
        interp.set_variable("n", None, Value::from(6)).unwrap();
        assert_eq!(interp.evaluate_expression("$n * 7").unwrap(), Value::Int(42));
        let boolean = EvalContext::new().with_expr(crate::script::context::ExprFlags {
            boolean_result: true,
            ..Default::default()
        });
        assert_eq!(interp.evaluate_expression_with("$n", &boolean).unwrap(), Value::from(true));
    }

    #[test]
    fn stream_errors_name_the_stream() {
        let interp = Interpreter::new();
        let err = interp.evaluate_stream("set a 1\nnosuch".as_bytes(), "input").unwrap_err();
        assert_eq!(err.to_string(), "invalid command name \"nosuch\"");
        let info = interp.error_info().unwrap();
        assert!(info.ends_with("(stream \"input\" line 2)"), "{info}");
    }

    #[test]
    fn loader_failure_is_an_io_error() {
        let interp = Interpreter::new();
        interp.set_source_loader(Arc::new(|_: &Path| Err(io::Error::from(io::ErrorKind::NotFound))));
        let err = interp.evaluate_file(Path::new("missing.tcl")).unwrap_err();
        assert!(err.to_string().starts_with("couldn't read file \"missing.tcl\""));
    }

    #[test]
    fn execute_with_frame_restores_depth() {
        let interp = Interpreter::new();
        let entity = interp.registry().command("set").unwrap();
        let depth = interp.frame_depth();
        let args = [Value::from("set"), Value::from("v"), Value::from("1")];
        interp.execute_with_frame("set", &entity, &args, &EvalContext::new()).unwrap();
        assert_eq!(interp.frame_depth(), depth);
    }

    #[test]
    fn panicking_command_is_contained() {
        let interp = Interpreter::new();
        interp.registry_mut().add_command("boom", |_: &dispatch::Invocation<'_>, _: &[Value]| -> EvalResult {
            panic!("kaboom")
        });
        let err = interp.evaluate_script("boom").unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(interp.error_code().unwrap().starts_with("EXCEPTION"));
        assert!(interp.last_fault().is_some());
        assert_eq!(interp.evaluate_script("set ok 1").unwrap().to_string(), "1");
    }

    #[test]
    fn disposed_interpreter_rejects_evaluation() {
        let interp = Interpreter::new();
        interp.dispose();
        let err = interp.evaluate_script("set a 1").unwrap_err();
        assert_eq!(err.to_string(), "interpreter is unusable (disposed)");
    }

    #[test]
    fn exit_stops_the_command_loop() {
        let interp = Interpreter::new();
        interp.evaluate_script("set a 1; exit 3; set a 2").unwrap();
        assert_eq!(interp.exit_code(), Some(3));
        assert_eq!(interp.get_variable("a", None).unwrap().to_string(), "1");
    }
}
