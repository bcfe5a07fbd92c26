//! Command resolution and dispatch.
//!
//! Every invocation of a command, sub-command, procedure, math function or
//! operator goes through [`execute`]: checkpoint, visibility checks,
//! invocation under `catch_unwind`, usage accounting and breakpoints.
//! [`invoke`] adds name resolution through the interpreter's [`Resolver`]
//! and the unknown-command fallback.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::hook::{self, BreakpointContext, BreakpointType, Notification};
use crate::policy::{PolicyDecision, PolicyKind, PolicySubject};

use super::cancel::GateError;
use super::context::{ChildScope, EvalContext};
use super::events;
use super::expand::check_result_size;
use super::interp::Interpreter;
use super::procedure::{self, Procedure};
use super::result::{EvalResult, Fault, FaultKind, Flow, ReturnCode, ScriptError};
use super::trace;
use super::value::Value;

/// Opaque per-entity data handed back to the implementation on each call.
pub type ClientData = Arc<dyn Any + Send + Sync>;

// ── Execute ───────────────────────────────────────────────────────────────────

/// What an implementation sees when it is called.
pub struct Invocation<'a> {
    pub interp: &'a Interpreter,
    /// Context for nested evaluations started by the implementation.
    pub ctx: &'a EvalContext,
    pub name: &'a str,
    pub client_data: Option<&'a ClientData>,
}

/// A native implementation.  `args[0]` is the name the entity was invoked by.
pub trait Execute: Send + Sync {
    fn execute(&self, call: &Invocation<'_>, args: &[Value]) -> EvalResult;
}

impl<F> Execute for F
where
    F: Fn(&Invocation<'_>, &[Value]) -> EvalResult + Send + Sync,
{
    fn execute(&self, call: &Invocation<'_>, args: &[Value]) -> EvalResult {
        self(call, args)
    }
}

/// The capability an entity is dispatched through.
#[derive(Clone)]
pub enum Executable {
    Command(Arc<dyn Execute>),
    /// Selected by the first argument of `parent`.
    SubCommand { parent: String, handler: Arc<dyn Execute> },
    Procedure(Arc<Procedure>),
    /// Math function called from expressions.
    Function(Arc<dyn Execute>),
    /// Named infix operator called from expressions as `[lhs, rhs]`.
    Operator(Arc<dyn Execute>),
    Generic(Arc<dyn Execute>),
}

impl Executable {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Executable::Command(_) => "command",
            Executable::SubCommand { .. } => "subcommand",
            Executable::Procedure(_) => "procedure",
            Executable::Function(_) => "function",
            Executable::Operator(_) => "operator",
            Executable::Generic(_) => "executable",
        }
    }

    fn breakpoints(&self) -> (BreakpointType, BreakpointType) {
        match self {
            Executable::Command(_) => (BreakpointType::BeforeCommand, BreakpointType::AfterCommand),
            Executable::SubCommand { .. } => {
                (BreakpointType::BeforeSubCommand, BreakpointType::AfterSubCommand)
            }
            Executable::Procedure(_) => (BreakpointType::BeforeProcedure, BreakpointType::AfterProcedure),
            Executable::Function(_) => (BreakpointType::BeforeFunction, BreakpointType::AfterFunction),
            Executable::Operator(_) => (BreakpointType::BeforeOperator, BreakpointType::AfterOperator),
            Executable::Generic(_) => (BreakpointType::BeforeExecute, BreakpointType::AfterExecute),
        }
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executable::Procedure(p) => write!(f, "Procedure({})", p.name()),
            Executable::SubCommand { parent, .. } => write!(f, "SubCommand({parent})"),
            other => f.write_str(other.kind_name()),
        }
    }
}

// ── Entity ────────────────────────────────────────────────────────────────────

/// Call count and accumulated wall time of one entity.
#[derive(Debug, Default)]
pub struct UsageStats {
    calls: AtomicU64,
    nanos: AtomicU64,
}

/// Snapshot of [`UsageStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub calls: u64,
    /// Zero unless profiling was enabled.
    pub time: Duration,
}

impl UsageStats {
    fn record(&self, elapsed: Option<Duration>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(d) = elapsed {
            let n = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
            self.nanos.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Usage {
        Usage {
            calls: self.calls.load(Ordering::Relaxed),
            time: Duration::from_nanos(self.nanos.load(Ordering::Relaxed)),
        }
    }

    fn copy_from(&self, other: &UsageStats) {
        self.calls.store(other.calls.load(Ordering::Relaxed), Ordering::Relaxed);
        self.nanos.store(other.nanos.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// A named, resolvable executable.
#[derive(Debug)]
pub struct Entity {
    pub name: String,
    pub executable: Executable,
    pub client_data: Option<ClientData>,
    hidden: AtomicBool,
    disabled: AtomicBool,
    usage: UsageStats,
}

impl Entity {
    pub fn new(name: impl Into<String>, executable: Executable) -> Self {
        Entity {
            name: name.into(),
            executable,
            client_data: None,
            hidden: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            usage: UsageStats::default(),
        }
    }

    pub fn with_client_data(mut self, data: ClientData) -> Self {
        self.client_data = Some(data);
        self
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_hidden(&self, on: bool) {
        self.hidden.store(on, Ordering::Release);
    }

    pub fn set_disabled(&self, on: bool) {
        self.disabled.store(on, Ordering::Release);
    }

    pub fn usage(&self) -> Usage {
        self.usage.snapshot()
    }

    /// Same entity under another name, keeping flags and statistics.
    fn renamed(&self, name: &str) -> Entity {
        let e = Entity {
            name: name.to_owned(),
            executable: self.executable.clone(),
            client_data: self.client_data.clone(),
            hidden: AtomicBool::new(self.is_hidden()),
            disabled: AtomicBool::new(self.is_disabled()),
            usage: UsageStats::default(),
        };
        e.usage.copy_from(&self.usage);
        e
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Name tables for every kind of entity.
#[derive(Debug, Default)]
pub struct Registry {
    commands: BTreeMap<String, Arc<Entity>>,
    sub_commands: BTreeMap<(String, String), Arc<Entity>>,
    functions: BTreeMap<String, Arc<Entity>>,
    operators: BTreeMap<String, Arc<Entity>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pre-built entity under its own name.  Returns the entity.
    pub fn add_executable(&mut self, entity: Entity) -> Arc<Entity> {
        let entity = Arc::new(entity);
        let name = entity.name.clone();
        match &entity.executable {
            Executable::SubCommand { parent, .. } => {
                self.sub_commands.insert((parent.clone(), name), Arc::clone(&entity));
            }
            Executable::Function(_) => {
                self.functions.insert(name, Arc::clone(&entity));
            }
            Executable::Operator(_) => {
                self.operators.insert(name, Arc::clone(&entity));
            }
            Executable::Command(_) | Executable::Procedure(_) | Executable::Generic(_) => {
                self.commands.insert(name, Arc::clone(&entity));
            }
        }
        entity
    }

    pub fn add_command(&mut self, name: &str, handler: impl Execute + 'static) -> Arc<Entity> {
        self.add_executable(Entity::new(name, Executable::Command(Arc::new(handler))))
    }

    pub fn add_sub_command(
        &mut self,
        parent: &str,
        name: &str,
        handler: impl Execute + 'static,
    ) -> Arc<Entity> {
        let exe = Executable::SubCommand { parent: parent.to_owned(), handler: Arc::new(handler) };
        self.add_executable(Entity::new(name, exe))
    }

    pub fn add_procedure(&mut self, procedure: Procedure) -> Arc<Entity> {
        let name = procedure.name().to_owned();
        self.add_executable(Entity::new(name, Executable::Procedure(Arc::new(procedure))))
    }

    pub fn add_function(&mut self, name: &str, handler: impl Execute + 'static) -> Arc<Entity> {
        self.add_executable(Entity::new(name, Executable::Function(Arc::new(handler))))
    }

    pub fn add_operator(&mut self, name: &str, handler: impl Execute + 'static) -> Arc<Entity> {
        self.add_executable(Entity::new(name, Executable::Operator(Arc::new(handler))))
    }

    pub fn command(&self, name: &str) -> Option<Arc<Entity>> {
        self.commands.get(name).cloned()
    }

    pub fn sub_command(&self, parent: &str, name: &str) -> Option<Arc<Entity>> {
        self.sub_commands.get(&(parent.to_owned(), name.to_owned())).cloned()
    }

    pub fn function(&self, name: &str) -> Option<Arc<Entity>> {
        self.functions.get(name).cloned()
    }

    pub fn operator(&self, name: &str) -> Option<Arc<Entity>> {
        self.operators.get(name).cloned()
    }

    /// Visible command names starting with `prefix`, in order.
    pub fn commands_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.commands
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .filter(|(_, e)| !e.is_hidden())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    /// Remove a command and its sub-commands.  Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.sub_commands.retain(|(parent, _), _| parent != name);
        self.commands.remove(name).is_some()
    }

    /// Rename a command; an empty `new` deletes it.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), String> {
        let Some(entity) = self.commands.get(old).cloned() else {
            return Err(format!("can't rename \"{old}\": command doesn't exist"));
        };
        if new.is_empty() {
            self.remove(old);
            return Ok(());
        }
        if self.commands.contains_key(new) {
            return Err(format!("can't rename to \"{new}\": command already exists"));
        }
        self.commands.remove(old);
        self.commands.insert(new.to_owned(), Arc::new(entity.renamed(new)));
        let subs: Vec<_> = self
            .sub_commands
            .keys()
            .filter(|(parent, _)| parent == old)
            .cloned()
            .collect();
        for key in subs {
            if let Some(sub) = self.sub_commands.remove(&key) {
                self.sub_commands.insert((new.to_owned(), key.1), sub);
            }
        }
        Ok(())
    }

    pub fn set_hidden(&self, name: &str, on: bool) -> bool {
        self.commands.get(name).map(|e| e.set_hidden(on)).is_some()
    }

    pub fn set_disabled(&self, name: &str, on: bool) -> bool {
        self.commands.get(name).map(|e| e.set_disabled(on)).is_some()
    }

    pub fn usage(&self, name: &str) -> Option<Usage> {
        self.commands.get(name).map(|e| e.usage())
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Resolution {
    Found(Arc<Entity>),
    /// Several commands share the prefix.
    Ambiguous(Vec<String>),
    NotFound,
}

pub trait Resolver: Send + Sync {
    /// Resolve `name` (`args[0]`) against `registry`.  With `exact` unset,
    /// a unique visible prefix match is accepted.
    fn resolve(&self, registry: &Registry, name: &str, args: &[Value], exact: bool) -> Resolution;
}

/// Sub-command first (when an argument selects one), then the command
/// table, then unique prefixes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve(&self, registry: &Registry, name: &str, args: &[Value], exact: bool) -> Resolution {
        if let Some(sub) = args.get(1) {
            if let Some(e) = registry.sub_command(name, &sub.to_string()) {
                return Resolution::Found(e);
            }
        }
        if let Some(e) = registry.command(name) {
            return Resolution::Found(e);
        }
        if exact || name.is_empty() {
            return Resolution::NotFound;
        }
        let mut matches = registry.commands_with_prefix(name);
        match matches.len() {
            0 => Resolution::NotFound,
            1 => registry.command(&matches.remove(0)).map_or(Resolution::NotFound, Resolution::Found),
            _ => Resolution::Ambiguous(matches),
        }
    }
}

/// Fallback for names that do not resolve.
///
/// `Ok(Some)` supplies a replacement entity and argument list.  A `Break`
/// error makes the invocation succeed with an empty result; `Continue`
/// makes it fail as an invalid command without further fallback.
pub trait UnknownHandler: Send + Sync {
    fn unknown(
        &self,
        interp: &Interpreter,
        ctx: &EvalContext,
        args: &[Value],
    ) -> Result<Option<(Arc<Entity>, Vec<Value>)>, Flow>;
}

/// Delegates to a script-level `unknown` command when one is defined.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownCommand;

impl UnknownHandler for UnknownCommand {
    fn unknown(
        &self,
        interp: &Interpreter,
        _ctx: &EvalContext,
        args: &[Value],
    ) -> Result<Option<(Arc<Entity>, Vec<Value>)>, Flow> {
        let Some(entity) = interp.registry().command("unknown") else {
            return Ok(None);
        };
        if args.first().is_some_and(|a| a.to_string() == "unknown") {
            return Ok(None);
        }
        let mut replaced = Vec::with_capacity(args.len() + 1);
        replaced.push(Value::from("unknown"));
        replaced.extend_from_slice(args);
        Ok(Some((entity, replaced)))
    }
}

fn invalid_command(name: &str) -> Flow {
    Flow::error_with_code(format!("invalid command name \"{name}\""), format!("TCL LOOKUP COMMAND {name}"))
}

// ── Active interpreter ────────────────────────────────────────────────────────

thread_local! {
    static ACTIVE: RefCell<Vec<Weak<Interpreter>>> = const { RefCell::new(Vec::new()) };
}

/// Marks `interp` as the interpreter running native code on this thread.
#[must_use = "the interpreter is deactivated when the guard is dropped"]
pub struct ActiveInterpreter {
    _private: (),
}

impl ActiveInterpreter {
    pub fn enter(interp: &Interpreter) -> Self {
        ACTIVE.with(|stack| stack.borrow_mut().push(interp.downgrade()));
        ActiveInterpreter { _private: () }
    }

    /// The innermost interpreter dispatching on this thread.
    pub fn current() -> Option<Arc<Interpreter>> {
        ACTIVE.with(|stack| stack.borrow().last().and_then(Weak::upgrade))
    }
}

impl Drop for ActiveInterpreter {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Resolve `args[0]` and execute it.
pub fn invoke(interp: &Interpreter, args: &[Value], ctx: &EvalContext) -> EvalResult {
    let Some(first) = args.first() else {
        return Ok(Value::empty());
    };
    let name = first.to_string();
    let exact = ctx.exact_match_only() || !interp.config().inexact_commands;
    let resolution = {
        let resolver = interp.resolver();
        let registry = interp.registry();
        resolver.resolve(&registry, &name, args, exact)
    };
    match resolution {
        Resolution::Found(entity) => execute(interp, &name, &entity, args, ctx),
        Resolution::Ambiguous(names) => Err(Flow::error(format!(
            "ambiguous command name \"{name}\": {}",
            names.join(" ")
        ))),
        Resolution::NotFound => invoke_unknown(interp, &name, args, ctx),
    }
}

fn invoke_unknown(interp: &Interpreter, name: &str, args: &[Value], ctx: &EvalContext) -> EvalResult {
    if !ctx.uses_unknown() {
        return Err(invalid_command(name));
    }
    let Some(handler) = interp.unknown_handler() else {
        return Err(invalid_command(name));
    };
    if ctx.hits_breakpoints() && interp.has_debugger() {
        hook::breakpoint(interp, &BreakpointContext::new(BreakpointType::Unknown).named(name).with_arguments(args))?;
    }
    match handler.unknown(interp, ctx, args) {
        Ok(Some((entity, replaced))) => {
            let ctx = ctx.no_unknown(true);
            execute(interp, &entity.name.clone(), &entity, &replaced, &ctx)
        }
        Ok(None) => Err(invalid_command(name)),
        Err(Flow::Break) => {
            trace!(name, "unknown handler suppressed the command");
            Ok(Value::empty())
        }
        Err(Flow::Continue) => Err(invalid_command(name)),
        Err(other) => Err(other),
    }
}

/// Whether a hidden entity may run: explicit intent, or approval by the
/// policy of a safe interpreter.
fn hidden_allowed(interp: &Interpreter, entity: &Entity, ctx: &EvalContext, safe: bool) -> bool {
    if ctx.invokes_hidden() {
        return true;
    }
    if !safe || !ctx.checks_policy() {
        return false;
    }
    let subject = PolicySubject { kind: PolicyKind::Command, name: &entity.name, hidden: true };
    interp.policy().is_some_and(|p| p.check(&subject) == PolicyDecision::Approved)
}

fn policy_denies(interp: &Interpreter, kind: PolicyKind, name: &str) -> bool {
    let subject = PolicySubject { kind, name, hidden: false };
    interp.policy().is_some_and(|p| p.check(&subject) == PolicyDecision::Denied)
}

/// Execute a resolved entity.  The single funnel for every invocation.
pub fn execute(
    interp: &Interpreter,
    name: &str,
    entity: &Arc<Entity>,
    args: &[Value],
    ctx: &EvalContext,
) -> EvalResult {
    events::check_events(interp, ctx)?;

    let config = interp.config();
    if entity.is_disabled() {
        return Err(Flow::error(format!("command \"{name}\" is disabled")));
    }
    if entity.is_hidden() && !hidden_allowed(interp, entity, ctx, config.safe) {
        let message = if config.safe {
            format!("permission denied: safe interpreter cannot use hidden command \"{name}\"")
        } else {
            format!("permission denied: command \"{name}\" is hidden")
        };
        return Err(Flow::error(message));
    }
    if config.safe && ctx.checks_policy() {
        let kind = match &entity.executable {
            Executable::SubCommand { .. } => Some(PolicyKind::SubCommand),
            Executable::Procedure(_) => Some(PolicyKind::Procedure),
            _ => None,
        };
        if let Some(kind) = kind {
            if policy_denies(interp, kind, name) {
                return Err(EngineError::PolicyDenied { kind: kind.name(), name: name.to_owned() }.into());
            }
        }
    }

    let (before, after) = entity.executable.breakpoints();
    let breakpoints = ctx.hits_breakpoints() && interp.has_debugger();
    if breakpoints {
        hook::breakpoint(interp, &BreakpointContext::new(before).named(name).with_arguments(args))?;
    }

    let started = config.profile.then(Instant::now);
    let depth = interp.frame_depth();
    let outcome = {
        let _active = ActiveInterpreter::enter(interp);
        catch_unwind(AssertUnwindSafe(|| run(interp, name, entity, args, ctx)))
    };
    entity.usage.record(started.map(|s| s.elapsed()));

    let mut result = match outcome {
        Ok(result) => result,
        Err(payload) => {
            let fault = Fault::from_panic(payload, name);
            let popped = interp.frames().pop_automatic_until(depth);
            if popped > 0 {
                debug!(name, popped, "popped frames left by a faulting call");
            }
            match fault.kind {
                FaultKind::StackOverflow | FaultKind::OutOfMemory | FaultKind::Interrupted => {
                    resume_unwind(Box::new(fault))
                }
                FaultKind::Disposed | FaultKind::Panic => Err(fault_to_flow(interp, fault, name)),
            }
        }
    };

    if let Ok(v) = &result {
        if let Err(e) = check_result_size(interp, v.byte_len()) {
            result = Err(e);
        }
    }
    if breakpoints {
        let context = BreakpointContext::new(after).named(name).with_arguments(args).with_code(ReturnCode::of(&result));
        hook::breakpoint(interp, &context)?;
    }
    if let Err(Flow::Return(v)) = &result {
        if interp.levels().engine() <= 1 {
            interp.set_result(v.clone());
        }
    }
    if ctx.notifies() {
        hook::notify(interp, &Notification::Executed { name, code: ReturnCode::of(&result) });
    }
    result
}

fn run(interp: &Interpreter, name: &str, entity: &Arc<Entity>, args: &[Value], ctx: &EvalContext) -> EvalResult {
    let handler = match &entity.executable {
        Executable::Procedure(p) => return procedure::invoke(interp, p, args, ctx),
        Executable::Command(h)
        | Executable::SubCommand { handler: h, .. }
        | Executable::Function(h)
        | Executable::Operator(h)
        | Executable::Generic(h) => h,
    };
    let child = ctx.child_for(ChildScope::Nested);
    let call = Invocation { interp, ctx: &child, name, client_data: entity.client_data.as_ref() };
    handler.execute(&call, args)
}

/// Convert a contained fault into the script-visible error.
///
/// Disposal and a disposed interpreter yield the stable unusable error;
/// anything else is formatted and recorded in `errorCode`.
pub fn fault_to_flow(interp: &Interpreter, fault: Fault, method: &str) -> Flow {
    let fault = Arc::new(fault);
    if fault.kind == FaultKind::Disposed || !interp.is_usable() {
        debug!(method, "fault in unusable interpreter");
        let mut e = ScriptError::from(GateError::Unusable);
        e.fault = Some(fault);
        return Flow::from(e);
    }
    let message = fault.describe();
    warn!(method, fault = %fault, "native fault contained");
    hook::notify(interp, &Notification::Fault { method, message: &message });
    trace::set_exception_error_code(interp, &fault, method);
    let mut e = ScriptError::new(message);
    e.error_code = interp.global_var(trace::ERROR_CODE).map(Value::into_string);
    e.fault = Some(fault);
    Flow::from(e)
}
