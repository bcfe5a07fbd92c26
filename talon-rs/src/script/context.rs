//! Per-call evaluation context.
//!
//! An [`EvalContext`] bundles the engine, substitution, event and
//! expression options of one evaluation call.  It is a small `Copy` value:
//! callees receive a derived copy built with [`EvalContext::child_for`] or
//! [`EvalContext::combine`], never a mutable reference to the caller's.

/// Engine-level options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineFlags {
    pub no_events: bool,
    pub no_ready: bool,
    pub no_history: bool,
    pub no_cache: bool,
    pub no_unknown: bool,
    pub no_policy: bool,
    pub no_breakpoint: bool,
    pub no_notify: bool,
    pub no_stack_check: bool,
    pub no_reset_abort: bool,
    pub invoke_hidden: bool,
    pub evaluate_global: bool,
    pub external_script: bool,
    pub exact_match: bool,
    pub bracket_terminated: bool,
    pub respect_pending_cancel: bool,
    pub reset_return_code: bool,
    /// Error-state flag: the current error has already been logged at this level.
    pub error_already_logged: bool,
}

/// Which substitutions `subst`-style evaluation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubstFlags {
    pub no_backslashes: bool,
    pub no_commands: bool,
    pub no_variables: bool,
}

/// Which queued events a checkpoint may process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags {
    pub no_timers: bool,
    pub no_scripts: bool,
}

/// Expression evaluation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExprFlags {
    pub no_cache: bool,
    pub boolean_result: bool,
}

/// How a callee context relates to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildScope {
    /// Nested evaluation on behalf of the caller (command substitution,
    /// `eval`, loop bodies).
    Nested,
    /// A procedure body: call-specific intent such as `invoke_hidden` is
    /// not inherited.
    Procedure,
    /// Evaluation queued by the host or an event: only the caller's
    /// substitution and expression options survive.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalContext {
    engine: EngineFlags,
    subst: SubstFlags,
    events: EventFlags,
    expr: ExprFlags,
}

macro_rules! engine_setter {
    ($($name:ident),* $(,)?) => {
        $(
            #[doc = concat!("Return a copy with `", stringify!($name), "` set.")]
            pub fn $name(mut self, on: bool) -> Self {
                self.engine.$name = on;
                self
            }
        )*
    };
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: EngineFlags) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_subst(mut self, subst: SubstFlags) -> Self {
        self.subst = subst;
        self
    }

    pub fn with_events(mut self, events: EventFlags) -> Self {
        self.events = events;
        self
    }

    pub fn with_expr(mut self, expr: ExprFlags) -> Self {
        self.expr = expr;
        self
    }

    engine_setter!(
        no_events,
        no_ready,
        no_history,
        no_cache,
        no_unknown,
        no_policy,
        no_breakpoint,
        no_notify,
        no_stack_check,
        no_reset_abort,
        invoke_hidden,
        evaluate_global,
        external_script,
        exact_match,
        bracket_terminated,
        respect_pending_cancel,
        reset_return_code,
        error_already_logged,
    );

    pub fn engine(&self) -> EngineFlags {
        self.engine
    }

    pub fn subst(&self) -> SubstFlags {
        self.subst
    }

    pub fn events(&self) -> EventFlags {
        self.events
    }

    pub fn expr(&self) -> ExprFlags {
        self.expr
    }

    // ── Predicates ────────────────────────────────────────────────────────

    pub fn processes_events(&self) -> bool {
        !self.engine.no_events
    }

    pub fn checks_ready(&self) -> bool {
        !self.engine.no_ready
    }

    pub fn records_history(&self) -> bool {
        !self.engine.no_history
    }

    pub fn uses_cache(&self) -> bool {
        !self.engine.no_cache
    }

    pub fn uses_unknown(&self) -> bool {
        !self.engine.no_unknown
    }

    pub fn checks_policy(&self) -> bool {
        !self.engine.no_policy
    }

    pub fn hits_breakpoints(&self) -> bool {
        !self.engine.no_breakpoint
    }

    pub fn notifies(&self) -> bool {
        !self.engine.no_notify
    }

    pub fn checks_stack(&self) -> bool {
        !self.engine.no_stack_check
    }

    pub fn resets_abort(&self) -> bool {
        !self.engine.no_reset_abort
    }

    pub fn invokes_hidden(&self) -> bool {
        self.engine.invoke_hidden
    }

    pub fn evaluates_global(&self) -> bool {
        self.engine.evaluate_global
    }

    pub fn is_external_script(&self) -> bool {
        self.engine.external_script
    }

    pub fn exact_match_only(&self) -> bool {
        self.engine.exact_match
    }

    pub fn is_bracket_terminated(&self) -> bool {
        self.engine.bracket_terminated
    }

    pub fn respects_pending_cancel(&self) -> bool {
        self.engine.respect_pending_cancel
    }

    pub fn resets_return_code(&self) -> bool {
        self.engine.reset_return_code
    }

    pub fn has_error_already_logged(&self) -> bool {
        self.engine.error_already_logged
    }

    pub fn substitutes_backslashes(&self) -> bool {
        !self.subst.no_backslashes
    }

    pub fn substitutes_commands(&self) -> bool {
        !self.subst.no_commands
    }

    pub fn substitutes_variables(&self) -> bool {
        !self.subst.no_variables
    }

    pub fn processes_timers(&self) -> bool {
        !self.events.no_timers
    }

    pub fn processes_queued_scripts(&self) -> bool {
        !self.events.no_scripts
    }

    pub fn caches_expressions(&self) -> bool {
        !self.expr.no_cache && !self.engine.no_cache
    }

    pub fn wants_boolean(&self) -> bool {
        self.expr.boolean_result
    }

    // ── Derivation ────────────────────────────────────────────────────────

    /// OR this context with the interpreter-wide one.  Error-state flags are
    /// taken from `self` only.
    pub fn combine(&self, wide: &EvalContext) -> EvalContext {
        let a = self.engine;
        let b = wide.engine;
        let engine = EngineFlags {
            no_events: a.no_events || b.no_events,
            no_ready: a.no_ready || b.no_ready,
            no_history: a.no_history || b.no_history,
            no_cache: a.no_cache || b.no_cache,
            no_unknown: a.no_unknown || b.no_unknown,
            no_policy: a.no_policy || b.no_policy,
            no_breakpoint: a.no_breakpoint || b.no_breakpoint,
            no_notify: a.no_notify || b.no_notify,
            no_stack_check: a.no_stack_check || b.no_stack_check,
            no_reset_abort: a.no_reset_abort || b.no_reset_abort,
            invoke_hidden: a.invoke_hidden || b.invoke_hidden,
            evaluate_global: a.evaluate_global || b.evaluate_global,
            external_script: a.external_script || b.external_script,
            exact_match: a.exact_match || b.exact_match,
            bracket_terminated: a.bracket_terminated,
            respect_pending_cancel: a.respect_pending_cancel || b.respect_pending_cancel,
            reset_return_code: a.reset_return_code || b.reset_return_code,
            error_already_logged: a.error_already_logged,
        };
        EvalContext {
            engine,
            subst: SubstFlags {
                no_backslashes: self.subst.no_backslashes || wide.subst.no_backslashes,
                no_commands: self.subst.no_commands || wide.subst.no_commands,
                no_variables: self.subst.no_variables || wide.subst.no_variables,
            },
            events: EventFlags {
                no_timers: self.events.no_timers || wide.events.no_timers,
                no_scripts: self.events.no_scripts || wide.events.no_scripts,
            },
            expr: ExprFlags {
                no_cache: self.expr.no_cache || wide.expr.no_cache,
                boolean_result: self.expr.boolean_result,
            },
        }
    }

    /// Context for a callee evaluation.
    ///
    /// Error-state and per-buffer flags never propagate; the remaining
    /// masking depends on `scope`.
    pub fn child_for(&self, scope: ChildScope) -> EvalContext {
        let mut child = *self;
        child.engine.error_already_logged = false;
        child.engine.bracket_terminated = false;
        child.engine.evaluate_global = false;
        child.engine.external_script = false;
        child.expr.boolean_result = false;
        match scope {
            ChildScope::Nested => {}
            ChildScope::Procedure => {
                child.engine.invoke_hidden = false;
            }
            ChildScope::Fresh => {
                child.engine = EngineFlags {
                    no_history: self.engine.no_history,
                    no_cache: self.engine.no_cache,
                    no_notify: self.engine.no_notify,
                    ..EngineFlags::default()
                };
                child.events = EventFlags::default();
            }
        }
        child
    }
}
