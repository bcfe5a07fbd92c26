//! End-to-end behaviour of the evaluation engine through the public API.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use talon::config::EngineConfig;
use talon::hook::{BreakpointContext, BreakpointType, Debugger, Notification, Observer};
use talon::policy::{PolicyKind, RegexPolicy};
use talon::script::cancel::{Interrupt, LockMode};
use talon::script::dispatch::Invocation;
use talon::script::events::{EventKind, TIMEOUT_MESSAGE};
use talon::script::{EvalContext, EvalResult, Flow, Interpreter, ReturnCode, Value};

fn eval(interp: &Interpreter, script: &str) -> String {
    match interp.evaluate_script(script) {
        Ok(v) => v.to_string(),
        Err(e) => panic!("{script:?} failed: {e}"),
    }
}

fn eval_err(interp: &Interpreter, script: &str) -> String {
    match interp.evaluate_script(script) {
        Ok(v) => panic!("{script:?} unexpectedly returned {v}"),
        Err(e) => e.to_string(),
    }
}

fn with_config(edit: impl FnOnce(&mut EngineConfig)) -> Arc<Interpreter> {
    let mut config = EngineConfig::default();
    edit(&mut config);
    Interpreter::with_config(config)
}

// ── Basics ────────────────────────────────────────────────────────────────────

#[test]
fn commands_words_and_substitution() {
    let interp = Interpreter::new();
    assert_eq!(eval(&interp, "set greeting hello; set who world"), "world");
    assert_eq!(eval(&interp, "set s \"$greeting, $who!\""), "hello, world!");
    assert_eq!(eval(&interp, "set t {$greeting}"), "$greeting");
    assert_eq!(eval(&interp, "set n [expr {1 + [set x 2]}]"), "3");
    assert_eq!(eval(&interp, "set tab a\\tb"), "a\tb");
    assert_eq!(eval(&interp, "# a comment\nset after 1"), "1");
}

#[test]
fn empty_script_is_an_empty_result() {
    let interp = Interpreter::new();
    assert_eq!(eval(&interp, ""), "");
    assert_eq!(eval(&interp, "  \n ;; \n"), "");
    assert_eq!(interp.last_return_code(), ReturnCode::Ok);
}

#[test]
fn invalid_command_reports_lookup_code() {
    let interp = Interpreter::new();
    assert_eq!(eval_err(&interp, "nosuch 1 2"), "invalid command name \"nosuch\"");
    assert_eq!(interp.error_code().as_deref(), Some("TCL LOOKUP COMMAND nosuch"));
    assert_eq!(interp.last_return_code(), ReturnCode::Error);
}

#[test]
fn unbalanced_input_is_a_parse_error() {
    let interp = Interpreter::new();
    assert!(eval_err(&interp, "set x {abc").contains("missing close-brace"));
    assert!(eval_err(&interp, "set x [set y").contains("missing close-bracket"));
}

#[test]
fn return_break_continue_at_the_outermost_level() {
    let interp = Interpreter::new();
    assert_eq!(eval(&interp, "return done; set never 1"), "done");
    assert!(interp.get_variable("never", None).is_err());

    let err = interp.evaluate_script("break").unwrap_err();
    assert!(matches!(err, Flow::Break));

    let lenient = with_config(|c| c.reset_return_code = true);
    assert_eq!(eval(&lenient, "set a 1; continue"), "");
}

#[test]
fn break_outside_a_loop_inside_a_procedure() {
    let interp = Interpreter::new();
    eval(&interp, "proc p {} { break }");
    assert_eq!(eval_err(&interp, "p"), "invoked \"break\" outside of a loop");
}

// ── Substitution and expressions ──────────────────────────────────────────────

#[test]
fn substitute_string_entry_point() {
    let interp = Interpreter::new();
    interp.set_variable("name", None, Value::from("talon")).unwrap();
    assert_eq!(interp.substitute_string("hi $name [expr 2*3]\\n").unwrap().to_string(), "hi talon 6\n");
    assert!(interp.substitute_string("$missing").is_err());
}

#[test]
fn expressions_with_variables_and_commands() {
    let interp = Interpreter::new();
    interp.set_variable("a", None, Value::Int(7)).unwrap();
    assert_eq!(interp.evaluate_expression("$a * 6").unwrap().to_string(), "42");
    assert_eq!(interp.evaluate_expression("[set a] > 3 ? \"big\" : \"small\"").unwrap().to_string(), "big");
    assert_eq!(interp.evaluate_expression("\"abc\" eq {abc}").unwrap().to_string(), "1");
    assert_eq!(interp.evaluate_expression("7 / 2").unwrap().to_string(), "3");
    assert_eq!(interp.evaluate_expression("7 / 2.0").unwrap().to_string(), "3.5");
    let err = interp.evaluate_expression("1 / 0").unwrap_err();
    assert_eq!(err.to_string(), "divide by zero");
}

#[test]
fn expression_cache_is_used_and_bounded() {
    let interp = with_config(|c| c.expr_cache_capacity = 2);
    for i in 0..5 {
        interp.evaluate_expression(&format!("{i} + 1")).unwrap();
    }
    assert!(interp.expr_cache().len() <= 2);
    interp.evaluate_expression("1 + 1").unwrap();
    assert!(!interp.expr_cache().is_empty());
}

#[test]
fn result_size_limit() {
    let interp = with_config(|c| c.max_result_size = Some(8));
    assert_eq!(eval(&interp, "set ok short"), "short");
    assert!(eval_err(&interp, "set big 0123456789abcdef").starts_with("result too large"));
}

// ── Procedures and frames ─────────────────────────────────────────────────────

#[test]
fn procedures_see_locals_and_linked_globals() {
    let interp = Interpreter::new();
    eval(&interp, "set counter 0");
    eval(&interp, "proc bump {{by 1}} { global counter; set local $by; incr counter $by }");
    assert_eq!(eval(&interp, "bump; bump 5"), "6");
    assert!(interp.get_variable("local", None).is_err());
    assert_eq!(interp.frame_depth(), 1);
}

#[test]
fn variadic_arguments() {
    let interp = Interpreter::new();
    eval(&interp, "proc count {first args} { llength $args }");
    assert_eq!(eval(&interp, "count a b c d"), "3");
    assert_eq!(eval(&interp, "count a"), "0");
}

#[test]
fn recursion_limit_reports_stack_overflow() {
    let interp = with_config(|c| c.max_levels = 40);
    eval(&interp, "proc down {n} { down [incr n] }");
    assert!(eval_err(&interp, "down 0").contains("stack overflow"));
    assert_eq!(interp.frame_depth(), 1);
    // The interpreter is usable afterwards.
    assert_eq!(eval(&interp, "set after 1"), "1");
}

#[test]
fn evaluate_global_runs_at_global_scope() {
    let interp = with_config(|c| c.evaluate_global = true);
    eval(&interp, "proc setg {} { set inner 1 }");
    eval(&interp, "setg");
    assert!(interp.get_variable("inner", None).is_err());
    eval(&interp, "set outer 2");
    assert_eq!(interp.global_var("outer").map(|v| v.to_string()).as_deref(), Some("2"));
}

#[test]
fn execute_with_frame_keeps_the_stack_balanced() {
    let interp = Interpreter::new();
    let entity = interp.registry_mut().add_command("leaky", |call: &Invocation<'_>, _: &[Value]| -> EvalResult {
        call.interp.evaluate_script_with("proc inner {} { error oops }; inner", call.ctx)
    });
    let before = interp.frame_depth();
    let result = interp.execute_with_frame("leaky", &entity, &[Value::from("leaky")], &EvalContext::new());
    assert_eq!(result.unwrap_err().to_string(), "oops");
    assert_eq!(interp.frame_depth(), before);
}

// ── Unknown commands and resolution ───────────────────────────────────────────

#[test]
fn unknown_command_handler_script() {
    let interp = Interpreter::new();
    eval(&interp, "proc unknown {args} { return \"unknown:$args\" }");
    assert_eq!(eval(&interp, "frobnicate a b"), "unknown:frobnicate a b");
}

#[test]
fn inexact_command_names() {
    let exact = Interpreter::new();
    assert!(eval_err(&exact, "llen {a b}").starts_with("invalid command name"));

    let inexact = with_config(|c| c.inexact_commands = true);
    assert_eq!(eval(&inexact, "llen {a b}"), "2");
    assert!(eval_err(&inexact, "s x 1").starts_with("ambiguous command name \"s\""));
}

// ── Cancellation, halting and timeouts ────────────────────────────────────────

#[test]
fn halt_from_another_thread_stops_a_loop() {
    let interp = Interpreter::new();
    let remote = Arc::clone(&interp);
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.halt_evaluate(None).unwrap();
    });
    let err = eval_err(&interp, "while 1 { set spin 1 }");
    stopper.join().unwrap();
    assert_eq!(err, "interpreter halted");
    assert_eq!(eval_err(&interp, "set x 1"), "interpreter halted");
    interp.gate().reset_halt(LockMode::Block).unwrap();
    assert_eq!(eval(&interp, "set x 1"), "1");
}

#[test]
fn cancel_with_custom_message() {
    let interp = Interpreter::new();
    let remote = Arc::clone(&interp);
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.cancel_evaluate(false, Some("stop now".into())).unwrap();
    });
    let err = eval_err(&interp, "while 1 { set spin 1 }");
    stopper.join().unwrap();
    assert_eq!(err, "stop now");
    // A pending cancel does not outlive the outermost evaluation.
    assert_eq!(eval(&interp, "set x 1"), "1");
}

#[test]
fn script_timeout_cancels_outermost_evaluation() {
    let interp = with_config(|c| c.script_timeout = Some(Duration::from_millis(50)));
    let err = eval_err(&interp, "while 1 { catch { set spin 1 } }");
    assert_eq!(err, TIMEOUT_MESSAGE);
    assert_eq!(eval(&interp, "set quick 1"), "1");
}

#[test]
fn interrupt_callback_fires_once() {
    let interp = Interpreter::new();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    interp.set_interrupt_callback(Some(Arc::new(move |interrupt: Interrupt, message: &str| -> Result<(), String> {
        sink.lock().unwrap().push(format!("{interrupt:?}:{message}"));
        Ok(())
    })));
    interp.registry_mut().add_command("stop", |call: &Invocation<'_>, _: &[Value]| -> EvalResult {
        call.interp.cancel_evaluate(true, None)?;
        Ok(Value::empty())
    });
    assert_eq!(eval_err(&interp, "stop; set a 1; set b 2"), "eval unwound");
    assert_eq!(*fired.lock().unwrap(), vec!["Unwound:eval unwound".to_owned()]);
}

#[test]
fn deleted_and_disposed_interpreters() {
    let interp = Interpreter::new();
    interp.delete().unwrap();
    assert_eq!(eval_err(&interp, "set a 1"), "attempt to call eval in deleted interpreter");

    let interp = Interpreter::new();
    interp.dispose();
    assert!(!interp.is_usable());
    assert_eq!(eval_err(&interp, "set a 1"), "interpreter is unusable (disposed)");
}

#[test]
fn panicking_command_is_contained() {
    let interp = Interpreter::new();
    interp.registry_mut().add_command("explode", |_: &Invocation<'_>, _: &[Value]| -> EvalResult {
        panic!("kaboom");
    });
    assert_eq!(eval(&interp, "catch {explode} msg"), "1");
    let msg = interp.get_variable("msg", None).unwrap().to_string();
    assert!(msg.starts_with("caught ") && msg.ends_with("kaboom"), "{msg}");
    assert_eq!(eval(&interp, "set still 1"), "1");
}

#[test]
fn native_fault_inside_a_procedure_keeps_frames_balanced() {
    let interp = Interpreter::new();
    interp.registry_mut().add_command("explode", |_: &Invocation<'_>, _: &[Value]| -> EvalResult {
        panic!("kaboom");
    });
    eval(&interp, "proc outer {} { set a 1; inner; set b 2 }");
    eval(&interp, "proc inner {} { set c 3; explode; set d 4 }");
    let depth = interp.frame_depth();

    let err = eval_err(&interp, "outer");
    assert!(err.contains("kaboom"), "{err}");
    assert_eq!(interp.frame_depth(), depth);
    assert_eq!(interp.levels().script(), 0);
    assert!(interp.get_variable("a", None).is_err(), "procedure locals stay in their frames");

    assert_eq!(eval(&interp, "catch outer"), "1");
    assert_eq!(interp.frame_depth(), depth);
    eval(&interp, "set top 1");
    assert!(interp.global_var("top").is_some());
}

// ── Events ────────────────────────────────────────────────────────────────────

#[test]
fn queued_scripts_run_at_the_next_checkpoint() {
    let interp = Interpreter::new();
    interp.schedule_event(Duration::ZERO, EventKind::Script("set fromEvent yes".into()));
    eval(&interp, "set x 1");
    assert_eq!(interp.get_variable("fromEvent", None).unwrap().to_string(), "yes");
    assert!(interp.events().is_empty());
}

#[test]
fn queued_callback_errors_do_not_disturb_the_foreground() {
    let interp = Interpreter::new();
    interp.schedule_event(
        Duration::ZERO,
        EventKind::Callback(Arc::new(|_: &Interpreter| -> EvalResult { Err(Flow::error("background boom")) })),
    );
    assert_eq!(eval(&interp, "set fg 1"), "1");
    assert_eq!(interp.last_return_code(), ReturnCode::Ok);
}

// ── Hooks ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    deny: Option<&'static str>,
}

impl Debugger for Recorder {
    fn is_active(&self, kind: BreakpointType) -> bool {
        kind == BreakpointType::BeforeCommand
    }

    fn breakpoint(&self, _interp: &Interpreter, context: &BreakpointContext<'_>) -> Result<(), Flow> {
        let name = context.name.unwrap_or_default().to_owned();
        if self.deny == Some(name.as_str()) {
            return Err(Flow::error(format!("debugger stopped \"{name}\"")));
        }
        self.seen.lock().unwrap().push(name);
        Ok(())
    }
}

#[test]
fn debugger_sees_commands_and_can_abort_them() {
    let interp = Interpreter::new();
    let recorder = Arc::new(Recorder { deny: Some("puts"), ..Default::default() });
    interp.set_debugger(Some(recorder.clone()));
    assert_eq!(eval(&interp, "set a 1; set b [set a]"), "1");
    assert_eq!(*recorder.seen.lock().unwrap(), vec!["set", "set", "set"]);
    assert_eq!(eval_err(&interp, "puts hi"), "debugger stopped \"puts\"");
    assert!(interp.take_output().is_empty());
}

#[derive(Default)]
struct Executed(Mutex<Vec<(String, ReturnCode)>>);

impl Observer for Executed {
    fn notify(&self, _interp: &Interpreter, notification: &Notification<'_>) {
        if let Notification::Executed { name, code } = notification {
            self.0.lock().unwrap().push(((*name).to_owned(), *code));
        }
    }
}

#[test]
fn observer_is_told_about_each_dispatch() {
    let interp = Interpreter::new();
    let observer = Arc::new(Executed::default());
    interp.set_observer(Some(observer.clone()));
    let _ = interp.evaluate_script("set a 1; error no");
    let seen = observer.0.lock().unwrap().clone();
    assert_eq!(seen, vec![("set".to_owned(), ReturnCode::Ok), ("error".to_owned(), ReturnCode::Error)]);
}

struct Panicky;

impl Observer for Panicky {
    fn notify(&self, _interp: &Interpreter, _notification: &Notification<'_>) {
        panic!("observer bug");
    }
}

#[test]
fn observer_panics_are_isolated() {
    let interp = Interpreter::new();
    interp.set_observer(Some(Arc::new(Panicky)));
    assert_eq!(eval(&interp, "set a 1"), "1");
}

#[test]
fn safe_interpreters_consult_the_policy_for_hidden_commands() {
    let interp = with_config(|c| c.safe = true);
    interp
        .registry_mut()
        .add_command("secret", |_: &Invocation<'_>, _: &[Value]| -> EvalResult { Ok(Value::from("classified")) })
        .set_hidden(true);
    assert_eq!(
        eval_err(&interp, "secret"),
        "permission denied: safe interpreter cannot use hidden command \"secret\""
    );

    let policy = RegexPolicy::new().allow(Some(PolicyKind::Command), "^secret$").unwrap();
    interp.set_policy(Some(Arc::new(policy)));
    assert_eq!(eval(&interp, "secret"), "classified");
}

#[test]
fn safe_interpreters_can_deny_procedures() {
    let interp = with_config(|c| c.safe = true);
    let policy = RegexPolicy::new().deny(Some(PolicyKind::Procedure), "^forbidden$").unwrap();
    interp.set_policy(Some(Arc::new(policy)));
    eval(&interp, "proc forbidden {} { return no }; proc allowed {} { return yes }");
    assert_eq!(eval(&interp, "allowed"), "yes");
    assert!(eval_err(&interp, "forbidden").starts_with("permission denied"));
}

// ── History, profiling, output ────────────────────────────────────────────────

#[test]
fn history_records_commands_newest_first() {
    let interp = with_config(|c| c.history_size = 2);
    eval(&interp, "set a 1; set b {two words}; set c 3");
    let history = interp.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history.get(0).map(|e| e.command.as_str()), Some("set c 3"));
    assert_eq!(history.get(1).map(|e| e.command.as_str()), Some("set b {two words}"));
}

#[test]
fn usage_counts_calls() {
    let interp = with_config(|c| c.profile = true);
    eval(&interp, "set i 0; while {$i < 5} { incr i }");
    let usage = interp.usage("incr").unwrap();
    assert_eq!(usage.calls, 5);
    assert!(interp.usage("nosuch").is_none());
}

#[test]
fn puts_output_is_buffered() {
    let interp = Interpreter::new();
    eval(&interp, "puts one; puts -nonewline two");
    assert_eq!(interp.take_output(), "one\ntwo");
    assert_eq!(interp.take_output(), "");
}

// ── Files and streams ─────────────────────────────────────────────────────────

#[test]
fn evaluate_and_substitute_files() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("setup.tcl");
    std::fs::write(&script, "set base 10\nproc add {n} { global base; expr {$base + $n} }\nadd 5\n").unwrap();
    let template = dir.path().join("page.txt");
    std::fs::write(&template, "base=$base sum=[add 1]").unwrap();

    let interp = Interpreter::new();
    assert_eq!(interp.evaluate_file(&script).unwrap().to_string(), "15");
    assert_eq!(interp.substitute_file(&template).unwrap().to_string(), "base=10 sum=11");

    let missing = dir.path().join("missing.tcl");
    let err = interp.evaluate_file(&missing).unwrap_err().to_string();
    assert!(err.starts_with("couldn't read file"));
}

#[test]
fn streams_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.tcl");
    std::fs::write(&lib, "proc twice {x} { expr {$x * 2} }").unwrap();

    let interp = Interpreter::new();
    let script = format!("source {{{}}}\ntwice 21", lib.display());
    let v = interp.evaluate_stream(std::io::Cursor::new(script), "main").unwrap();
    assert_eq!(v.to_string(), "42");
    let v = interp.substitute_stream(std::io::Cursor::new("[twice 4]!"), "tmpl").unwrap();
    assert_eq!(v.to_string(), "8!");
}

#[test]
fn safe_interpreters_check_file_reads() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("blocked.tcl");
    std::fs::write(&file, "set ran 1").unwrap();

    let interp = with_config(|c| c.safe = true);
    let policy = RegexPolicy::new().deny(Some(PolicyKind::File), "blocked").unwrap();
    interp.set_policy(Some(Arc::new(policy)));
    let err = interp.evaluate_file(&file).unwrap_err().to_string();
    assert!(err.starts_with("permission denied"), "{err}");
    assert!(interp.get_variable("ran", None).is_err());
}

// ── Re-entrancy ───────────────────────────────────────────────────────────────

#[test]
fn interpreters_move_between_threads() {
    let interp = Interpreter::new();
    eval(&interp, "proc sq {x} { expr {$x * $x} }");
    for i in 0..4_i64 {
        let shared = Arc::clone(&interp);
        let v = thread::spawn(move || shared.evaluate_expression(&format!("[sq {i}]")).unwrap().to_string())
            .join()
            .unwrap();
        assert_eq!(v, (i * i).to_string());
    }
}

// ── Checkpoints and entity states ─────────────────────────────────────────────

#[test]
fn cancel_is_observed_at_the_next_dispatch() {
    let interp = Interpreter::new();
    interp.registry_mut().add_command("cancel-here", |call: &Invocation<'_>, _: &[Value]| -> EvalResult {
        call.interp.cancel_evaluate(false, None)?;
        Ok(Value::empty())
    });
    let err = eval_err(&interp, "set one 1; cancel-here; set two 2; set three 3");
    assert_eq!(err, "eval canceled");
    assert_eq!(interp.error_code().as_deref(), Some("CANCEL EVAL"));
    assert!(interp.get_variable("one", None).is_ok());
    assert!(interp.get_variable("two", None).is_err());
    assert!(interp.get_variable("three", None).is_err());
}

#[test]
fn resets_are_idempotent() {
    let interp = Interpreter::new();
    interp.cancel_evaluate(false, None).unwrap();
    assert!(interp.gate().reset_cancel(LockMode::Block).unwrap());
    assert!(!interp.gate().reset_cancel(LockMode::Block).unwrap());
    interp.halt_evaluate(None).unwrap();
    assert!(interp.gate().reset_halt(LockMode::Block).unwrap());
    assert!(!interp.gate().reset_halt(LockMode::Block).unwrap());
}

#[test]
fn disabled_and_hidden_commands_are_distinct() {
    let interp = Interpreter::new();
    interp.evaluate_script("proc quiet {} { return q }").unwrap();
    interp.registry().set_disabled("quiet", true);
    let disabled = eval_err(&interp, "quiet");
    assert!(disabled.contains("disabled"), "{disabled}");

    interp.registry().set_disabled("quiet", false);
    interp.registry().set_hidden("quiet", true);
    let hidden = eval_err(&interp, "quiet");
    assert!(hidden.contains("hidden"), "{hidden}");
    assert_ne!(disabled, hidden);

    interp.registry().set_hidden("quiet", false);
    assert_eq!(eval(&interp, "quiet"), "q");
}

#[test]
fn nested_substitution_sets_both_variables() {
    let interp = Interpreter::new();
    eval(&interp, "set x [set y 5]");
    assert_eq!(interp.get_variable("x", None).unwrap().to_string(), "5");
    assert_eq!(interp.get_variable("y", None).unwrap().to_string(), "5");
}

#[test]
fn break_and_continue_inside_substitution_contribute_nothing() {
    let interp = Interpreter::new();
    assert_eq!(interp.substitute_string("a[break]b").unwrap().to_string(), "ab");
    assert_eq!(interp.substitute_string("a[continue]b").unwrap().to_string(), "ab");
}
