//! errorInfo / errorCode accumulation across nested evaluation.

use std::path::Path;

use talon::config::EngineConfig;
use talon::script::dispatch::Invocation;
use talon::script::{EvalResult, Interpreter, Value};

fn error_info_of(interp: &Interpreter, script: &str) -> String {
    let err = interp.evaluate_script(script).expect_err("script should fail");
    let from_error = err.as_error().and_then(|e| e.error_info.clone());
    let global = interp.error_info();
    assert_eq!(from_error, global, "error snapshot and errorInfo disagree");
    global.unwrap_or_default()
}

/// Assert that `parts` occur in `text` in order.
fn assert_in_order(text: &str, parts: &[&str]) {
    let mut rest = text;
    for part in parts {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => panic!("missing {part:?} (in order) in:\n{text}"),
        }
    }
}

#[test]
fn single_failing_command() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "set a 1\nerror boom");
    assert_eq!(info, "boom\n    while executing\n\"error boom\"");
    assert_eq!(interp.error_code().as_deref(), Some("NONE"));
}

#[test]
fn trailing_blanks_are_not_quoted() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "error boom \t");
    assert_eq!(info, "boom\n    while executing\n\"error boom\"");
}

#[test]
fn nested_command_substitution() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "set x [nosuch arg]");
    assert_eq!(
        info,
        "invalid command name \"nosuch\"\n    while executing\n\"nosuch arg\"\n    invoked from within\n\"set x [nosuch arg]\""
    );
    assert_eq!(interp.error_code().as_deref(), Some("TCL LOOKUP COMMAND nosuch"));
}

#[test]
fn procedure_frames_carry_line_numbers() {
    let interp = Interpreter::new();
    interp.evaluate_script("proc inner {} {\n    set local 1\n    error deep\n}").unwrap();
    interp.evaluate_script("proc outer {} { inner }").unwrap();
    let info = error_info_of(&interp, "outer");
    assert_eq!(
        info,
        "deep\n    while executing\n\"error deep\"\n    (procedure \"inner\" line 3)\n    invoked from within\n\"inner\"\n    (procedure \"outer\" line 1)\n    invoked from within\n\"outer\""
    );
}

#[test]
fn eval_and_while_bodies_are_annotated() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "eval {set a 1\nerror inside}");
    assert_in_order(&info, &["inside", "while executing", "\"error inside\"", "(\"eval\" body line 2)", "invoked from within"]);

    let info = error_info_of(&interp, "set i 0\nwhile {$i < 3} {\n    incr i\n    if {$i == 2} { error at-two }\n}");
    assert_in_order(
        &info,
        &["at-two", "while executing", "\"error at-two\"", "invoked from within", "(\"while\" body line 3)"],
    );
}

#[test]
fn explicit_error_info_is_kept_verbatim() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "error boom {custom trace} {APP FAIL}");
    assert_eq!(info, "custom trace");
    assert_eq!(interp.error_code().as_deref(), Some("APP FAIL"));

    interp.evaluate_script("proc rethrow {} { error again {saved trace} }").unwrap();
    let info = error_info_of(&interp, "rethrow");
    assert_in_order(&info, &["saved trace", "(procedure \"rethrow\" line 1)", "invoked from within", "\"rethrow\""]);
}

#[test]
fn catch_resets_the_trace() {
    let interp = Interpreter::new();
    interp.evaluate_script("catch {error first}").unwrap();
    assert!(interp.error_info().unwrap_or_default().starts_with("first"));
    let info = error_info_of(&interp, "error second");
    assert_eq!(info, "second\n    while executing\n\"error second\"");
}

#[test]
fn error_codes_from_return_and_faults() {
    let interp = Interpreter::new();
    interp.evaluate_script("proc fail {} { return -code error -errorcode {POSIX EIO} io }").unwrap();
    let _ = error_info_of(&interp, "fail");
    assert_eq!(interp.error_code().as_deref(), Some("POSIX EIO"));

    interp.registry_mut().add_command("explode", |_: &Invocation<'_>, _: &[Value]| -> EvalResult {
        panic!("kaboom");
    });
    let info = error_info_of(&interp, "explode");
    assert!(info.starts_with("caught str: kaboom"), "{info}");
    assert_eq!(interp.error_code().as_deref(), Some("EXCEPTION str explode"));
    assert!(interp.last_fault().is_some());
}

#[test]
fn long_commands_are_shortened_in_the_trace() {
    let interp = Interpreter::new();
    let long = "x".repeat(300);
    let info = error_info_of(&interp, &format!("error {long}"));
    let quoted = info.lines().nth(2).unwrap_or_default();
    assert!(quoted.ends_with("...\""), "{quoted}");
    assert!(quoted.len() < 160);
}

#[test]
fn deep_recursion_truncates_the_trace() {
    let mut config = EngineConfig::default();
    config.max_levels = 60;
    let interp = Interpreter::with_config(config);
    interp.evaluate_script("proc down {n} { down [incr n] }").unwrap();
    let info = error_info_of(&interp, "down 0");
    assert!(info.starts_with("stack overflow"));
    assert!(info.ends_with("... truncated ..."), "{info}");
    let frames = info.matches("invoked from within").count();
    assert!(frames < 30, "{frames} frames kept");
}

fn write(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path.display().to_string()
}

#[test]
fn nested_source_files() {
    let dir = tempfile::tempdir().unwrap();
    let c = write(dir.path(), "c.tcl", "set y 2\n\nerror nested\n");
    let b = write(dir.path(), "b.tcl", &format!("set x 1\nsource {{{c}}}\n"));
    let a = write(dir.path(), "a.tcl", &format!("source {{{b}}}\n"));

    let interp = Interpreter::new();
    let err = interp.evaluate_file(Path::new(&a)).unwrap_err();
    assert_eq!(err.to_string(), "nested");
    let info = interp.error_info().unwrap_or_default();
    assert_in_order(
        &info,
        &[
            "nested\n    while executing\n\"error nested\"",
            &format!("(file \"{c}\" line 3)"),
            "invoked from within",
            &format!("(file \"{b}\" line 2)"),
            "invoked from within",
            &format!("(file \"{a}\" line 1)"),
        ],
    );
    // Both files ran up to the failure.
    assert_eq!(interp.get_variable("x", None).unwrap().to_string(), "1");
    assert_eq!(interp.get_variable("y", None).unwrap().to_string(), "2");
}

#[test]
fn stream_errors_name_the_stream() {
    let interp = Interpreter::new();
    let err = interp.evaluate_stream(std::io::Cursor::new("set a 1\nset a\nset b"), "config").unwrap_err();
    assert_eq!(err.to_string(), "can't read \"b\": no such variable");
    let info = interp.error_info().unwrap_or_default();
    assert!(info.ends_with("(stream \"config\" line 3)"), "{info}");
}

#[test]
fn parse_errors_are_traced() {
    let interp = Interpreter::new();
    let info = error_info_of(&interp, "set ok 1\nset bad {unclosed");
    assert_in_order(&info, &["missing close-brace", "while executing", "\"set bad {"]);
}
