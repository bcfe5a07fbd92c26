//! Core commands and math functions.
//!
//! Each command receives the evaluated words of its invocation (`args[0]` is
//! the name it was invoked by) and returns an [`EvalResult`].  [`register`]
//! installs them in a fresh registry.

use std::path::Path;

use super::cancel::LockMode;
use super::context::ExprFlags;
use super::dispatch::{Invocation, Registry};
use super::eval;
use super::expr;
use super::procedure::Procedure;
use super::result::{EvalResult, Flow, ReturnCode, ScriptError};
use super::subst;
use super::trace::{self, ERROR_INFO};
use super::value::{merge_list, split_list, Number, Value};

/// Install the core commands and math functions.
pub fn register(registry: &mut Registry) {
    registry.add_command("set", cmd_set);
    registry.add_command("unset", cmd_unset);
    registry.add_command("incr", cmd_incr);
    registry.add_command("append", cmd_append);
    registry.add_command("global", cmd_global);
    registry.add_command("proc", cmd_proc);
    registry.add_command("return", cmd_return);
    registry.add_command("break", cmd_break);
    registry.add_command("continue", cmd_continue);
    registry.add_command("error", cmd_error);
    registry.add_command("eval", cmd_eval);
    registry.add_command("catch", cmd_catch);
    registry.add_command("subst", cmd_subst);
    registry.add_command("expr", cmd_expr);
    registry.add_command("if", cmd_if);
    registry.add_command("while", cmd_while);
    registry.add_command("source", cmd_source);
    registry.add_command("puts", cmd_puts);
    registry.add_command("list", cmd_list);
    registry.add_command("llength", cmd_llength);
    registry.add_command("rename", cmd_rename);
    registry.add_command("exit", cmd_exit);

    for name in ["abs", "int", "double", "round", "min", "max", "sqrt", "pow"] {
        registry.add_function(name, math_function);
    }
}

// ── Argument accessors ────────────────────────────────────────────────────────

fn wrong_args(usage: &str) -> Flow {
    Flow::error_with_code(format!("wrong # args: should be \"{usage}\""), "TCL WRONGARGS")
}

fn get_int(v: &Value) -> Result<i64, Flow> {
    v.to_int().ok_or_else(|| Flow::error(format!("expected integer but got \"{v}\"")))
}

fn get_number(v: &Value) -> Result<Number, Flow> {
    v.to_number().ok_or_else(|| Flow::error(format!("expected floating-point number but got \"{v}\"")))
}

/// Split `a(b)` into the array name and index.
pub fn split_var_name(name: &str) -> (&str, Option<&str>) {
    match name.find('(') {
        Some(open) if open > 0 && name.ends_with(')') => (&name[..open], Some(&name[open + 1..name.len() - 1])),
        _ => (name, None),
    }
}

/// Join words the way `concat` does: trimmed, space separated, empty words
/// dropped.
fn concat(args: &[Value]) -> String {
    let words: Vec<String> = args
        .iter()
        .map(|a| a.to_string().trim().to_owned())
        .filter(|w| !w.is_empty())
        .collect();
    words.join(" ")
}

fn condition(call: &Invocation<'_>, source: &str) -> Result<bool, Flow> {
    let ctx = call.ctx.with_expr(ExprFlags { boolean_result: true, ..call.ctx.expr() });
    let v = expr::evaluate(call.interp, source, &ctx)?;
    v.to_bool().ok_or_else(|| Flow::error(format!("expected boolean value but got \"{v}\"")))
}

// ── Variables ─────────────────────────────────────────────────────────────────

fn cmd_set(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if !(2..=3).contains(&args.len()) {
        return Err(wrong_args("set varName ?newValue?"));
    }
    let text = args[1].to_string();
    let (name, index) = split_var_name(&text);
    match args.get(2) {
        Some(v) => Ok(call.interp.set_variable(name, index, v.clone())?),
        None => Ok(call.interp.get_variable(name, index)?),
    }
}

fn cmd_unset(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let mut complain = true;
    let mut rest = &args[1..];
    while let Some(flag) = rest.first().and_then(Value::as_str_ref) {
        match flag {
            "-nocomplain" => complain = false,
            "--" => {
                rest = &rest[1..];
                break;
            }
            _ => break,
        }
        rest = &rest[1..];
    }
    for arg in rest {
        let text = arg.to_string();
        let (name, index) = split_var_name(&text);
        if let Err(e) = call.interp.unset_variable(name, index) {
            if complain {
                return Err(e.into());
            }
        }
    }
    Ok(Value::empty())
}

fn cmd_incr(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if !(2..=3).contains(&args.len()) {
        return Err(wrong_args("incr varName ?increment?"));
    }
    let text = args[1].to_string();
    let (name, index) = split_var_name(&text);
    let amount = match args.get(2) {
        Some(v) => get_int(v)?,
        None => 1,
    };
    let current = match call.interp.get_variable(name, index) {
        Ok(v) => get_int(&v)?,
        Err(_) => 0,
    };
    Ok(call.interp.set_variable(name, index, Value::Int(current.wrapping_add(amount)))?)
}

fn cmd_append(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if args.len() < 2 {
        return Err(wrong_args("append varName ?value ...?"));
    }
    let text = args[1].to_string();
    let (name, index) = split_var_name(&text);
    let mut current = call.interp.get_variable(name, index).map(Value::into_string).unwrap_or_default();
    for piece in &args[2..] {
        current.push_str(&piece.to_string());
    }
    Ok(call.interp.set_variable(name, index, Value::from(current))?)
}

fn cmd_global(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let mut frames = call.interp.frames();
    if frames.in_procedure() {
        for name in &args[1..] {
            frames.link_global(&name.to_string());
        }
    }
    Ok(Value::empty())
}

// ── Procedures and control flow ───────────────────────────────────────────────

fn cmd_proc(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let [_, name, params, body] = args else {
        return Err(wrong_args("proc name args body"));
    };
    let procedure = Procedure::new(&name.to_string(), &params.to_string(), &body.to_string()).map_err(Flow::error)?;
    call.interp.registry_mut().add_procedure(procedure);
    Ok(Value::empty())
}

fn cmd_return(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let mut code = ReturnCode::Return;
    let mut error_code = None;
    let mut i = 1;
    while i + 1 < args.len() {
        match args[i].as_str_ref() {
            Some("-code") => {
                let word = args[i + 1].to_string();
                code = ReturnCode::parse(&word).ok_or_else(|| {
                    Flow::error(format!(
                        "bad completion code \"{word}\": must be ok, error, return, break, continue, or an integer"
                    ))
                })?;
            }
            Some("-errorcode") => error_code = Some(args[i + 1].to_string()),
            _ => break,
        }
        i += 2;
    }
    if args.len() > i + 1 {
        return Err(wrong_args("return ?-code code? ?-errorcode code? ?value?"));
    }
    let value = args.get(i).cloned().unwrap_or_default();
    match code {
        ReturnCode::Ok | ReturnCode::Return => Err(Flow::Return(value)),
        ReturnCode::Error => {
            let mut e = ScriptError::new(value);
            if let Some(c) = error_code {
                trace::set_error_code(call.interp, &c);
                e.error_code = Some(c);
            }
            Err(e.into())
        }
        other => Flow::from_code(other, value),
    }
}

fn cmd_break(_call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if args.len() != 1 {
        return Err(wrong_args("break"));
    }
    Err(Flow::Break)
}

fn cmd_continue(_call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if args.len() != 1 {
        return Err(wrong_args("continue"));
    }
    Err(Flow::Continue)
}

/// `error message ?info? ?code?`.  A non-empty `info` seeds `errorInfo`, and
/// the failing `error` command itself is then not added to the trace.
fn cmd_error(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if !(2..=4).contains(&args.len()) {
        return Err(wrong_args("error message ?errorInfo? ?errorCode?"));
    }
    let mut e = ScriptError::new(args[1].clone());
    if let Some(info) = args.get(2).filter(|v| !v.to_string().is_empty()) {
        call.interp.set_global_var(ERROR_INFO, info.clone());
        let mut errors = call.interp.errors();
        errors.in_progress = true;
        errors.already_logged = true;
    }
    if let Some(code) = args.get(3) {
        let code = code.to_string();
        trace::set_error_code(call.interp, &code);
        e.error_code = Some(code);
    }
    Err(e.into())
}

fn cmd_eval(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if args.len() < 2 {
        return Err(wrong_args("eval arg ?arg ...?"));
    }
    let script = if args.len() == 2 { args[1].to_string() } else { concat(&args[1..]) };
    match eval::evaluate_text(call.interp, &script, call.ctx) {
        Err(Flow::Error(e)) => {
            if e.error_line > 0 {
                let info = format!("\n    (\"eval\" body line {})", e.error_line);
                trace::add_error_information(call.interp, &e, &info);
            }
            Err(Flow::Error(e))
        }
        other => other,
    }
}

/// `catch script ?resultVar? ?optionsVar?`.  Unwinding cancels, halts,
/// deletion and a pending abort pass through.
fn cmd_catch(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if !(2..=4).contains(&args.len()) {
        return Err(wrong_args("catch script ?resultVarName? ?optionVarName?"));
    }
    let interp = call.interp;
    let result = eval::evaluate_text(interp, &args[1].to_string(), call.ctx);

    if let Err(Flow::Error(_)) = &result {
        if interp.abort_requested() {
            return result;
        }
        let canceled = {
            let state = interp.gate().lock(LockMode::Block)?;
            if state.unwinding() || state.halted() || state.deleted() {
                return result;
            }
            state.canceled()
        };
        if canceled && interp.config().catch_resets_cancel {
            interp.gate().reset_cancel(LockMode::Block)?;
        }
    }

    let code = ReturnCode::of(&result);
    let value = match &result {
        Ok(v) => v.clone(),
        Err(flow) => flow.value(),
    };
    if let Some(var) = args.get(2) {
        let text = var.to_string();
        let (name, index) = split_var_name(&text);
        interp.set_variable(name, index, value)?;
    }
    if let Some(var) = args.get(3) {
        let mut options = vec!["-code".to_owned(), code.as_int().to_string(), "-level".to_owned(), "0".to_owned()];
        if code == ReturnCode::Error {
            options.push("-errorcode".to_owned());
            options.push(interp.error_code().unwrap_or_else(|| "NONE".to_owned()));
            options.push("-errorinfo".to_owned());
            options.push(interp.error_info().unwrap_or_default());
        }
        let text = var.to_string();
        let (name, index) = split_var_name(&text);
        interp.set_variable(name, index, Value::from(merge_list(&options)))?;
    }
    if code == ReturnCode::Error {
        interp.errors().reset_unwind();
    }
    Ok(Value::Int(code.as_int()))
}

fn cmd_subst(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let usage = "subst ?-nobackslashes? ?-nocommands? ?-novariables? string";
    let Some((text, flags)) = args[1..].split_last() else {
        return Err(wrong_args(usage));
    };
    let mut subst_flags = call.ctx.subst();
    for flag in flags {
        match flag.as_str_ref() {
            Some("-nobackslashes") => subst_flags.no_backslashes = true,
            Some("-nocommands") => subst_flags.no_commands = true,
            Some("-novariables") => subst_flags.no_variables = true,
            _ => {
                return Err(Flow::error(format!(
                    "bad switch \"{flag}\": must be -nobackslashes, -nocommands, or -novariables"
                )))
            }
        }
    }
    let ctx = call.ctx.with_subst(subst_flags);
    subst::substitute(call.interp, &text.to_string(), &ctx)
}

fn cmd_expr(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    if args.len() < 2 {
        return Err(wrong_args("expr arg ?arg ...?"));
    }
    let source = if args.len() == 2 { args[1].to_string() } else { concat(&args[1..]) };
    expr::evaluate(call.interp, &source, call.ctx)
}

/// `if expr ?then? body ?elseif expr ?then? body ...? ?else? ?body?`
fn cmd_if(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let usage = "if expr1 ?then? body1 elseif expr2 ?then? body2 elseif ... ?else? ?bodyN?";
    let mut i = 1;
    loop {
        let Some(cond) = args.get(i) else {
            return Err(wrong_args(usage));
        };
        i += 1;
        if args.get(i).and_then(Value::as_str_ref) == Some("then") {
            i += 1;
        }
        let Some(body) = args.get(i) else {
            return Err(wrong_args(usage));
        };
        i += 1;
        if condition(call, &cond.to_string())? {
            return eval::evaluate_text(call.interp, &body.to_string(), call.ctx);
        }
        match args.get(i).and_then(Value::as_str_ref) {
            None => return Ok(Value::empty()),
            Some("elseif") => i += 1,
            Some("else") => {
                return match &args[i + 1..] {
                    [body] => eval::evaluate_text(call.interp, &body.to_string(), call.ctx),
                    _ => Err(wrong_args(usage)),
                }
            }
            Some(_) if i + 1 == args.len() => {
                return eval::evaluate_text(call.interp, &args[i].to_string(), call.ctx)
            }
            Some(_) => return Err(wrong_args(usage)),
        }
    }
}

fn cmd_while(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let [_, test, body] = args else {
        return Err(wrong_args("while test command"));
    };
    let (test, body) = (test.to_string(), body.to_string());
    while condition(call, &test)? {
        match eval::evaluate_text(call.interp, &body, call.ctx) {
            Ok(_) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(Flow::Error(e)) => {
                if e.error_line > 0 {
                    let info = format!("\n    (\"while\" body line {})", e.error_line);
                    trace::add_error_information(call.interp, &e, &info);
                }
                return Err(Flow::Error(e));
            }
            Err(flow) => return Err(flow),
        }
    }
    Ok(Value::empty())
}

fn cmd_source(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let [_, file] = args else {
        return Err(wrong_args("source fileName"));
    };
    call.interp.source_file(Path::new(&file.to_string()), call.ctx)
}

// ── Output and lists ──────────────────────────────────────────────────────────

fn cmd_puts(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let mut rest = &args[1..];
    let newline = if rest.first().and_then(Value::as_str_ref) == Some("-nonewline") {
        rest = &rest[1..];
        false
    } else {
        true
    };
    let text = match rest {
        [text] => text,
        [channel, text] => match channel.as_str_ref() {
            Some("stdout" | "stderr") => text,
            _ => return Err(Flow::error(format!("can not find channel named \"{channel}\""))),
        },
        _ => return Err(wrong_args("puts ?-nonewline? ?channelId? string")),
    };
    let mut out = text.to_string();
    if newline {
        out.push('\n');
    }
    call.interp.write_output(&out);
    Ok(Value::empty())
}

fn cmd_list(_call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let words: Vec<String> = args[1..].iter().map(Value::to_string).collect();
    Ok(Value::from(merge_list(&words)))
}

fn cmd_llength(_call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let [_, list] = args else {
        return Err(wrong_args("llength list"));
    };
    let items = split_list(&list.to_string()).map_err(Flow::error)?;
    Ok(Value::Int(items.len() as i64))
}

fn cmd_rename(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let [_, old, new] = args else {
        return Err(wrong_args("rename oldName newName"));
    };
    call.interp.registry_mut().rename(&old.to_string(), &new.to_string()).map_err(Flow::error)?;
    Ok(Value::empty())
}

fn cmd_exit(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let code = match args {
        [_] => 0,
        [_, code] => get_int(code)?,
        _ => return Err(wrong_args("exit ?returnCode?")),
    };
    call.interp.request_exit(i32::try_from(code).unwrap_or(i32::MAX));
    Ok(Value::empty())
}

// ── Math functions ────────────────────────────────────────────────────────────

fn math_function(call: &Invocation<'_>, args: &[Value]) -> EvalResult {
    let name = call.name;
    let operands = &args[1..];
    let arity = |min: usize, max: usize| -> Result<(), Flow> {
        if operands.len() < min {
            Err(Flow::error(format!("too few arguments for math function \"{name}\"")))
        } else if operands.len() > max {
            Err(Flow::error(format!("too many arguments for math function \"{name}\"")))
        } else {
            Ok(())
        }
    };

    match name {
        "abs" => {
            arity(1, 1)?;
            Ok(match get_number(&operands[0])? {
                Number::Int(n) => Value::Int(n.wrapping_abs()),
                Number::Float(x) => Value::Float(x.abs()),
            })
        }
        "int" => {
            arity(1, 1)?;
            Ok(match get_number(&operands[0])? {
                Number::Int(n) => Value::Int(n),
                Number::Float(x) => Value::Int(x.trunc() as i64),
            })
        }
        "double" => {
            arity(1, 1)?;
            Ok(Value::Float(get_number(&operands[0])?.as_f64()))
        }
        "round" => {
            arity(1, 1)?;
            Ok(match get_number(&operands[0])? {
                Number::Int(n) => Value::Int(n),
                Number::Float(x) => Value::Int(x.round() as i64),
            })
        }
        "min" | "max" => {
            arity(1, usize::MAX)?;
            let mut best = get_number(&operands[0])?;
            for v in &operands[1..] {
                let n = get_number(v)?;
                let better = if name == "min" { n.as_f64() < best.as_f64() } else { n.as_f64() > best.as_f64() };
                if better {
                    best = n;
                }
            }
            Ok(Value::from(best))
        }
        "sqrt" => {
            arity(1, 1)?;
            let x = get_number(&operands[0])?.as_f64();
            if x < 0.0 {
                return Err(Flow::error_with_code(
                    "domain error: argument not in valid range",
                    "ARITH DOMAIN {domain error: argument not in valid range}",
                ));
            }
            Ok(Value::Float(x.sqrt()))
        }
        "pow" => {
            arity(2, 2)?;
            let (x, y) = (get_number(&operands[0])?.as_f64(), get_number(&operands[1])?.as_f64());
            Ok(Value::Float(x.powf(y)))
        }
        _ => Err(Flow::error(format!("unknown math function \"{name}\""))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::interp::Interpreter;

    fn eval(interp: &Interpreter, script: &str) -> String {
        interp.evaluate_script(script).unwrap().to_string()
    }

    #[test]
    fn split_var_name_forms() {
        assert_eq!(split_var_name("a"), ("a", None));
        assert_eq!(split_var_name("a(b c)"), ("a", Some("b c")));
        assert_eq!(split_var_name("(x)"), ("(x)", None));
    }

    #[test]
    fn set_incr_append() {
        let interp = Interpreter::new();
        assert_eq!(eval(&interp, "set a 1; incr a 4"), "5");
        assert_eq!(eval(&interp, "incr fresh"), "1");
        assert_eq!(eval(&interp, "append s x y; append s z"), "xyz");
        assert_eq!(eval(&interp, "set arr(k) v; set arr(k)"), "v");
        assert!(interp.evaluate_script("incr s").unwrap_err().to_string().contains("expected integer"));
    }

    #[test]
    fn unset_nocomplain() {
        let interp = Interpreter::new();
        assert!(interp.evaluate_script("unset nothing").is_err());
        assert_eq!(eval(&interp, "unset -nocomplain nothing"), "");
    }

    #[test]
    fn procedures_and_globals() {
        let interp = Interpreter::new();
        eval(&interp, "set total 10; proc add {n} { global total; incr total $n }");
        assert_eq!(eval(&interp, "add 5"), "15");
        eval(&interp, "proc greet {{who world}} { return \"hi $who\" }");
        assert_eq!(eval(&interp, "greet"), "hi world");
        assert_eq!(eval(&interp, "greet you"), "hi you");
        let err = interp.evaluate_script("greet a b").unwrap_err();
        assert_eq!(err.to_string(), "wrong # args: should be \"greet ?who?\"");
    }

    #[test]
    fn control_flow() {
        let interp = Interpreter::new();
        let script = "set i 0; set s 0
            while {$i < 10} {
                incr i
                if {$i % 2 == 0} { continue } elseif {$i > 7} { break }
                incr s $i
            }
            set s";
        assert_eq!(eval(&interp, script), "16");
        assert_eq!(eval(&interp, "if 0 {set x a} else {set x b}"), "b");
        assert_eq!(eval(&interp, "if 0 then {set x a}"), "");
    }

    #[test]
    fn catch_reports_codes() {
        let interp = Interpreter::new();
        assert_eq!(eval(&interp, "catch {error boom} msg"), "1");
        assert_eq!(eval(&interp, "set msg"), "boom");
        assert_eq!(eval(&interp, "catch {return -code break}"), "3");
        assert_eq!(eval(&interp, "catch {set ok 1} r"), "0");
        assert_eq!(eval(&interp, "catch {error x {} {MY CODE}} m opts; set opts").contains("MY CODE"), true);
    }

    #[test]
    fn catch_does_not_stop_an_unwinding_cancel() {
        let interp = Interpreter::new();
        interp.registry_mut().add_command("cancelme", |call: &Invocation<'_>, _: &[Value]| -> EvalResult {
            call.interp.cancel_evaluate(true, None)?;
            Ok(Value::empty())
        });
        let err = interp.evaluate_script("catch {cancelme; set x 1}; set y 2").unwrap_err();
        assert_eq!(err.to_string(), "eval unwound");
        assert!(interp.get_variable("y", None).is_err());
    }

    #[test]
    fn catch_clears_a_plain_cancel() {
        let interp = Interpreter::new();
        interp.registry_mut().add_command("cancelme", |call: &Invocation<'_>, _: &[Value]| -> EvalResult {
            call.interp.cancel_evaluate(false, None)?;
            Ok(Value::empty())
        });
        assert_eq!(eval(&interp, "catch {cancelme; set x 1} m; set m"), "eval canceled");
        assert_eq!(eval(&interp, "set after 1"), "1");
    }

    #[test]
    fn eval_subst_expr() {
        let interp = Interpreter::new();
        assert_eq!(eval(&interp, "eval set q 3"), "3");
        assert_eq!(eval(&interp, "subst {q=$q [set q]}"), "q=3 3");
        assert_eq!(eval(&interp, "subst -nocommands {[set q]}"), "[set q]");
        assert_eq!(eval(&interp, "expr {$q * 2 + max(1, 4)}"), "10");
        assert_eq!(eval(&interp, "expr {sqrt(16)}"), "4.0");
        assert_eq!(eval(&interp, "expr {round(2.5) + int(3.9) + abs(-2)}"), "8");
    }

    #[test]
    fn lists_and_puts() {
        let interp = Interpreter::new();
        assert_eq!(eval(&interp, "list a {b c} d"), "a {b c} d");
        assert_eq!(eval(&interp, "llength [list a {b c} d]"), "3");
        eval(&interp, "puts hello; puts -nonewline stdout world");
        assert_eq!(interp.take_output(), "hello\nworld");
        assert!(interp.evaluate_script("puts nowhere x").is_err());
    }

    #[test]
    fn return_codes() {
        let interp = Interpreter::new();
        eval(&interp, "proc f {} { return -code error -errorcode {POSIX ENOENT} nope }");
        let err = interp.evaluate_script("f").unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(interp.error_code().as_deref(), Some("POSIX ENOENT"));
        assert!(interp.evaluate_script("return -code bogus").unwrap_err().to_string().starts_with("bad completion code"));
    }

    #[test]
    fn rename_and_delete() {
        let interp = Interpreter::new();
        eval(&interp, "proc p {} { return p }; rename p q");
        assert_eq!(eval(&interp, "q"), "p");
        eval(&interp, "rename q {}");
        assert!(interp.evaluate_script("q").is_err());
    }
}
