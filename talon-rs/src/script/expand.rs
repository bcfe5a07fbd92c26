//! Word substitution.
//!
//! Turns the token tree produced by the parser into values: text is copied,
//! backslash sequences decoded, `[...]` evaluated as a nested script and
//! `$name` / `$name(index)` read from the current call frame.  Pieces of a
//! word are concatenated with the result-size limit checked as the value
//! grows.

use tracing::trace;

use crate::hook::{self, BreakpointContext, BreakpointType};

use super::context::{ChildScope, EvalContext};
use super::eval;
use super::events;
use super::interp::Interpreter;
use super::result::{EvalResult, Fault, FaultKind, Flow, ScriptError, OUT_OF_MEMORY};
use super::token::{ParseState, TokenKind};
use super::value::Value;

/// Number of top-level subtrees in `[from, to)`.
pub fn count_top_level(state: &ParseState, from: usize, to: usize) -> usize {
    let mut count = 0;
    let mut i = from;
    while i < to.min(state.tokens.len()) {
        count += 1;
        i = state.subtree_end(i);
    }
    count
}

/// Substitute `count` top-level tokens starting at `start` and concatenate
/// the results.
pub fn evaluate_tokens(
    interp: &Interpreter,
    state: &ParseState,
    start: usize,
    count: usize,
    ctx: &EvalContext,
) -> EvalResult {
    if count == 1 {
        let value = evaluate_piece(interp, state, start, ctx)?;
        check_result_size(interp, value.byte_len())?;
        return Ok(value);
    }
    let mut out = String::new();
    let mut index = start;
    for _ in 0..count {
        if index >= state.tokens.len() {
            break;
        }
        let piece = evaluate_piece(interp, state, index, ctx)?;
        append(&mut out, &piece)?;
        check_result_size(interp, out.len())?;
        index = state.subtree_end(index);
    }
    Ok(Value::from(out))
}

/// Substitute the word container at `index`.
pub fn evaluate_word(interp: &Interpreter, state: &ParseState, index: usize, ctx: &EvalContext) -> EvalResult {
    let token = &state.tokens[index];
    if token.kind == TokenKind::SimpleWord {
        if ctx.uses_cache() {
            if let Some(v) = token.literal() {
                return Ok(v.clone());
            }
        }
        let text = state.tokens.get(index + 1).map_or("", |t| state.token_text(t));
        let value = Value::from(text);
        if ctx.uses_cache() {
            token.cache_literal(&value);
        }
        return Ok(value);
    }
    let end = state.subtree_end(index);
    let count = count_top_level(state, index + 1, end);
    evaluate_tokens(interp, state, index + 1, count, ctx)
}

/// Substitute every word of the command parsed into `state`.
pub fn build_arguments(interp: &Interpreter, state: &ParseState, ctx: &EvalContext) -> Result<Vec<Value>, Flow> {
    let mut args = Vec::with_capacity(state.command_words);
    let mut index = 0;
    while index < state.tokens.len() {
        args.push(evaluate_word(interp, state, index, ctx)?);
        index = state.subtree_end(index);
    }
    Ok(args)
}

/// Fail once a substitution result grows past the configured limit.
pub fn check_result_size(interp: &Interpreter, len: usize) -> Result<(), Flow> {
    match interp.config().max_result_size {
        Some(max) if len > max => Err(Flow::error(format!(
            "result too large: {len} bytes exceeds the limit of {max}"
        ))),
        _ => Ok(()),
    }
}

fn out_of_memory() -> Flow {
    Flow::from(ScriptError::new(OUT_OF_MEMORY).with_fault(Fault::new(FaultKind::OutOfMemory, OUT_OF_MEMORY)))
}

fn append(out: &mut String, piece: &Value) -> Result<(), Flow> {
    let owned;
    let text = match piece.as_str_ref() {
        Some(s) => s,
        None => {
            owned = piece.to_string();
            owned.as_str()
        }
    };
    out.try_reserve(text.len()).map_err(|_| out_of_memory())?;
    out.push_str(text);
    Ok(())
}

fn evaluate_piece(interp: &Interpreter, state: &ParseState, index: usize, ctx: &EvalContext) -> EvalResult {
    let token = &state.tokens[index];
    let text = state.token_text(token);
    let breakpoints = ctx.hits_breakpoints() && interp.has_debugger();
    let stop = |kind: BreakpointType| -> Result<(), Flow> {
        if breakpoints {
            hook::breakpoint(interp, &BreakpointContext::new(kind).with_text(text))?;
        }
        Ok(())
    };

    match token.kind {
        TokenKind::Word | TokenKind::SimpleWord => evaluate_word(interp, state, index, ctx),
        TokenKind::Text => {
            stop(BreakpointType::Text)?;
            Ok(Value::from(text))
        }
        TokenKind::Backslash => {
            stop(BreakpointType::Backslash)?;
            let (decoded, _) = interp.parser().decode_backslash(text);
            Ok(Value::from(decoded))
        }
        TokenKind::Command => {
            events::check_events(interp, ctx)?;
            stop(BreakpointType::Command)?;
            let bracket = text.len() >= 2 && text.ends_with(']');
            let child = ctx.child_for(ChildScope::Nested).bracket_terminated(bracket);
            let mut nested = state.fork();
            trace!(command = text, "command substitution");
            eval::evaluate_range(interp, &mut nested, token.start + 1, token.len.saturating_sub(1), &child)
        }
        TokenKind::Variable | TokenKind::VariableNameOnly => {
            events::check_events(interp, ctx)?;
            stop(BreakpointType::Variable)?;
            let Some(name_token) = state.tokens.get(index + 1).filter(|_| token.components > 0) else {
                return Err(Flow::error(format!("malformed variable reference \"{text}\"")));
            };
            let name = state.token_text(name_token);
            let has_index = state.text().as_bytes().get(name_token.end()) == Some(&b'(')
                && !text.starts_with("${");
            let index_value = if has_index {
                let end = state.subtree_end(index);
                let count = count_top_level(state, index + 2, end);
                Some(if count == 0 {
                    String::new()
                } else {
                    evaluate_tokens(interp, state, index + 2, count, ctx)?.into_string()
                })
            } else {
                None
            };
            if token.kind == TokenKind::VariableNameOnly {
                return Ok(Value::from(match index_value {
                    Some(i) => format!("{name}({i})"),
                    None => name.to_owned(),
                }));
            }
            Ok(interp.get_variable(name, index_value.as_deref())?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::{Parser, TclParser};

    fn tokens_of(src: &str) -> ParseState {
        let mut ps = ParseState::new(src);
        TclParser.parse_command(&mut ps, 0, src.len(), false).unwrap();
        ps
    }

    #[test]
    fn top_level_counts_skip_subtrees() {
        let ps = tokens_of("set a x$b(1)y");
        let word = ps.subtree_end(ps.subtree_end(0));
        let end = ps.subtree_end(word);
        assert_eq!(count_top_level(&ps, word + 1, end), 3);
        assert_eq!(count_top_level(&ps, 0, ps.tokens.len()), 3);
    }

    #[test]
    fn words_substitute_variables_and_backslashes() {
        let interp = Interpreter::new();
        interp.set_variable("who", None, Value::from("world")).unwrap();
        interp.set_variable("arr", Some("k"), Value::from("v")).unwrap();
        let ps = tokens_of("puts hello\\t$who $arr(k) ${who}!");
        let args = build_arguments(&interp, &ps, &EvalContext::new()).unwrap();
        let args: Vec<String> = args.into_iter().map(Value::into_string).collect();
        assert_eq!(args, vec!["puts", "hello\tworld", "v", "world!"]);
    }

    #[test]
    fn missing_variables_fail_with_read_error() {
        let interp = Interpreter::new();
        let ps = tokens_of("puts $nope");
        let err = build_arguments(&interp, &ps, &EvalContext::new()).unwrap_err();
        assert_eq!(err.to_string(), "can't read \"nope\": no such variable");
    }

    #[test]
    fn variable_token_without_a_name_is_a_script_error() {
        let interp = Interpreter::new();
        let mut ps = ParseState::new("$x");
        ps.push_token(TokenKind::Variable, 0, 2, 0);
        let err = evaluate_tokens(&interp, &ps, 0, 1, &EvalContext::new()).unwrap_err();
        assert_eq!(err.to_string(), "malformed variable reference \"$x\"");
        assert!(err.as_error().is_some_and(|e| e.fault.is_none()));
    }

    #[test]
    fn simple_words_cache_their_literal() {
        let interp = Interpreter::new();
        let ps = tokens_of("set a b");
        evaluate_word(&interp, &ps, 0, &EvalContext::new()).unwrap();
        assert_eq!(ps.tokens[0].literal(), Some(&Value::from("set")));
        let uncached = tokens_of("set a b");
        evaluate_word(&interp, &uncached, 0, &EvalContext::new().no_cache(true)).unwrap();
        assert!(uncached.tokens[0].literal().is_none());
    }
}
