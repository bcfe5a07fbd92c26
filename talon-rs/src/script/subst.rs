//! `subst`-style evaluation: substitutions over free text, no word
//! splitting or command dispatch of the text itself.
//!
//! A parse error does not stop the substitution at once.  The longest
//! prefix that parses is substituted first (including any complete
//! commands of an unterminated `[...]`), then the saved parse error is
//! reported.

use std::sync::Arc;

use tracing::trace;

use super::context::EvalContext;
use super::eval;
use super::expand;
use super::interp::Interpreter;
use super::parser::ParseError;
use super::result::{EvalResult, Flow};
use super::token::{ParseState, TokenKind};
use super::value::Value;

/// Substitute `text` as one script level.
pub fn substitute(interp: &Interpreter, text: &str, ctx: &EvalContext) -> EvalResult {
    let mut state = ParseState::new(text);
    eval::guarded(interp, ctx, |ctx| substitute_state(interp, &mut state, ctx))
}

/// Substitute the whole text of `state`.
pub fn substitute_state(interp: &Interpreter, state: &mut ParseState, ctx: &EvalContext) -> EvalResult {
    let saved = parse_prefix(interp, state, ctx);

    let mut out = String::new();
    let mut index = 0;
    while index < state.tokens.len() {
        match expand::evaluate_tokens(interp, state, index, 1, ctx) {
            Ok(v) | Err(Flow::Return(v)) => {
                out.push_str(&v.into_string());
                expand::check_result_size(interp, out.len())?;
            }
            Err(Flow::Break | Flow::Continue) => {}
            Err(e) => return Err(e),
        }
        index = state.subtree_end(index);
    }

    match saved {
        Some(e) => Err(Flow::error(e.kind.to_string())),
        None => Ok(Value::from(out)),
    }
}

/// Parse as much of the text as possible.  Returns the first parse error,
/// if any, with the recoverable tokens left in `state`.
fn parse_prefix(interp: &Interpreter, state: &mut ParseState, ctx: &EvalContext) -> Option<ParseError> {
    let parser = interp.parser();
    let flags = ctx.subst();
    let text_len = state.text().len();

    let first = parser.parse_tokens(state, 0, text_len, flags).err()?;
    trace!(error = %first, at = first.term, "substitution parse error; recovering prefix");

    let mut limit = first.term.min(text_len);
    loop {
        match parser.parse_tokens(state, 0, limit, flags) {
            Ok(()) => break,
            Err(e) if e.term < limit => limit = e.term,
            Err(_) if limit > 0 => limit -= 1,
            Err(_) => {
                state.tokens.clear();
                return Some(first);
            }
        }
    }

    match state.text().as_bytes().get(limit) {
        Some(b'(') if limit > 0 && state.text().as_bytes()[limit - 1] != b'$' => {
            // A scalar reference was parsed where the array reference failed.
            let n = state.tokens.len();
            if n >= 2 && state.tokens[n - 2].kind == TokenKind::Variable {
                state.tokens.truncate(n - 2);
            }
        }
        Some(b'[') => recover_commands(interp, state, limit, text_len),
        _ => {}
    }
    Some(first)
}

/// Claim the complete commands of an unterminated `[...]` at `open` as one
/// command token.
fn recover_commands(interp: &Interpreter, state: &mut ParseState, open: usize, end: usize) {
    let parser = interp.parser();
    let mut scratch = ParseState::new(Arc::clone(state.shared_text()));
    let mut p = open + 1;
    let mut last_term = open;
    while p < end && parser.parse_command(&mut scratch, p, end - p, false).is_ok() {
        let term = scratch.term;
        p = if term < end { term + 1 } else { term };
        if p >= end && term >= end {
            break;
        }
        last_term = term;
    }
    if last_term != open {
        state.push_token(TokenKind::Command, open, last_term - open + 1, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subst(interp: &Interpreter, text: &str) -> EvalResult {
        substitute(interp, text, &EvalContext::new())
    }

    #[test]
    fn variables_commands_and_backslashes() {
        let interp = Interpreter::new();
        interp.set_variable("x", None, Value::from(5)).unwrap();
        let v = subst(&interp, "x=$x [set x] \\u0041").unwrap();
        assert_eq!(v.to_string(), "x=5 5 A");
    }

    #[test]
    fn complete_commands_run_before_the_parse_error() {
        let interp = Interpreter::new();
        let err = subst(&interp, "a [set y 1; set z 2").unwrap_err();
        assert_eq!(err.to_string(), "missing close-bracket");
        assert_eq!(interp.get_variable("y", None).unwrap().to_string(), "1");
        assert!(interp.get_variable("z", None).is_err());
    }

    #[test]
    fn broken_array_reference_drops_scalar_part() {
        let interp = Interpreter::new();
        let err = subst(&interp, "pre $a(x").unwrap_err();
        assert_eq!(err.to_string(), "missing )");
    }

    #[test]
    fn flags_leave_specials_alone() {
        let interp = Interpreter::new();
        let ctx = EvalContext::new().with_subst(crate::script::context::SubstFlags {
            no_commands: true,
            ..Default::default()
        });
        let v = substitute(&interp, "[set q]", &ctx).unwrap();
        assert_eq!(v.to_string(), "[set q]");
    }
}
