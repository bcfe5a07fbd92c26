//! Script-defined procedures.

use std::sync::{Arc, OnceLock};

use crate::frame::CallFrame;

use super::context::{ChildScope, EvalContext};
use super::eval;
use super::interp::{FrameGuard, Interpreter};
use super::parser::Parser;
use super::result::{EvalResult, Flow};
use super::token::ParseState;
use super::trace;
use super::value::{split_list, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

/// A procedure created by `proc`.
#[derive(Debug)]
pub struct Procedure {
    name: String,
    params: Vec<Param>,
    /// The last parameter is `args`.
    variadic: bool,
    body: Arc<str>,
    /// Parsed commands of the body; `None` when the body does not parse, in
    /// which case it is evaluated from text so the error surfaces normally.
    compiled: OnceLock<Option<Arc<[ParseState]>>>,
}

impl Procedure {
    /// Build from the `proc` argument list and body text.
    pub fn new(name: &str, params: &str, body: &str) -> Result<Self, String> {
        let mut out = Vec::new();
        for spec in split_list(params)? {
            let parts = split_list(&spec)?;
            match parts.as_slice() {
                [] => {
                    return Err(format!("argument with no name in procedure \"{name}\""));
                }
                [param] => out.push(Param { name: param.clone(), default: None }),
                [param, default] => {
                    out.push(Param { name: param.clone(), default: Some(Value::from(default.as_str())) })
                }
                _ => {
                    return Err(format!(
                        "too many fields in argument specifier \"{spec}\""
                    ));
                }
            }
        }
        let variadic = out.last().is_some_and(|p| p.name == "args");
        Ok(Procedure {
            name: name.to_owned(),
            params: out,
            variadic,
            body: Arc::from(body),
            compiled: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// The body split into commands, parsed on first use.
    pub fn compiled(&self, parser: &dyn Parser) -> Option<Arc<[ParseState]>> {
        self.compiled
            .get_or_init(|| {
                let mut commands = Vec::new();
                let mut state = ParseState::new(Arc::clone(&self.body));
                let end = self.body.len();
                let mut p = 0;
                while p < end {
                    parser.parse_command(&mut state, p, end - p, false).ok()?;
                    let next = state.command_start + state.command_len;
                    let fresh = state.fork();
                    let parsed = std::mem::replace(&mut state, fresh);
                    if parsed.command_words > 0 {
                        commands.push(parsed);
                    }
                    if next <= p {
                        break;
                    }
                    p = next;
                }
                Some(Arc::from(commands))
            })
            .clone()
    }

    fn usage(&self) -> String {
        let mut s = format!("wrong # args: should be \"{}", self.name);
        for (i, param) in self.params.iter().enumerate() {
            if self.variadic && i == self.params.len() - 1 {
                s.push_str(" ?arg ...?");
            } else if param.default.is_some() {
                s.push_str(&format!(" ?{}?", param.name));
            } else {
                s.push(' ');
                s.push_str(&param.name);
            }
        }
        s.push('"');
        s
    }

    /// Bind `args` (after the name) to parameters.
    fn bind(&self, frame: &mut CallFrame, args: &[Value]) -> Result<(), Flow> {
        let fixed = if self.variadic { self.params.len() - 1 } else { self.params.len() };
        if args.len() > fixed && !self.variadic {
            return Err(Flow::error(self.usage()));
        }
        for (i, param) in self.params.iter().take(fixed).enumerate() {
            let value = match (args.get(i), &param.default) {
                (Some(v), _) => v.clone(),
                (None, Some(d)) => d.clone(),
                (None, None) => return Err(Flow::error(self.usage())),
            };
            frame.define(param.name.clone(), value);
        }
        if self.variadic {
            let rest: Vec<String> = args.iter().skip(fixed).map(Value::to_string).collect();
            frame.define("args", Value::from(super::value::merge_list(&rest)));
        }
        Ok(())
    }
}

/// Call `procedure` with `args` (`args[0]` is the invoked name).
pub fn invoke(interp: &Interpreter, procedure: &Procedure, args: &[Value], ctx: &EvalContext) -> EvalResult {
    let mut frame = CallFrame::procedure(procedure.name());
    procedure.bind(&mut frame, args.get(1..).unwrap_or(&[]))?;
    let _frame = FrameGuard::push(interp, frame);

    let child = ctx.child_for(ChildScope::Procedure);
    match eval::evaluate_body(interp, procedure, &child) {
        Ok(v) | Err(Flow::Return(v)) => Ok(v),
        Err(Flow::Break) => Err(Flow::error("invoked \"break\" outside of a loop")),
        Err(Flow::Continue) => Err(Flow::error("invoked \"continue\" outside of a loop")),
        Err(Flow::Error(mut e)) => {
            if e.error_line > 0 {
                let info = format!("\n    (procedure \"{}\" line {})", procedure.name(), e.error_line);
                trace::add_error_information(interp, &e, &info);
            }
            e.error_line = 0;
            Err(Flow::Error(e))
        }
    }
}
