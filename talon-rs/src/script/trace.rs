//! Error-trace accumulation.
//!
//! While an error unwinds, each evaluation boundary it crosses appends one
//! line of context to the `errorInfo` global: the first boundary records
//! the message itself and the `errorCode`, later ones append
//! `while executing` / `invoked from within` frames.  The interpreter-wide
//! [`ErrorState`] tracks whether an unwind is in progress so that the
//! message is recorded exactly once.

use std::sync::{Arc, OnceLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use super::interp::Interpreter;
use super::result::{Fault, ScriptError};
use super::value::Value;

pub const ERROR_INFO: &str = "errorInfo";
pub const ERROR_CODE: &str = "errorCode";

/// Frames appended before the overflow cap can engage.
const MAX_OVERFLOW_FRAMES: usize = 5;
/// Level distance from the overflow before the cap engages.
const MAX_OVERFLOW_LEVELS: usize = 5;
/// Longest command text quoted in a trace frame.
const MAX_COMMAND_CHARS: usize = 150;

pub const TRUNCATED: &str = "\n    ... truncated ...";

/// Interpreter-wide unwind bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct ErrorState {
    /// An error is unwinding and its message has been recorded.
    pub in_progress: bool,
    /// The next logging step is suppressed (then the flag clears).
    pub already_logged: bool,
    /// `errorCode` was set explicitly for the current unwind.
    pub code_set: bool,
    pub stack_overflow: bool,
    /// Script level at which the overflow was detected.
    pub overflow_level: usize,
    pub frames_appended: usize,
    /// Appension was skipped at least once because of the overflow cap.
    pub truncated: bool,
    pub last_fault: Option<Arc<Fault>>,
}

impl ErrorState {
    /// Forget the current unwind.  The stored fault is kept for inspection.
    pub fn reset_unwind(&mut self) {
        let fault = self.last_fault.take();
        *self = ErrorState { last_fault: fault, ..ErrorState::default() };
    }

    pub fn flag_overflow(&mut self, level: usize) {
        if !self.stack_overflow {
            self.stack_overflow = true;
            self.overflow_level = level;
        }
    }
}

/// Saved error state and trace globals, restored after background work so
/// that an interrupted foreground unwind is not disturbed.
#[derive(Debug, Clone)]
pub struct ErrorSnapshot {
    state: ErrorState,
    info: Option<Value>,
    code: Option<Value>,
}

impl ErrorSnapshot {
    pub fn take(interp: &Interpreter) -> Self {
        let state = interp.errors().clone();
        ErrorSnapshot {
            state,
            info: interp.global_var(ERROR_INFO),
            code: interp.global_var(ERROR_CODE),
        }
    }

    pub fn restore(self, interp: &Interpreter) {
        *interp.errors() = self.state;
        for (name, value) in [(ERROR_INFO, self.info), (ERROR_CODE, self.code)] {
            interp.set_global_var(name, value.unwrap_or_default());
        }
    }
}

// ── Recording ─────────────────────────────────────────────────────────────────

enum Step {
    First { code: Option<String> },
    Append,
    Skip,
}

/// Record `info` for `error`.
///
/// The first call of an unwind stores `message + info` in `errorInfo` and
/// the error's code (or `NONE`) in `errorCode`; later calls append `info`.
/// After a stack overflow, appension stops once more than five frames have
/// been appended and the current level is more than five levels above the
/// overflow.
pub fn add_error_information(interp: &Interpreter, error: &ScriptError, info: &str) {
    let level = interp.levels().script();
    let step = {
        let mut state = interp.errors();
        if !state.in_progress {
            state.in_progress = true;
            state.frames_appended = 1;
            let code = if state.code_set {
                None
            } else {
                state.code_set = error.error_code.is_some();
                Some(error.error_code.clone().unwrap_or_else(|| "NONE".to_owned()))
            };
            Step::First { code }
        } else if state.stack_overflow
            && state.frames_appended > MAX_OVERFLOW_FRAMES
            && state.overflow_level.saturating_sub(level) > MAX_OVERFLOW_LEVELS
        {
            state.truncated = true;
            Step::Skip
        } else {
            state.frames_appended += 1;
            Step::Append
        }
    };

    match step {
        Step::First { code } => {
            let mut text = error.message.to_string();
            text.push_str(info);
            interp.set_global_var(ERROR_INFO, Value::from(text));
            if let Some(code) = code {
                interp.set_global_var(ERROR_CODE, Value::from(code));
            }
        }
        Step::Append => append_error_info(interp, info),
        Step::Skip => {}
    }
}

/// Append raw text to `errorInfo`.
pub fn append_error_info(interp: &Interpreter, text: &str) {
    let mut current = interp.global_var(ERROR_INFO).map(Value::into_string).unwrap_or_default();
    current.push_str(text);
    interp.set_global_var(ERROR_INFO, Value::from(current));
}

/// Set `errorCode` explicitly; the first recording of the unwind keeps it.
pub fn set_error_code(interp: &Interpreter, code: &str) {
    interp.errors().code_set = true;
    interp.set_global_var(ERROR_CODE, Value::from(code));
}

fn line_terminators() -> &'static AhoCorasick {
    static TERMINATORS: OnceLock<AhoCorasick> = OnceLock::new();
    TERMINATORS.get_or_init(|| {
        AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostFirst)
            .build(["\r\n", "\n", "\r"])
    })
}

/// 1-based line of byte `offset` in `text`.
pub fn line_of(text: &str, offset: usize) -> usize {
    let end = offset.min(text.len());
    let prefix = text.get(..end).unwrap_or(text);
    line_terminators().find_iter(prefix).count() + 1
}

/// Quote a command for a trace frame: trailing blanks and the terminator are
/// dropped and long text is cut at 150 characters.
pub fn quote_command(command: &str) -> String {
    let trimmed = command.trim_end_matches([' ', '\t', '\n', '\r', ';']);
    let mut out: String = trimmed.chars().take(MAX_COMMAND_CHARS).collect();
    if trimmed.chars().nth(MAX_COMMAND_CHARS).is_some() {
        out.push_str("...");
    }
    out
}

/// Record the failing command of a script evaluation.
///
/// `script_start` is the offset of the evaluated range within `text`; the
/// error line is counted from there.  Sets `error.error_line` and returns it.
pub fn log_command_information(
    interp: &Interpreter,
    error: &mut ScriptError,
    text: &str,
    script_start: usize,
    command_start: usize,
    command_len: usize,
) -> usize {
    let script_start = script_start.min(text.len());
    let tail = text.get(script_start..).unwrap_or("");
    let line = line_of(tail, command_start.saturating_sub(script_start));
    let end = (command_start + command_len).min(text.len());
    let command = text.get(command_start.min(end)..end).unwrap_or("");

    let fresh = !interp.errors().in_progress;
    let info = if fresh {
        format!("\n    while executing\n\"{}\"", quote_command(command))
    } else {
        format!("\n    invoked from within\n\"{}\"", quote_command(command))
    };
    error.error_line = line;
    add_error_information(interp, error, &info);
    line
}

/// Set `errorCode` for a native fault as `EXCEPTION <type> <method>`, using
/// the innermost fault of a chain, and keep the fault for inspection.
pub fn set_exception_error_code(interp: &Interpreter, fault: &Arc<Fault>, method: &str) {
    let root = fault.root_cause();
    let method = if root.method.is_empty() { method } else { root.method.as_str() };
    let code = format!("EXCEPTION {} {}", root.type_name, method);
    interp.errors().last_fault = Some(Arc::clone(fault));
    set_error_code(interp, &code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_count_every_terminator_style() {
        assert_eq!(line_of("abc", 2), 1);
        assert_eq!(line_of("a\nb\r\nc\rd", 7), 4);
        assert_eq!(line_of("a\r\nb", 3), 2);
        assert_eq!(line_of("a\nb", 99), 2);
    }

    #[test]
    fn long_commands_are_truncated() {
        let cmd = "x".repeat(200);
        let q = quote_command(&cmd);
        assert_eq!(q.len(), 153);
        assert!(q.ends_with("..."));
        assert_eq!(quote_command("set a 1\n"), "set a 1");
        assert_eq!(quote_command("inner \t;\n"), "inner");
    }

    #[test]
    fn first_error_records_message_and_code() {
        let interp = Interpreter::new();
        let err = ScriptError::new("boom");
        add_error_information(&interp, &err, "\n    while executing\n\"boom\"");
        add_error_information(&interp, &err, "\n    invoked from within\n\"outer\"");
        let info = interp.global_var(ERROR_INFO).unwrap().to_string();
        assert_eq!(info, "boom\n    while executing\n\"boom\"\n    invoked from within\n\"outer\"");
        assert_eq!(interp.global_var(ERROR_CODE).unwrap().to_string(), "NONE");
    }

    #[test]
    fn overflow_caps_appension() {
        let interp = Interpreter::new();
        {
            let mut st = interp.errors();
            st.flag_overflow(20);
        }
        let err = ScriptError::new(crate::script::result::STACK_OVERFLOW);
        for _ in 0..10 {
            add_error_information(&interp, &err, "\nframe");
        }
        let info = interp.global_var(ERROR_INFO).unwrap().to_string();
        assert_eq!(info.matches("\nframe").count(), 6);
        assert!(interp.errors().truncated);
    }

    #[test]
    fn exception_code_uses_root_cause() {
        let interp = Interpreter::new();
        let fault = Arc::new(
            Fault::new(crate::script::result::FaultKind::Panic, "outer")
                .caused_by(Fault::interrupted()),
        );
        set_exception_error_code(&interp, &fault, "cmd");
        assert_eq!(interp.global_var(ERROR_CODE).unwrap().to_string(), "EXCEPTION Interrupted cmd");
        assert!(interp.last_fault().is_some());
    }
}
