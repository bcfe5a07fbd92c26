//! Command and substitution parser.
//!
//! The evaluator consumes parsers through the [`Parser`] trait; [`TclParser`]
//! is the stock implementation of the Tcl word grammar (braces, quotes,
//! `$var`, `$arr(index)`, `${name}`, `[command]` and backslash escapes).
//!
//! Both entry points append tokens to a [`ParseState`] and record the
//! offset of the character that ended the parse in `state.term`.  On error
//! `term` (and [`ParseError::term`]) points at the opener of the unmatched
//! construct: the `[` of a missing close-bracket, the `{` of an unterminated
//! `${name}`, the `(` of an unterminated array index.

use super::context::SubstFlags;
use super::token::{ParseState, TokenKind};

/// Message of an unterminated command substitution.
pub const MISSING_CLOSE_BRACKET: &str = "missing close-bracket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("missing close-bracket")]
    MissingCloseBracket,
    #[error("missing close-brace")]
    MissingCloseBrace,
    #[error("missing \"")]
    MissingQuote,
    #[error("missing )")]
    MissingParen,
    #[error("missing close-brace for variable name")]
    MissingVarBrace,
    #[error("extra characters after close-brace")]
    ExtraAfterBrace,
    #[error("extra characters after close-quote")]
    ExtraAfterQuote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// Offset the error is attributed to.
    pub term: usize,
}

impl ParseError {
    fn new(kind: ParseErrorKind, term: usize) -> Self {
        ParseError { kind, term }
    }
}

pub trait Parser: Send + Sync {
    /// Parse one command starting at `start`, skipping leading blank lines
    /// and comments.  Fills `command_start`, `command_len`, `command_words`
    /// and `term`, and replaces `tokens` with one word container per word.
    ///
    /// In `nested` mode a `]` ends the command, and reaching the end of the
    /// range without one is an error.
    fn parse_command(
        &self,
        state: &mut ParseState,
        start: usize,
        len: usize,
        nested: bool,
    ) -> Result<(), ParseError>;

    /// Parse the whole range as substitution parts (no word splitting),
    /// replacing `tokens` with the top-level part subtrees.
    fn parse_tokens(
        &self,
        state: &mut ParseState,
        start: usize,
        len: usize,
        flags: SubstFlags,
    ) -> Result<(), ParseError>;

    /// Decode the backslash sequence at the start of `text`.
    fn decode_backslash(&self, text: &str) -> (String, usize) {
        decode_backslash(text)
    }
}

/// The Tcl word grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct TclParser;

/// What ends a run of substitution parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Whitespace or a command terminator (`]` too when nested).
    Bare { nested: bool },
    Quote,
    CloseParen,
    End,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | 0x0b | 0x0c)
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

impl Parser for TclParser {
    fn parse_command(
        &self,
        state: &mut ParseState,
        start: usize,
        len: usize,
        nested: bool,
    ) -> Result<(), ParseError> {
        state.reset_command();
        let end = (start + len).min(state.text().len());
        let mut p = skip_blank_and_comments(state.text().as_bytes(), start, end);
        state.command_start = p;
        let mut words = 0;

        loop {
            p = skip_space(state.text().as_bytes(), p, end);
            if p >= end {
                if nested {
                    state.term = end;
                    return Err(ParseError::new(ParseErrorKind::MissingCloseBracket, end));
                }
                state.term = end;
                break;
            }
            let c = state.text().as_bytes()[p];
            if c == b'\n' || c == b';' {
                state.term = p;
                p += 1;
                break;
            }
            if nested && c == b']' {
                state.term = p;
                break;
            }
            p = self.parse_word(state, p, end, nested).map_err(|e| {
                state.term = e.term;
                e
            })?;
            words += 1;
        }

        state.command_words = words;
        state.command_len = p - state.command_start;
        Ok(())
    }

    fn parse_tokens(
        &self,
        state: &mut ParseState,
        start: usize,
        len: usize,
        flags: SubstFlags,
    ) -> Result<(), ParseError> {
        state.reset_command();
        let end = (start + len).min(state.text().len());
        state.command_start = start;
        match self.parse_parts(state, start, end, Stop::End, flags) {
            Ok(p) => {
                state.term = p;
                state.command_len = p - start;
                Ok(())
            }
            Err(e) => {
                state.term = e.term;
                Err(e)
            }
        }
    }
}

impl TclParser {
    /// Parse one word at `p`, returning the offset just past it.
    fn parse_word(
        &self,
        state: &mut ParseState,
        p: usize,
        end: usize,
        nested: bool,
    ) -> Result<usize, ParseError> {
        let word = state.push_token(TokenKind::Word, p, 0, 0);
        let first = state.text().as_bytes()[p];
        let after = match first {
            b'"' => {
                let q = self.parse_parts(state, p + 1, end, Stop::Quote, SubstFlags::default())?;
                if q >= end {
                    return Err(ParseError::new(ParseErrorKind::MissingQuote, p));
                }
                let q = q + 1;
                if !word_may_end(state.text().as_bytes(), q, end, nested) {
                    return Err(ParseError::new(ParseErrorKind::ExtraAfterQuote, q));
                }
                q
            }
            b'{' => {
                let q = self.parse_braces(state, p, end)?;
                if !word_may_end(state.text().as_bytes(), q, end, nested) {
                    return Err(ParseError::new(ParseErrorKind::ExtraAfterBrace, q));
                }
                q
            }
            _ => self.parse_parts(state, p, end, Stop::Bare { nested }, SubstFlags::default())?,
        };

        let mut components = state.tokens.len() - word - 1;
        if components == 0 {
            let at = if first == b'"' || first == b'{' { p + 1 } else { p };
            state.push_token(TokenKind::Text, at, 0, 0);
            components = 1;
        }
        let simple = components == 1 && state.tokens[word + 1].kind == TokenKind::Text;
        let token = &mut state.tokens[word];
        token.kind = if simple { TokenKind::SimpleWord } else { TokenKind::Word };
        token.len = after - p;
        token.components = components;
        finish_token(state, word);
        Ok(after)
    }

    /// Parse `{...}` at `p`; the contents stay literal apart from
    /// backslash-newline sequences.
    fn parse_braces(&self, state: &mut ParseState, p: usize, end: usize) -> Result<usize, ParseError> {
        let mut depth = 1usize;
        let mut q = p + 1;
        let mut text_start = q;
        while q < end {
            let b = state.text().as_bytes()[q];
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        push_text(state, text_start, q);
                        return Ok(q + 1);
                    }
                }
                b'\\' if q + 1 < end && state.text().as_bytes()[q + 1] == b'\n' => {
                    push_text(state, text_start, q);
                    let used = backslash_len(state.text(), q, end);
                    state.push_token(TokenKind::Backslash, q, used, 0);
                    q += used;
                    text_start = q;
                    continue;
                }
                b'\\' => q += 1,
                _ => {}
            }
            q += 1;
        }
        Err(ParseError::new(ParseErrorKind::MissingCloseBrace, p))
    }

    /// Parse substitution parts from `p` until `stop`, returning the offset
    /// of the stopping character (or `end`).
    fn parse_parts(
        &self,
        state: &mut ParseState,
        mut p: usize,
        end: usize,
        stop: Stop,
        flags: SubstFlags,
    ) -> Result<usize, ParseError> {
        let mut text_start = p;
        while p < end {
            let b = state.text().as_bytes()[p];
            let stops = match stop {
                Stop::Bare { nested } => {
                    is_space(b) || b == b'\n' || b == b';' || (nested && b == b']')
                }
                Stop::Quote => b == b'"',
                Stop::CloseParen => b == b')',
                Stop::End => false,
            };
            if stops {
                break;
            }
            match b {
                b'$' if !flags.no_variables && starts_variable(state.text().as_bytes(), p, end) => {
                    push_text(state, text_start, p);
                    p = self.parse_variable(state, p, end)?;
                    text_start = p;
                }
                b'[' if !flags.no_commands => {
                    push_text(state, text_start, p);
                    p = self.parse_command_subst(state, p, end)?;
                    text_start = p;
                }
                b'\\' if !flags.no_backslashes => {
                    let bytes = state.text().as_bytes();
                    if matches!(stop, Stop::Bare { .. }) && p + 1 < end && bytes[p + 1] == b'\n' {
                        break;
                    }
                    push_text(state, text_start, p);
                    let used = backslash_len(state.text(), p, end);
                    state.push_token(TokenKind::Backslash, p, used, 0);
                    p += used;
                    text_start = p;
                }
                _ => p += 1,
            }
        }
        push_text(state, text_start, p.min(end));
        Ok(p.min(end))
    }

    /// Parse the variable reference at `p`; see [`starts_variable`].
    fn parse_variable(
        &self,
        state: &mut ParseState,
        p: usize,
        end: usize,
    ) -> Result<usize, ParseError> {
        let mut q = p + 1;
        let bytes = state.text().as_bytes();

        if q < end && bytes[q] == b'{' {
            let Some(close) = bytes[q + 1..end].iter().position(|&b| b == b'}') else {
                return Err(ParseError::new(ParseErrorKind::MissingVarBrace, q));
            };
            let close = q + 1 + close;
            let var = state.push_token(TokenKind::Variable, p, close + 1 - p, 1);
            state.push_token(TokenKind::Text, q + 1, close - (q + 1), 0);
            finish_token(state, var);
            return Ok(close + 1);
        }

        let name_start = q;
        while q < end {
            if is_name_byte(bytes[q]) {
                q += 1;
            } else if bytes[q] == b':' && q + 1 < end && bytes[q + 1] == b':' {
                q += 2;
            } else {
                break;
            }
        }
        let has_index = q < end && bytes[q] == b'(';

        let var = state.push_token(TokenKind::Variable, p, 0, 0);
        state.push_token(TokenKind::Text, name_start, q - name_start, 0);
        if has_index {
            let paren = q;
            let r = self.parse_parts(state, q + 1, end, Stop::CloseParen, SubstFlags::default())?;
            if r >= end {
                return Err(ParseError::new(ParseErrorKind::MissingParen, paren));
            }
            q = r + 1;
        }
        state.tokens[var].len = q - p;
        state.tokens[var].components = state.tokens.len() - var - 1;
        finish_token(state, var);
        Ok(q)
    }

    /// Parse `[...]` at `p`, returning the offset just past the `]`.
    fn parse_command_subst(
        &self,
        state: &mut ParseState,
        p: usize,
        end: usize,
    ) -> Result<usize, ParseError> {
        let mut scratch = state.fork();
        let mut q = p + 1;
        loop {
            match self.parse_command(&mut scratch, q, end - q, true) {
                Ok(()) => {}
                Err(e) if e.kind == ParseErrorKind::MissingCloseBracket && e.term >= end => {
                    return Err(ParseError::new(ParseErrorKind::MissingCloseBracket, p));
                }
                Err(e) => return Err(e),
            }
            let term = scratch.term;
            if term < end && state.text().as_bytes()[term] == b']' {
                q = term + 1;
                break;
            }
            q = term + 1;
            if q >= end {
                return Err(ParseError::new(ParseErrorKind::MissingCloseBracket, p));
            }
        }
        let cmd = state.push_token(TokenKind::Command, p, q - p, 0);
        finish_token(state, cmd);
        Ok(q)
    }
}

/// Whether the `$` at `p` starts a variable reference rather than being
/// literal text.
fn starts_variable(bytes: &[u8], p: usize, end: usize) -> bool {
    if p + 1 >= end {
        return false;
    }
    let b = bytes[p + 1];
    b == b'{' || b == b'(' || is_name_byte(b) || (b == b':' && p + 2 < end && bytes[p + 2] == b':')
}

fn push_text(state: &mut ParseState, from: usize, to: usize) {
    if to > from {
        state.push_token(TokenKind::Text, from, to - from, 0);
    }
}

fn finish_token(state: &mut ParseState, index: usize) {
    state.tokens[index].end_line = token_end_line(state, index);
}

fn token_end_line(state: &ParseState, index: usize) -> usize {
    let t = &state.tokens[index];
    state.line_at((t.start + t.len).saturating_sub(1).max(t.start))
}

fn backslash_len(text: &str, p: usize, end: usize) -> usize {
    text.get(p..end).map_or(1, |s| decode_backslash(s).1.max(1))
}

/// After a quoted or braced word: end of range, whitespace or terminator.
fn word_may_end(bytes: &[u8], q: usize, end: usize, nested: bool) -> bool {
    if q >= end {
        return true;
    }
    let b = bytes[q];
    is_space(b)
        || b == b'\n'
        || b == b';'
        || (nested && b == b']')
        || (b == b'\\' && q + 1 < end && bytes[q + 1] == b'\n')
}

/// Skip spaces, tabs and backslash-newline sequences.
fn skip_space(bytes: &[u8], mut p: usize, end: usize) -> usize {
    while p < end {
        if is_space(bytes[p]) {
            p += 1;
        } else if bytes[p] == b'\\' && p + 1 < end && bytes[p + 1] == b'\n' {
            p += 2;
            while p < end && matches!(bytes[p], b' ' | b'\t') {
                p += 1;
            }
        } else {
            break;
        }
    }
    p
}

/// Skip whitespace, newlines and `#` comments before a command.
fn skip_blank_and_comments(bytes: &[u8], mut p: usize, end: usize) -> usize {
    loop {
        p = skip_space(bytes, p, end);
        while p < end && bytes[p] == b'\n' {
            p = skip_space(bytes, p + 1, end);
        }
        if p < end && bytes[p] == b'#' {
            while p < end && bytes[p] != b'\n' {
                if bytes[p] == b'\\' && p + 1 < end {
                    p += 1;
                }
                p += 1;
            }
            continue;
        }
        return p;
    }
}

// ── Backslash sequences ───────────────────────────────────────────────────────

fn hex_run(bytes: &[u8], from: usize, max: usize) -> (u32, usize) {
    let mut value = 0u32;
    let mut n = 0;
    while n < max {
        match bytes.get(from + n).and_then(|b| (*b as char).to_digit(16)) {
            Some(d) => {
                value = value.wrapping_mul(16).wrapping_add(d);
                n += 1;
            }
            None => break,
        }
    }
    (value, n)
}

/// Decode the backslash sequence at the start of `text`, returning the
/// replacement and the number of bytes consumed.
///
/// A backslash-newline and the spaces and tabs after it decode to one space.
/// Unknown escapes decode to the escaped character itself.
pub fn decode_backslash(text: &str) -> (String, usize) {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'\\') {
        return (String::new(), 0);
    }
    let Some(&next) = bytes.get(1) else {
        return ("\\".to_owned(), 1);
    };
    let simple = |c: char| (c.to_string(), 2);
    match next {
        b'a' => simple('\x07'),
        b'b' => simple('\x08'),
        b'f' => simple('\x0c'),
        b'n' => simple('\n'),
        b'r' => simple('\r'),
        b't' => simple('\t'),
        b'v' => simple('\x0b'),
        b'\n' => {
            let mut n = 2;
            while matches!(bytes.get(n), Some(b' ' | b'\t')) {
                n += 1;
            }
            (" ".to_owned(), n)
        }
        b'x' | b'u' | b'U' => {
            let max = match next {
                b'x' => 2,
                b'u' => 4,
                _ => 8,
            };
            let (value, digits) = hex_run(bytes, 2, max);
            if digits == 0 {
                return simple(next as char);
            }
            let c = char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER);
            (c.to_string(), 2 + digits)
        }
        b'0'..=b'7' => {
            let mut value = 0u32;
            let mut n = 1;
            while n <= 3 {
                match bytes.get(n) {
                    Some(b @ b'0'..=b'7') => {
                        value = value * 8 + u32::from(b - b'0');
                        n += 1;
                    }
                    _ => break,
                }
            }
            let c = char::from_u32(value & 0xff).unwrap_or(char::REPLACEMENT_CHARACTER);
            (c.to_string(), n)
        }
        _ => {
            let c = text[1..].chars().next().unwrap_or('\\');
            (c.to_string(), 1 + c.len_utf8())
        }
    }
}
