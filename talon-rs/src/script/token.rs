//! Parse state and the flat token tree.
//!
//! Tokens are stored in pre-order: a token with `components = N` is
//! immediately followed by its `N` descendants, so skipping a whole subtree
//! means advancing the index by `components + 1`.  All offsets are byte
//! offsets into the shared source text.

use std::sync::{Arc, OnceLock};

use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// A command word that needs substitution; its components are the parts.
    Word,
    /// A word with exactly one `Text` component and nothing to substitute.
    SimpleWord,
    Text,
    Backslash,
    /// `[...]`, including both brackets.
    Command,
    /// `$name` or `$name(index)`; the first component is the name text, the
    /// remaining components form the index.
    Variable,
    /// Like `Variable`, but substitutes to `name(index)` instead of the value.
    VariableNameOnly,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub len: usize,
    pub components: usize,
    pub start_line: usize,
    pub end_line: usize,
    /// Substituted value of a literal word, filled on first evaluation.
    literal: OnceLock<Value>,
}

impl Token {
    pub fn new(kind: TokenKind, start: usize, len: usize, components: usize) -> Self {
        Token { kind, start, len, components, start_line: 0, end_line: 0, literal: OnceLock::new() }
    }

    pub fn with_lines(mut self, start_line: usize, end_line: usize) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Cached literal value, if one has been recorded.
    pub fn literal(&self) -> Option<&Value> {
        self.literal.get()
    }

    /// Record the literal value of a `SimpleWord`.  The first value wins.
    pub fn cache_literal(&self, value: &Value) {
        if self.kind == TokenKind::SimpleWord {
            let _ = self.literal.set(value.clone());
        }
    }
}

/// Source text plus the tokens of the command (or substitution) parsed last.
#[derive(Debug, Clone)]
pub struct ParseState {
    text: Arc<str>,
    file_name: Option<Arc<str>>,
    /// Line number of the first byte of `text`.
    base_line: usize,
    /// Offsets at which a new line begins.
    line_starts: Arc<[usize]>,
    pub command_start: usize,
    pub command_len: usize,
    pub command_words: usize,
    /// Offset of the character that ended the parse (terminator or error).
    pub term: usize,
    pub tokens: Vec<Token>,
}

impl ParseState {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text: Arc<str> = text.into();
        let line_starts = line_starts(&text);
        ParseState {
            text,
            file_name: None,
            base_line: 1,
            line_starts,
            command_start: 0,
            command_len: 0,
            command_words: 0,
            term: 0,
            tokens: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: Option<Arc<str>>) -> Self {
        self.file_name = name;
        self
    }

    pub fn with_base_line(mut self, line: usize) -> Self {
        self.base_line = line.max(1);
        self
    }

    /// A fresh state over the same text, with no tokens.
    pub fn fork(&self) -> Self {
        ParseState {
            text: Arc::clone(&self.text),
            file_name: self.file_name.clone(),
            base_line: self.base_line,
            line_starts: Arc::clone(&self.line_starts),
            command_start: 0,
            command_len: 0,
            command_words: 0,
            term: 0,
            tokens: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn shared_text(&self) -> &Arc<str> {
        &self.text
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn shared_file_name(&self) -> Option<Arc<str>> {
        self.file_name.clone()
    }

    /// Line number of byte `offset`.
    pub fn line_at(&self, offset: usize) -> usize {
        let idx = self.line_starts.partition_point(|&s| s <= offset);
        self.base_line + idx
    }

    pub fn slice(&self, start: usize, len: usize) -> &str {
        let end = (start + len).min(self.text.len());
        self.text.get(start.min(end)..end).unwrap_or("")
    }

    pub fn token_text(&self, token: &Token) -> &str {
        self.slice(token.start, token.len)
    }

    pub fn command_text(&self) -> &str {
        self.slice(self.command_start, self.command_len)
    }

    /// Clear the per-command fields so the state can be reused.
    pub fn reset_command(&mut self) {
        self.command_start = 0;
        self.command_len = 0;
        self.command_words = 0;
        self.tokens.clear();
    }

    pub fn push_token(&mut self, kind: TokenKind, start: usize, len: usize, components: usize) -> usize {
        let token = Token::new(kind, start, len, components)
            .with_lines(self.line_at(start), self.line_at((start + len).saturating_sub(1)));
        self.tokens.push(token);
        self.tokens.len() - 1
    }

    /// Index just past the subtree rooted at `index`.
    pub fn subtree_end(&self, index: usize) -> usize {
        index + self.tokens.get(index).map_or(0, |t| t.components) + 1
    }
}

/// Offsets following each `\n`, `\r\n` or lone `\r`.
fn line_starts(text: &str) -> Arc<[usize]> {
    let bytes = text.as_bytes();
    let mut starts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => starts.push(i + 1),
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                starts.push(i + 2);
                i += 1;
            }
            b'\r' => starts.push(i + 1),
            _ => {}
        }
        i += 1;
    }
    starts.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_numbers_respect_all_terminators() {
        let ps = ParseState::new("a\nb\r\nc\rd");
        assert_eq!(ps.line_at(0), 1);
        assert_eq!(ps.line_at(2), 2);
        assert_eq!(ps.line_at(5), 3);
        assert_eq!(ps.line_at(7), 4);
        assert_eq!(ParseState::new("x\ny").with_base_line(10).line_at(2), 11);
    }

    #[test]
    fn subtree_end_skips_descendants() {
        let mut ps = ParseState::new("$a(x)b");
        ps.push_token(TokenKind::Word, 0, 6, 4);
        ps.push_token(TokenKind::Variable, 0, 5, 2);
        ps.push_token(TokenKind::Text, 1, 1, 0);
        ps.push_token(TokenKind::Text, 3, 1, 0);
        ps.push_token(TokenKind::Text, 5, 1, 0);
        assert_eq!(ps.subtree_end(0), 5);
        assert_eq!(ps.subtree_end(1), 4);
        assert_eq!(ps.subtree_end(4), 5);
    }

    #[test]
    fn literal_cache_only_for_simple_words() {
        let simple = Token::new(TokenKind::SimpleWord, 0, 1, 1);
        simple.cache_literal(&Value::from("x"));
        simple.cache_literal(&Value::from("y"));
        assert_eq!(simple.literal(), Some(&Value::from("x")));

        let word = Token::new(TokenKind::Word, 0, 1, 1);
        word.cache_literal(&Value::from("x"));
        assert!(word.literal().is_none());
    }
}
