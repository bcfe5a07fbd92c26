//! Expression lexer, AST, parser, and evaluator.
//!
//! The `expr` language: integer and float arithmetic, comparison (numeric
//! when both sides are numbers, string otherwise), `eq`/`ne` string
//! comparison, `in`/`ni` list membership, bitwise and logical operators,
//! the ternary operator, math functions (resolved through the registry),
//! and named infix operators registered by the host.  Operands may be
//! `$var`, `$arr(index)`, `[command]`, `"quoted $subst"` or `{literal}`.
//!
//! Operator precedence (lowest → highest):
//!   ternary  →  or  →  and  →  bitor  →  bitxor  →  bitand  →  in/ni  →
//!   eq/ne/named  →  equality  →  relational  →  shift  →  additive  →
//!   multiplicative  →  power  →  unary  →  primary

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::hook::{self, BreakpointContext, BreakpointType};

use super::context::{ChildScope, EvalContext};
use super::dispatch;
use super::eval;
use super::events;
use super::interp::Interpreter;
use super::result::{EvalResult, Flow};
use super::subst;
use super::token::ParseState;
use super::value::{split_list, Number, Value};
use super::{read, write};

// ── ExprHost ──────────────────────────────────────────────────────────────────

/// What the evaluator needs from its environment.
///
/// [`InterpHost`] routes everything through an interpreter; tests use a
/// map-backed host.
pub trait ExprHost {
    fn variable(&self, name: &str, index: Option<&str>) -> EvalResult;
    /// Evaluate the script of a `[...]` operand.
    fn script(&self, script: &str) -> EvalResult;
    /// Substitute the contents of a `"..."` operand or an array index.
    fn substitute(&self, text: &str) -> EvalResult;
    fn function(&self, name: &str, args: &[Value]) -> EvalResult;
    fn operator(&self, name: &str, lhs: Value, rhs: Value) -> EvalResult;
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Operands
    Int(i64),
    Float(f64),
    /// `{...}` contents.
    Braced(String),
    /// `"..."` contents, still to be substituted.
    Quoted(String),
    Var { name: String, index: Option<String> },
    /// `[...]` contents.
    Script(String),
    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Pow, // **
    Slash,
    Percent,
    Bang,
    Tilde,
    Ampersand,
    Pipe,
    Caret,
    ShiftLeft,
    ShiftRight,

    // Comparison
    Eq, // ==
    Ne, // !=
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And, // &&
    Or,  // ||

    // Misc
    Question,
    Colon,
    Comma,
    LParen,
    RParen,
    /// Unrecognised input character, reported as a syntax error.
    Unknown(char),
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Int(n) => n.to_string(),
            Token::Float(x) => x.to_string(),
            Token::Braced(s) => format!("{{{s}}}"),
            Token::Quoted(s) => format!("\"{s}\""),
            Token::Var { name, .. } => format!("${name}"),
            Token::Script(s) => format!("[{s}]"),
            Token::Ident(s) => s.clone(),
            Token::Unknown(c) => c.to_string(),
            Token::Eof => "end of expression".to_owned(),
            Token::Plus => "+".to_owned(),
            Token::Minus => "-".to_owned(),
            Token::Star => "*".to_owned(),
            Token::Pow => "**".to_owned(),
            Token::Slash => "/".to_owned(),
            Token::Percent => "%".to_owned(),
            Token::Bang => "!".to_owned(),
            Token::Tilde => "~".to_owned(),
            Token::Ampersand => "&".to_owned(),
            Token::Pipe => "|".to_owned(),
            Token::Caret => "^".to_owned(),
            Token::ShiftLeft => "<<".to_owned(),
            Token::ShiftRight => ">>".to_owned(),
            Token::Eq => "==".to_owned(),
            Token::Ne => "!=".to_owned(),
            Token::Lt => "<".to_owned(),
            Token::Le => "<=".to_owned(),
            Token::Gt => ">".to_owned(),
            Token::Ge => ">=".to_owned(),
            Token::And => "&&".to_owned(),
            Token::Or => "||".to_owned(),
            Token::Question => "?".to_owned(),
            Token::Colon => ":".to_owned(),
            Token::Comma => ",".to_owned(),
            Token::LParen => "(".to_owned(),
            Token::RParen => ")".to_owned(),
        }
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    text: &'a str,
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { text: src, src: src.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn slice(&self, from: usize, to: usize) -> String {
        self.text.get(from..to).unwrap_or("").to_owned()
    }

    fn read_number(&mut self, start: usize) -> Result<Token, String> {
        let first = self.src[start];
        if first == b'0' && matches!(self.peek(), Some(b'x' | b'X')) {
            self.pos += 1;
            let digits = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')) {
                self.pos += 1;
            }
            let hex = self.slice(digits, self.pos);
            return i64::from_str_radix(&hex, 16)
                .map(Token::Int)
                .map_err(|_| format!("invalid hexadecimal number \"0x{hex}\""));
        }

        let mut is_float = first == b'.';
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if !is_float && self.peek() == Some(b'.') && matches!(self.peek2(), Some(b'0'..=b'9')) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(b'0'..=b'9')) {
                is_float = true;
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            } else {
                self.pos = mark;
            }
        }

        let s = self.slice(start, self.pos);
        if is_float {
            s.parse().map(Token::Float).map_err(|_| format!("invalid number \"{s}\""))
        } else {
            s.parse().map(Token::Int).map_err(|_| format!("integer value too large to represent: \"{s}\""))
        }
    }

    /// Offset just past the delimiter matching the opener at `self.pos - 1`.
    fn scan_group(&mut self, open: u8, close: u8) -> Result<usize, String> {
        let mut depth = 1usize;
        while let Some(b) = self.advance() {
            match b {
                b'\\' => {
                    self.advance();
                }
                b if b == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.pos);
                    }
                }
                b if b == open => depth += 1,
                _ => {}
            }
        }
        Err(match close {
            b'}' => "missing close-brace".to_owned(),
            b']' => "missing close-bracket".to_owned(),
            b')' => "missing )".to_owned(),
            _ => "missing \"".to_owned(),
        })
    }

    fn read_quoted(&mut self) -> Result<Token, String> {
        let start = self.pos;
        loop {
            match self.advance() {
                None => return Err("missing \"".to_owned()),
                Some(b'\\') => {
                    self.advance();
                }
                Some(b'[') => {
                    self.scan_group(b'[', b']')?;
                }
                Some(b'"') => return Ok(Token::Quoted(self.slice(start, self.pos - 1))),
                Some(_) => {}
            }
        }
    }

    fn read_variable(&mut self) -> Result<Token, String> {
        if self.eat(b'{') {
            let start = self.pos;
            let end = self.scan_group(b'{', b'}')?;
            return Ok(Token::Var { name: self.slice(start, end - 1), index: None });
        }
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 {
                self.pos += 1;
            } else if b == b':' && self.peek2() == Some(b':') {
                self.pos += 2;
            } else {
                break;
            }
        }
        let name = self.slice(start, self.pos);
        if name.is_empty() && self.peek() != Some(b'(') {
            return Err("invalid character \"$\"".to_owned());
        }
        let index = if self.eat(b'(') {
            let from = self.pos;
            let end = self.scan_group(b'(', b')')?;
            Some(self.slice(from, end - 1))
        } else {
            None
        };
        Ok(Token::Var { name, index })
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        Token::Ident(self.slice(start, self.pos))
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_ws();
        let start = self.pos;
        let Some(ch) = self.advance() else {
            return Ok(Token::Eof);
        };

        Ok(match ch {
            b'0'..=b'9' => self.read_number(start)?,
            b'.' if matches!(self.peek(), Some(b'0'..=b'9')) => self.read_number(start)?,
            b'"' => self.read_quoted()?,
            b'{' => {
                let end = self.scan_group(b'{', b'}')?;
                Token::Braced(self.slice(start + 1, end - 1))
            }
            b'[' => {
                let end = self.scan_group(b'[', b']')?;
                Token::Script(self.slice(start + 1, end - 1))
            }
            b'$' => self.read_variable()?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.read_ident(start),
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => {
                if self.eat(b'*') {
                    Token::Pow
                } else {
                    Token::Star
                }
            }
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'!' => {
                if self.eat(b'=') {
                    Token::Ne
                } else {
                    Token::Bang
                }
            }
            b'~' => Token::Tilde,
            b'^' => Token::Caret,
            b'&' => {
                if self.eat(b'&') {
                    Token::And
                } else {
                    Token::Ampersand
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    Token::Or
                } else {
                    Token::Pipe
                }
            }
            b'<' => {
                if self.eat(b'<') {
                    Token::ShiftLeft
                } else if self.eat(b'=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.eat(b'>') {
                    Token::ShiftRight
                } else if self.eat(b'=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'=' if self.eat(b'=') => Token::Eq,
            b'?' => Token::Question,
            b':' => Token::Colon,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            _ => {
                let c = self.text.get(start..).and_then(|s| s.chars().next()).unwrap_or('?');
                self.pos = start + c.len_utf8();
                Token::Unknown(c)
            }
        })
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = matches!(t, Token::Eof);
            tokens.push(t);
            if done {
                break;
            }
        }
        Ok(tokens)
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StrEq,
    StrNe,
    In,
    Ni,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::StrEq => "eq",
            BinOp::StrNe => "ne",
            BinOp::In => "in",
            BinOp::Ni => "ni",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Quoted(String),
    Var { name: String, index: Option<String> },
    Script(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Host-registered infix operator.
    Named(String, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, String> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            if !self.eat(&Token::Colon) {
                return Err("missing \":\" in ternary".into());
            }
            let else_ = self.parse_ternary()?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(else_)))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Self::binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_bitor()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_bitor()?;
            lhs = Self::binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_bitxor()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.parse_bitxor()?;
            lhs = Self::binary(BinOp::BitOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_bitand()?;
        while self.eat(&Token::Caret) {
            let rhs = self.parse_bitand()?;
            lhs = Self::binary(BinOp::BitXor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_membership()?;
        while self.eat(&Token::Ampersand) {
            let rhs = self.parse_membership()?;
            lhs = Self::binary(BinOp::BitAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_membership(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_string_compare()?;
        loop {
            let op = match self.peek() {
                Token::Ident(w) if w == "in" => BinOp::In,
                Token::Ident(w) if w == "ni" => BinOp::Ni,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_string_compare()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    /// `eq`, `ne`, and any other word in operator position.
    fn parse_string_compare(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_equality()?;
        loop {
            let word = match self.peek() {
                Token::Ident(w) if w != "in" && w != "ni" => w.clone(),
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_equality()?;
            lhs = match word.as_str() {
                "eq" => Self::binary(BinOp::StrEq, lhs, rhs),
                "ne" => Self::binary(BinOp::StrNe, lhs, rhs),
                _ => Expr::Named(word, Box::new(lhs), Box::new(rhs)),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_relational()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_shift()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::ShiftLeft => BinOp::Shl,
                Token::ShiftRight => BinOp::Shr,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_power()?;
            lhs = Self::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    /// Right-associative.
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_unary()?;
        if self.eat(&Token::Pow) {
            let exponent = self.parse_power()?;
            return Ok(Self::binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Plus,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            _ => return self.parse_primary(),
        };
        self.pos += 1;
        Ok(Expr::Unary(op, Box::new(self.parse_unary()?)))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let tok = self.advance();
        match tok {
            Token::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Braced(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Quoted(s) if !s.contains(['$', '[', '\\']) => Ok(Expr::Literal(Value::Str(s))),
            Token::Quoted(s) => Ok(Expr::Quoted(s)),
            Token::Var { name, index } => Ok(Expr::Var { name, index }),
            Token::Script(s) => Ok(Expr::Script(s)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != &Token::RParen {
                        args.push(self.parse_expr()?);
                        while self.eat(&Token::Comma) {
                            args.push(self.parse_expr()?);
                        }
                    }
                    if !self.eat(&Token::RParen) {
                        return Err(format!("missing close parenthesis after arguments to \"{name}\""));
                    }
                    Ok(Expr::Call(name, args))
                } else if Value::from(name.as_str()).to_bool().is_some() {
                    Ok(Expr::Literal(Value::Str(name)))
                } else {
                    Err(format!("invalid bareword \"{name}\""))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err("missing close parenthesis".into());
                }
                Ok(inner)
            }
            Token::Eof => Err("premature end of expression".into()),
            other => Err(format!("unexpected \"{}\"", other.describe())),
        }
    }
}

/// Parse an expression string into an AST.
pub fn parse_expr(src: &str) -> Result<Expr, String> {
    if src.trim().is_empty() {
        return Err("empty expression".into());
    }
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        extra => Err(format!("extra tokens at end of expression: \"{}\"", extra.describe())),
    }
}

fn syntax_error(src: &str, detail: &str) -> Flow {
    Flow::error_with_code(format!("syntax error in expression \"{src}\": {detail}"), "TCL PARSE EXPR")
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Parsed expressions keyed by source text.  When full, the cache is
/// emptied before the next insert.
#[derive(Debug)]
pub struct ExprCache {
    entries: RwLock<HashMap<String, Arc<Expr>>>,
    capacity: AtomicUsize,
}

impl ExprCache {
    pub fn new(capacity: usize) -> Self {
        ExprCache { entries: RwLock::new(HashMap::new()), capacity: AtomicUsize::new(capacity) }
    }

    pub fn get_or_parse(&self, src: &str) -> Result<Arc<Expr>, String> {
        if let Some(hit) = read(&self.entries).get(src) {
            return Ok(Arc::clone(hit));
        }
        let parsed = Arc::new(parse_expr(src)?);
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity > 0 {
            let mut entries = write(&self.entries);
            if entries.len() >= capacity {
                entries.clear();
            }
            entries.insert(src.to_owned(), Arc::clone(&parsed));
        }
        Ok(parsed)
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        write(&self.entries).clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut entries = write(&self.entries);
        if entries.len() > capacity {
            entries.clear();
        }
    }
}

// ── Interpreter host ──────────────────────────────────────────────────────────

pub struct InterpHost<'a> {
    pub interp: &'a Interpreter,
    pub ctx: &'a EvalContext,
}

impl ExprHost for InterpHost<'_> {
    fn variable(&self, name: &str, index: Option<&str>) -> EvalResult {
        events::check_events(self.interp, self.ctx)?;
        Ok(self.interp.get_variable(name, index)?)
    }

    fn script(&self, script: &str) -> EvalResult {
        events::check_events(self.interp, self.ctx)?;
        eval::evaluate_text(self.interp, script, &self.ctx.child_for(ChildScope::Nested))
    }

    fn substitute(&self, text: &str) -> EvalResult {
        let mut state = ParseState::new(text);
        subst::substitute_state(self.interp, &mut state, &self.ctx.child_for(ChildScope::Nested))
    }

    fn function(&self, name: &str, args: &[Value]) -> EvalResult {
        let Some(entity) = self.interp.registry().function(name) else {
            return Err(Flow::error(format!("unknown math function \"{name}\"")));
        };
        let mut call = Vec::with_capacity(args.len() + 1);
        call.push(Value::from(name));
        call.extend_from_slice(args);
        dispatch::execute(self.interp, name, &entity, &call, self.ctx)
    }

    fn operator(&self, name: &str, lhs: Value, rhs: Value) -> EvalResult {
        let Some(entity) = self.interp.registry().operator(name) else {
            return Err(Flow::error(format!("unknown operator \"{name}\"")));
        };
        dispatch::execute(self.interp, name, &entity, &[Value::from(name), lhs, rhs], self.ctx)
    }
}

/// Evaluate `source` as an expression in `interp`.
pub fn evaluate(interp: &Interpreter, source: &str, ctx: &EvalContext) -> EvalResult {
    let expr = if ctx.caches_expressions() {
        interp.expr_cache().get_or_parse(source)
    } else {
        parse_expr(source).map(Arc::new)
    }
    .map_err(|detail| syntax_error(source, &detail))?;

    if ctx.hits_breakpoints() && interp.has_debugger() {
        hook::breakpoint(interp, &BreakpointContext::new(BreakpointType::Expression).with_text(source))?;
    }
    let value = eval_expr(&expr, &InterpHost { interp, ctx })?;
    if ctx.wants_boolean() {
        return Ok(Value::from(truth(&value)?));
    }
    Ok(value)
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Evaluate an [`Expr`] AST node against `host`.
pub fn eval_expr(expr: &Expr, host: &dyn ExprHost) -> EvalResult {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Quoted(s) => host.substitute(s),
        Expr::Var { name, index } => {
            let index = match index {
                Some(i) => Some(host.substitute(i)?.into_string()),
                None => None,
            };
            host.variable(name, index.as_deref())
        }
        Expr::Script(s) => host.script(s),

        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, host)?;
            eval_unary(*op, &v)
        }

        Expr::Binary(op, lhs, rhs) => {
            match op {
                BinOp::And => {
                    let l = eval_expr(lhs, host)?;
                    if !truth(&l)? {
                        return Ok(Value::Int(0));
                    }
                    let r = eval_expr(rhs, host)?;
                    return Ok(Value::Int(truth(&r)? as i64));
                }
                BinOp::Or => {
                    let l = eval_expr(lhs, host)?;
                    if truth(&l)? {
                        return Ok(Value::Int(1));
                    }
                    let r = eval_expr(rhs, host)?;
                    return Ok(Value::Int(truth(&r)? as i64));
                }
                _ => {}
            }
            let l = eval_expr(lhs, host)?;
            let r = eval_expr(rhs, host)?;
            eval_binop(*op, &l, &r)
        }

        Expr::Named(name, lhs, rhs) => {
            let l = eval_expr(lhs, host)?;
            let r = eval_expr(rhs, host)?;
            host.operator(name, l, r)
        }

        Expr::Ternary(cond, then, else_) => {
            if truth(&eval_expr(cond, host)?)? {
                eval_expr(then, host)
            } else {
                eval_expr(else_, host)
            }
        }

        Expr::Call(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for ae in arg_exprs {
                args.push(eval_expr(ae, host)?);
            }
            host.function(name, &args)
        }
    }
}

fn truth(v: &Value) -> Result<bool, Flow> {
    v.to_bool().ok_or_else(|| Flow::error(format!("expected boolean value but got \"{v}\"")))
}

fn number(v: &Value, op: &str) -> Result<Number, Flow> {
    v.to_number().ok_or_else(|| {
        let what = if v.to_string().is_empty() { "empty string" } else { "non-numeric string" };
        Flow::error(format!("can't use {what} as operand of \"{op}\""))
    })
}

fn integer(v: &Value, op: &str) -> Result<i64, Flow> {
    match number(v, op)? {
        Number::Int(n) => Ok(n),
        Number::Float(_) => Err(Flow::error(format!("can't use floating-point value as operand of \"{op}\""))),
    }
}

fn divide_by_zero() -> Flow {
    Flow::error_with_code("divide by zero", "ARITH DIVZERO {divide by zero}")
}

fn eval_unary(op: UnaryOp, v: &Value) -> EvalResult {
    match op {
        UnaryOp::Neg => Ok(match number(v, "-")? {
            Number::Int(n) => Value::Int(n.wrapping_neg()),
            Number::Float(x) => Value::Float(-x),
        }),
        UnaryOp::Plus => Ok(Value::from(number(v, "+")?)),
        UnaryOp::Not => Ok(Value::Int(!truth(v)? as i64)),
        UnaryOp::BitNot => Ok(Value::Int(!integer(v, "~")?)),
    }
}

fn eval_binop(op: BinOp, l: &Value, r: &Value) -> EvalResult {
    use std::cmp::Ordering as Cmp;
    let sym = op.symbol();
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem | BinOp::Pow => {
            arith(op, number(l, sym)?, number(r, sym)?)
        }

        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(l, r);
            let hit = match op {
                BinOp::Eq => ord == Cmp::Equal,
                BinOp::Ne => ord != Cmp::Equal,
                BinOp::Lt => ord == Cmp::Less,
                BinOp::Le => ord != Cmp::Greater,
                BinOp::Gt => ord == Cmp::Greater,
                _ => ord != Cmp::Less,
            };
            Ok(Value::Int(hit as i64))
        }
        BinOp::StrEq => Ok(Value::Int((l.to_string() == r.to_string()) as i64)),
        BinOp::StrNe => Ok(Value::Int((l.to_string() != r.to_string()) as i64)),
        BinOp::In | BinOp::Ni => {
            let needle = l.to_string();
            let found = split_list(&r.to_string()).map_err(Flow::error)?.contains(&needle);
            Ok(Value::Int((found == (op == BinOp::In)) as i64))
        }

        BinOp::BitAnd => Ok(Value::Int(integer(l, sym)? & integer(r, sym)?)),
        BinOp::BitOr => Ok(Value::Int(integer(l, sym)? | integer(r, sym)?)),
        BinOp::BitXor => Ok(Value::Int(integer(l, sym)? ^ integer(r, sym)?)),
        BinOp::Shl | BinOp::Shr => {
            let (x, by) = (integer(l, sym)?, integer(r, sym)?);
            if by < 0 {
                return Err(Flow::error("negative shift argument"));
            }
            let by = u32::try_from(by).unwrap_or(u32::MAX);
            Ok(Value::Int(match op {
                BinOp::Shl => x.checked_shl(by).unwrap_or(0),
                _ => x.checked_shr(by).unwrap_or(if x < 0 { -1 } else { 0 }),
            }))
        }

        // Short-circuit forms are handled before operand evaluation.
        BinOp::And => Ok(Value::Int((truth(l)? && truth(r)?) as i64)),
        BinOp::Or => Ok(Value::Int((truth(l)? || truth(r)?) as i64)),
    }
}

/// Numeric comparison when both sides are numbers, string comparison otherwise.
fn compare(l: &Value, r: &Value) -> std::cmp::Ordering {
    match (l.to_number(), r.to_number()) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => a.cmp(&b),
        (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(std::cmp::Ordering::Equal),
        _ => l.to_string().cmp(&r.to_string()),
    }
}

fn arith(op: BinOp, a: Number, b: Number) -> EvalResult {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => int_arith(op, x, y),
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            Ok(Value::Float(match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div if y == 0.0 => return Err(divide_by_zero()),
                BinOp::Div => x / y,
                BinOp::Pow => x.powf(y),
                _ => {
                    return Err(Flow::error(format!(
                        "can't use floating-point value as operand of \"{}\"",
                        op.symbol()
                    )))
                }
            }))
        }
    }
}

fn int_arith(op: BinOp, x: i64, y: i64) -> EvalResult {
    Ok(Value::Int(match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Div | BinOp::Rem if y == 0 => return Err(divide_by_zero()),
        // Quotients round toward negative infinity; remainders take the
        // divisor's sign.
        BinOp::Div => {
            let q = x.wrapping_div(y);
            if x.wrapping_rem(y) != 0 && ((x < 0) != (y < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Rem => {
            let r = x.wrapping_rem(y);
            if r != 0 && ((r < 0) != (y < 0)) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if y < 0 {
                return match x {
                    0 => Err(Flow::error("exponentiation of zero by negative power")),
                    1 => Ok(Value::Int(1)),
                    -1 => Ok(Value::Int(if y % 2 == 0 { 1 } else { -1 })),
                    _ => Ok(Value::Int(0)),
                };
            }
            match u32::try_from(y).ok().and_then(|e| x.checked_pow(e)) {
                Some(n) => n,
                None => return Ok(Value::Float((x as f64).powf(y as f64))),
            }
        }
        _ => return Err(Flow::error(format!("unsupported arithmetic operator \"{}\"", op.symbol()))),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestHost {
        vars: HashMap<String, Value>,
    }

    impl TestHost {
        fn with(mut self, name: &str, v: Value) -> Self {
            self.vars.insert(name.to_owned(), v);
            self
        }
    }

    impl ExprHost for TestHost {
        fn variable(&self, name: &str, index: Option<&str>) -> EvalResult {
            let key = match index {
                Some(i) => format!("{name}({i})"),
                None => name.to_owned(),
            };
            self.vars
                .get(&key)
                .cloned()
                .ok_or_else(|| Flow::error(format!("can't read \"{key}\": no such variable")))
        }

        fn script(&self, script: &str) -> EvalResult {
            Ok(Value::from(format!("<{script}>")))
        }

        fn substitute(&self, text: &str) -> EvalResult {
            Ok(Value::from(text.replace("$x", "X")))
        }

        fn function(&self, name: &str, args: &[Value]) -> EvalResult {
            match name {
                "twice" => Ok(Value::Int(args[0].to_int().unwrap() * 2)),
                _ => Err(Flow::error(format!("unknown math function \"{name}\""))),
            }
        }

        fn operator(&self, name: &str, lhs: Value, rhs: Value) -> EvalResult {
            Ok(Value::from(format!("{lhs}{name}{rhs}")))
        }
    }

    fn eval_with(src: &str, host: &TestHost) -> EvalResult {
        eval_expr(&parse_expr(src).map_err(Flow::error)?, host)
    }

    fn eval(src: &str) -> Value {
        eval_with(src, &TestHost::default()).unwrap()
    }

    fn eval_err(src: &str) -> String {
        match parse_expr(src) {
            Err(e) => e,
            Ok(e) => eval_expr(&e, &TestHost::default()).unwrap_err().to_string(),
        }
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(eval("1 + 2"), Value::Int(3));
        assert_eq!(eval("10 - 3"), Value::Int(7));
        assert_eq!(eval("4 * 5"), Value::Int(20));
        assert_eq!(eval("10 / 3"), Value::Int(3));
        assert_eq!(eval("10 % 3"), Value::Int(1));
    }

    #[test]
    fn division_rounds_down() {
        assert_eq!(eval("-7 / 2"), Value::Int(-4));
        assert_eq!(eval("-7 % 2"), Value::Int(1));
        assert_eq!(eval("7 % -2"), Value::Int(-1));
        assert_eq!(eval_err("1 / 0"), "divide by zero");
    }

    #[test]
    fn float_arithmetic() {
        assert_eq!(eval("1.5 + 1"), Value::Float(2.5));
        assert_eq!(eval(".5 * 2"), Value::Float(1.0));
        assert_eq!(eval("1e2"), Value::Float(100.0));
        assert!(eval_err("1.5 % 2").contains("floating-point"));
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(eval("2 ** 3 ** 2"), Value::Int(512));
        assert_eq!(eval("2 ** -1"), Value::Int(0));
        assert_eq!(eval("-2 ** 2"), Value::Int(4));
    }

    #[test]
    fn precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Int(14));
        assert_eq!(eval("(2 + 3) * 4"), Value::Int(20));
        assert_eq!(eval("1 | 2 == 2"), Value::Int(1));
        assert_eq!(eval("1 + 1 << 2"), Value::Int(8));
    }

    #[test]
    fn comparison_is_numeric_or_string() {
        assert_eq!(eval("3 == 3.0"), Value::Int(1));
        assert_eq!(eval("10 > 9"), Value::Int(1));
        assert_eq!(eval("{abc} < {abd}"), Value::Int(1));
        assert_eq!(eval("{1} eq {1.0}"), Value::Int(0));
        assert_eq!(eval("{a} ne {b}"), Value::Int(1));
    }

    #[test]
    fn membership() {
        assert_eq!(eval("{b} in {a b c}"), Value::Int(1));
        assert_eq!(eval("{z} ni {a b c}"), Value::Int(1));
    }

    #[test]
    fn logic_short_circuits() {
        assert_eq!(eval("0 && [boom]"), Value::Int(0));
        assert_eq!(eval("1 || $missing"), Value::Int(1));
        assert_eq!(eval("!0"), Value::Int(1));
        assert_eq!(eval("true && yes"), Value::Int(1));
        assert!(eval_err("{x} && 1").contains("expected boolean value"));
    }

    #[test]
    fn ternary() {
        assert_eq!(eval("1 ? 10 : 20"), Value::Int(10));
        assert_eq!(eval("0 ? 10 : 0 ? 20 : 30"), Value::Int(30));
    }

    #[test]
    fn operands_go_through_the_host() {
        let host = TestHost::default().with("n", Value::Int(7)).with("a(k)", Value::Int(2));
        assert_eq!(eval_with("$n + 1", &host).unwrap(), Value::Int(8));
        assert_eq!(eval_with("$a(k) * ${n}", &host).unwrap(), Value::Int(14));
        assert_eq!(eval_with("[cmd x]", &host).unwrap().to_string(), "<cmd x>");
        assert_eq!(eval_with("\"v=$x\"", &host).unwrap().to_string(), "v=X");
        assert_eq!(eval_with("twice(21)", &host).unwrap(), Value::Int(42));
        assert_eq!(eval_with("1 join 2", &host).unwrap().to_string(), "1join2");
    }

    #[test]
    fn bitwise() {
        assert_eq!(eval("5 & 3"), Value::Int(1));
        assert_eq!(eval("5 | 2"), Value::Int(7));
        assert_eq!(eval("5 ^ 3"), Value::Int(6));
        assert_eq!(eval("~0"), Value::Int(-1));
        assert_eq!(eval("1 << 3"), Value::Int(8));
        assert_eq!(eval("-8 >> 70"), Value::Int(-1));
        assert_eq!(eval("0xff"), Value::Int(255));
    }

    #[test]
    fn operand_errors() {
        assert_eq!(eval_err("{a} + 1"), "can't use non-numeric string as operand of \"+\"");
        assert_eq!(eval_err("{} * 2"), "can't use empty string as operand of \"*\"");
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(eval_err("1 +"), "premature end of expression");
        assert_eq!(eval_err(""), "empty expression");
        assert!(eval_err("1 2").starts_with("extra tokens"));
        assert!(eval_err("foo").contains("invalid bareword"));
        assert_eq!(eval_err("[unclosed"), "missing close-bracket");
        assert_eq!(eval_err("1 + @"), "unexpected \"@\"");
        assert!(eval_err("1 @ 2").starts_with("extra tokens"));
    }

    #[test]
    fn cache_reuses_and_evicts() {
        let cache = ExprCache::new(2);
        let a = cache.get_or_parse("1 + 1").unwrap();
        let b = cache.get_or_parse("1 + 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        cache.get_or_parse("2").unwrap();
        assert_eq!(cache.len(), 2);
        cache.get_or_parse("3").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get_or_parse("1 +").is_err());
    }
}
