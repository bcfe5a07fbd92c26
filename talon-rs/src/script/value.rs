//! Runtime value type for talon scripts.
//!
//! Every value is a string at heart; numbers are kept in their parsed form
//! when they were produced by arithmetic so that repeated expression
//! evaluation does not re-parse them.  Lists are plain strings too, split
//! and joined with Tcl quoting rules by [`split_list`] and [`merge_list`].

use std::fmt;

/// A script runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A numeric operand after coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(x) => x,
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Value::Int(i),
            Number::Float(x) => Value::Float(x),
        }
    }
}

impl Value {
    pub fn empty() -> Self {
        Value::default()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Str(s) if s.is_empty())
    }

    /// Borrow the string form when the value already is a string.
    pub fn as_str_ref(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Length of the string representation in bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            other => other.to_string().len(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Value::Str(s) => s,
            other => other.to_string(),
        }
    }

    /// Parse the value as a number (`0x` hex, decimal, or float).
    pub fn to_number(&self) -> Option<Number> {
        match self {
            Value::Int(n) => Some(Number::Int(*n)),
            Value::Float(x) => Some(Number::Float(*x)),
            Value::Str(s) => parse_number(s),
        }
    }

    /// Coerce to boolean the way conditions do: numbers are true when
    /// non-zero, and the words `true/false`, `yes/no`, `on/off` are accepted.
    pub fn to_bool(&self) -> Option<bool> {
        if let Some(n) = self.to_number() {
            return Some(n.as_f64() != 0.0);
        }
        let s = self.to_string();
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Some(true),
            "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Integer coercion used by commands such as `incr`.
    pub fn to_int(&self) -> Option<i64> {
        match self.to_number()? {
            Number::Int(n) => Some(n),
            Number::Float(_) => None,
        }
    }

    /// Name of the type, as reported in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "real",
            Value::Str(_) => "string",
        }
    }
}

/// Parse `s` as an integer or float, ignoring surrounding whitespace.
pub fn parse_number(s: &str) -> Option<Number> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (neg, digits) = match t.as_bytes()[0] {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let n = i64::from_str_radix(hex, 16).ok()?;
        return Some(Number::Int(if neg { -n } else { n }));
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Number::Int(n));
    }
    // Reject words like "inf" and "nan" that Rust's float parser accepts.
    if !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    t.parse::<f64>().ok().map(Number::Float)
}

// ── Lists ─────────────────────────────────────────────────────────────────────

/// Split a string into list elements.
///
/// Elements are separated by whitespace; `{...}` groups (with nesting) and
/// `"..."` groups form single elements, and backslashes escape the next
/// character outside braces.
pub fn split_list(s: &str) -> Result<Vec<String>, String> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        match bytes[i] {
            b'{' => {
                let mut depth = 1usize;
                let start = i + 1;
                i += 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'\\' => i += 1,
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                if depth > 0 {
                    return Err("unmatched open brace in list".into());
                }
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err("list element in braces followed by non-whitespace".into());
                }
                out.push(s[start..i - 1].to_owned());
            }
            b'"' => {
                let mut elem = String::new();
                i += 1;
                let mut closed = false;
                while i < bytes.len() {
                    match bytes[i] {
                        b'"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        b'\\' if i + 1 < bytes.len() => {
                            let (decoded, used) = super::parser::decode_backslash(&s[i..]);
                            elem.push_str(&decoded);
                            i += used;
                        }
                        _ => {
                            let ch = s[i..].chars().next().unwrap_or_default();
                            elem.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                if !closed {
                    return Err("unmatched open quote in list".into());
                }
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err("list element in quotes followed by non-whitespace".into());
                }
                out.push(elem);
            }
            _ => {
                let mut elem = String::new();
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        let (decoded, used) = super::parser::decode_backslash(&s[i..]);
                        elem.push_str(&decoded);
                        i += used;
                    } else {
                        let ch = s[i..].chars().next().unwrap_or_default();
                        elem.push(ch);
                        i += ch.len_utf8();
                    }
                }
                out.push(elem);
            }
        }
    }
    Ok(out)
}

/// Join elements into a well-formed list, bracing elements that need it.
pub fn merge_list<S: AsRef<str>>(elements: &[S]) -> String {
    let mut out = String::new();
    for (i, e) in elements.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&quote_element(e.as_ref()));
    }
    out
}

fn quote_element(e: &str) -> String {
    if e.is_empty() {
        return "{}".to_owned();
    }
    let needs = e
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\'));
    if !needs {
        return e.to_owned();
    }
    let balanced = {
        let mut depth = 0i64;
        let mut ok = true;
        let mut chars = e.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        ok = false;
                    }
                }
                _ => {}
            }
        }
        ok && depth == 0 && !e.ends_with('\\')
    };
    if balanced {
        format!("{{{e}}}")
    } else {
        let mut out = String::with_capacity(e.len() + 8);
        for c in e.chars() {
            if matches!(c, '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\' | ' ') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(if b { 1 } else { 0 })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_float() {
        assert_eq!(Value::Float(3.14).to_string(), "3.14");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn booleans() {
        assert_eq!(Value::Int(1).to_bool(), Some(true));
        assert_eq!(Value::from("0").to_bool(), Some(false));
        assert_eq!(Value::from("yes").to_bool(), Some(true));
        assert_eq!(Value::from("Off").to_bool(), Some(false));
        assert_eq!(Value::from("maybe").to_bool(), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("42"), Some(Number::Int(42)));
        assert_eq!(parse_number(" -0x10 "), Some(Number::Int(-16)));
        assert_eq!(parse_number("2.5"), Some(Number::Float(2.5)));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn split_plain_and_braced() {
        assert_eq!(split_list("a b  c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_list("a {b c} {}").unwrap(), vec!["a", "b c", ""]);
        assert_eq!(split_list("{x {y z}}").unwrap(), vec!["x {y z}"]);
        assert_eq!(split_list("\"q r\" s").unwrap(), vec!["q r", "s"]);
    }

    #[test]
    fn split_errors() {
        assert!(split_list("{a b").is_err());
        assert!(split_list("\"a b").is_err());
        assert!(split_list("{a}b").is_err());
    }

    #[test]
    fn merge_quotes_when_needed() {
        assert_eq!(merge_list(&["a", "b c", ""]), "a {b c} {}");
        assert_eq!(merge_list(&["x}"]), "x\\}");
        let elems = vec!["p q".to_owned(), "[r]".to_owned()];
        assert_eq!(split_list(&merge_list(&elems)).unwrap(), elems);
    }
}
