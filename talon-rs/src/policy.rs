//! Execution policy for safe interpreters.
//!
//! A [`Policy`] is consulted before hidden commands, sub-commands and
//! procedures run in a safe interpreter, and before script sources are
//! read.  [`RegexPolicy`] decides from regex allow and deny lists.

use regex::Regex;

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyDecision {
    /// No policy was consulted.
    #[default]
    None,
    Denied,
    /// The policy had no opinion.
    Undecided,
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Command,
    SubCommand,
    Procedure,
    Script,
    File,
    Stream,
}

impl PolicyKind {
    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Command => "command",
            PolicyKind::SubCommand => "subcommand",
            PolicyKind::Procedure => "procedure",
            PolicyKind::Script => "script",
            PolicyKind::File => "file",
            PolicyKind::Stream => "stream",
        }
    }
}

/// What the policy is asked about.
#[derive(Debug, Clone, Copy)]
pub struct PolicySubject<'a> {
    pub kind: PolicyKind,
    /// Entity name, or the file name for reads.
    pub name: &'a str,
    pub hidden: bool,
}

pub trait Policy: Send + Sync {
    fn check(&self, subject: &PolicySubject<'_>) -> PolicyDecision;
}

/// Regex allow/deny lists.  A deny match wins over an allow match; a
/// subject matching neither is undecided.
#[derive(Debug, Clone, Default)]
pub struct RegexPolicy {
    allow: Vec<(Option<PolicyKind>, Regex)>,
    deny: Vec<(Option<PolicyKind>, Regex)>,
}

impl RegexPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve names matching `pattern`, for `kind` or (with `None`) any kind.
    pub fn allow(mut self, kind: Option<PolicyKind>, pattern: &str) -> Result<Self, regex::Error> {
        self.allow.push((kind, Regex::new(pattern)?));
        Ok(self)
    }

    pub fn deny(mut self, kind: Option<PolicyKind>, pattern: &str) -> Result<Self, regex::Error> {
        self.deny.push((kind, Regex::new(pattern)?));
        Ok(self)
    }

    fn matches(list: &[(Option<PolicyKind>, Regex)], subject: &PolicySubject<'_>) -> bool {
        list.iter()
            .any(|(kind, re)| kind.map_or(true, |k| k == subject.kind) && re.is_match(subject.name))
    }
}

impl Policy for RegexPolicy {
    fn check(&self, subject: &PolicySubject<'_>) -> PolicyDecision {
        if Self::matches(&self.deny, subject) {
            PolicyDecision::Denied
        } else if Self::matches(&self.allow, subject) {
            PolicyDecision::Approved
        } else {
            PolicyDecision::Undecided
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(kind: PolicyKind, name: &str) -> PolicySubject<'_> {
        PolicySubject { kind, name, hidden: false }
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = RegexPolicy::new()
            .allow(None, "^file")
            .unwrap()
            .deny(Some(PolicyKind::Command), "^file delete$")
            .unwrap();
        assert_eq!(p.check(&subject(PolicyKind::Command, "file")), PolicyDecision::Approved);
        assert_eq!(p.check(&subject(PolicyKind::Command, "file delete")), PolicyDecision::Denied);
        assert_eq!(p.check(&subject(PolicyKind::SubCommand, "file delete")), PolicyDecision::Approved);
        assert_eq!(p.check(&subject(PolicyKind::Command, "exec")), PolicyDecision::Undecided);
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(RegexPolicy::new().deny(None, "(").is_err());
    }
}
