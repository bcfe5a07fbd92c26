//! Engine configuration.
//!
//! [`EngineConfig`] holds the per-interpreter settings and can be loaded
//! from a line-oriented `engine.conf`:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `key = value` | set a field |
//! | `; ...` or `# ...` | comment, ignored |
//! | blank | ignored |
//!
//! Unknown keys and malformed values are reported as [`ConfigError`]s but
//! do not stop the rest of the file from loading.
//!
//! [`RuntimeConfig`] is the process-wide counterpart: a single value behind
//! a mutex, read with [`runtime_config`] and replaced with
//! [`set_runtime_config`].

use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crate::error::EngineError;

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Deepest script nesting allowed before `stack overflow`.
    pub max_levels: usize,
    /// Native stack bytes an evaluation chain may use; 0 disables the check.
    pub stack_limit: usize,
    /// Largest substitution result in bytes; `None` is unlimited.
    pub max_result_size: Option<usize>,
    /// Safe interpreters consult the policy for hidden entities.
    pub safe: bool,
    pub history: bool,
    pub history_size: usize,
    /// Record wall time per entity.
    pub profile: bool,
    /// Resolve unique command-name prefixes.
    pub inexact_commands: bool,
    /// Cancel an outermost evaluation that runs longer than this.
    pub script_timeout: Option<Duration>,
    /// Report `break`/`continue` escaping the outermost evaluation as ok.
    pub reset_return_code: bool,
    /// Run every outermost evaluation at global scope.
    pub evaluate_global: bool,
    pub expr_cache_capacity: usize,
    /// `catch` clears a pending (non-unwinding) cancel.
    pub catch_resets_cancel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_levels: 1000,
            stack_limit: 1024 * 1024,
            max_result_size: None,
            safe: false,
            history: true,
            history_size: 100,
            profile: false,
            inexact_commands: false,
            script_timeout: None,
            reset_return_code: false,
            evaluate_global: false,
            expr_cache_capacity: 256,
            catch_resets_cancel: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config string on top of the defaults.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = EngineConfig::default();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                errors.push(ConfigError { line: i + 1, message: format!("expected key = value: {line}") });
                continue;
            };
            if let Err(message) = config.apply(key.trim(), value.trim()) {
                errors.push(ConfigError { line: i + 1, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file.
    pub fn load_file(path: &Path) -> Result<(Self, Vec<ConfigError>), EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| EngineError::Io { path: path.display().to_string(), source })?;
        Ok(Self::load_str(&text))
    }

    /// Set one field by name.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "max_levels" => self.max_levels = parse_usize(key, value)?,
            "stack_limit" => self.stack_limit = parse_usize(key, value)?,
            "max_result_size" => {
                self.max_result_size = match parse_usize(key, value)? {
                    0 => None,
                    n => Some(n),
                }
            }
            "safe" => self.safe = parse_bool(key, value)?,
            "history" => self.history = parse_bool(key, value)?,
            "history_size" => self.history_size = parse_usize(key, value)?,
            "profile" => self.profile = parse_bool(key, value)?,
            "inexact_commands" => self.inexact_commands = parse_bool(key, value)?,
            "script_timeout" => {
                self.script_timeout = match parse_usize(key, value)? {
                    0 => None,
                    ms => Some(Duration::from_millis(ms as u64)),
                }
            }
            "reset_return_code" => self.reset_return_code = parse_bool(key, value)?,
            "evaluate_global" => self.evaluate_global = parse_bool(key, value)?,
            "expr_cache_capacity" => self.expr_cache_capacity = parse_usize(key, value)?,
            "catch_resets_cancel" => self.catch_resets_cancel = parse_bool(key, value)?,
            _ => return Err(format!("unknown setting: {key}")),
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, String> {
    value.parse().map_err(|_| format!("{key}: expected a non-negative integer, got \"{value}\""))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("{key}: expected a boolean, got \"{value}\"")),
    }
}

// ── RuntimeConfig ─────────────────────────────────────────────────────────────

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack bytes kept free below the per-interpreter limit.
    pub extra_stack_reserve: usize,
    /// Stack size of threads spawned for background evaluation.
    pub background_stack_size: usize,
    /// Log panics raised inside observer hooks.
    pub log_hook_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            extra_stack_reserve: 64 * 1024,
            background_stack_size: 16 * 1024 * 1024,
            log_hook_panics: true,
        }
    }
}

fn runtime_slot() -> &'static Mutex<RuntimeConfig> {
    static SLOT: OnceLock<Mutex<RuntimeConfig>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(RuntimeConfig::default()))
}

/// Snapshot of the current process-wide settings.
pub fn runtime_config() -> RuntimeConfig {
    runtime_slot().lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Replace the process-wide settings, returning the previous ones.
pub fn set_runtime_config(config: RuntimeConfig) -> RuntimeConfig {
    let mut slot = runtime_slot().lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, config)
}

/// Restore the process-wide defaults.
pub fn reset_runtime_config() {
    set_runtime_config(RuntimeConfig::default());
}
