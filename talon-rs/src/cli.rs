//! Command-line argument parsing and the driver behind the `talon` binary.
//!
//! Usage:
//!   talon [-d] [-s] [-c<script>] [-f<config>] [<file>...]

use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::script::{Flow, Interpreter};

pub const USAGE: &str = "Usage: talon [-d] [-s] [-c<script>] [-f<config>] [<file>...]";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    /// Debug logging (`-d`).
    pub debug: bool,
    /// Safe mode: policy checks on file reads (`-s`).
    pub safe: bool,
    /// Script to evaluate after the files (`-c<script>`).
    pub command: Option<String>,
    /// Config file override (`-f<config>`).
    pub config: Option<PathBuf>,
    /// Script files, evaluated in order.
    pub files: Vec<PathBuf>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or(&[]))
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        if arg == "--" {
            args.files.extend(argv[i + 1..].iter().map(PathBuf::from));
            break;
        }

        if !arg.starts_with('-') || arg == "-" {
            args.files.push(PathBuf::from(arg));
            i += 1;
            continue;
        }

        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'd' => args.debug = true,
                's' => args.safe = true,

                // -c<script> and -f<config> take the rest of the word or the
                // next argument.
                flag @ ('c' | 'f') => {
                    let value = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err(format!("-{flag} requires an argument"));
                    };
                    if flag == 'c' {
                        args.command = Some(value);
                    } else {
                        args.config = Some(PathBuf::from(value));
                    }
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    Ok(args)
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "talon")
}

/// `engine.conf` in the user's config directory, if one exists.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("engine.conf")).filter(|p| p.exists())
}

/// `init.tcl` in the user's config directory, if one exists.
pub fn init_script_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("init.tcl")).filter(|p| p.exists())
}

/// Load the engine config: an explicit `-f` file must be readable, the
/// default one is optional.  Per-line problems are logged and skipped.
pub fn load_config(args: &CliArgs) -> Result<EngineConfig, String> {
    let path = match &args.config {
        Some(p) => Some(p.clone()),
        None => default_config_path(),
    };
    let mut config = match path {
        Some(path) => {
            let (config, errors) = EngineConfig::load_file(&path).map_err(|e| e.to_string())?;
            for e in &errors {
                warn!(path = %path.display(), error = %e, "ignoring config line");
            }
            config
        }
        None => EngineConfig::default(),
    };
    if args.safe {
        config.safe = true;
    }
    Ok(config)
}

// ── Driver ────────────────────────────────────────────────────────────────────

fn report(err: &mut impl Write, interp: &Interpreter, flow: &Flow) {
    let info = flow
        .as_error()
        .and_then(|e| e.error_info.clone())
        .or_else(|| interp.error_info())
        .unwrap_or_else(|| flow.to_string());
    let _ = writeln!(err, "{info}");
}

fn flush_output(out: &mut impl Write, interp: &Interpreter) {
    let text = interp.take_output();
    if !text.is_empty() {
        let _ = out.write_all(text.as_bytes());
    }
}

/// Evaluate `init` (when given), then each file, then the `-c` script.
/// Returns the process exit status.
pub fn run(
    args: &CliArgs,
    config: EngineConfig,
    init: Option<&Path>,
    out: &mut impl Write,
    err: &mut impl Write,
) -> i32 {
    let interp = Interpreter::with_config(config);

    let mut last = None;
    let sources = init.into_iter().map(Path::to_path_buf).chain(args.files.iter().cloned());
    for path in sources {
        debug!(path = %path.display(), "evaluating file");
        let result = interp.evaluate_file(&path);
        flush_output(out, &interp);
        match result {
            Ok(v) => last = Some(v),
            Err(flow) => {
                report(err, &interp, &flow);
                return 1;
            }
        }
        if let Some(code) = interp.exit_code() {
            return code;
        }
    }

    if let Some(script) = &args.command {
        let result = interp.evaluate_script(script);
        flush_output(out, &interp);
        match result {
            Ok(v) => last = Some(v),
            Err(flow) => {
                report(err, &interp, &flow);
                return 1;
            }
        }
        if let Some(code) = interp.exit_code() {
            return code;
        }
    }

    if let Some(v) = last.filter(|v| !v.is_empty()) {
        let _ = writeln!(out, "{v}");
    }
    0
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    fn run_args(args: &CliArgs) -> (i32, String, String) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = run(args, EngineConfig::default(), None, &mut out, &mut err);
        (code, String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    #[test]
    fn empty_args() {
        assert_eq!(parse_argv(&argv(&[])).unwrap(), CliArgs::default());
    }

    #[test]
    fn combined_bool_flags() {
        let a = parse_argv(&argv(&["-ds"])).unwrap();
        assert!(a.debug && a.safe);
    }

    #[test]
    fn command_embedded_and_separate() {
        let a = parse_argv(&argv(&["-cputs hi"])).unwrap();
        assert_eq!(a.command.as_deref(), Some("puts hi"));
        let a = parse_argv(&argv(&["-c", "set x 1", "a.tcl"])).unwrap();
        assert_eq!(a.command.as_deref(), Some("set x 1"));
        assert_eq!(a.files, vec![PathBuf::from("a.tcl")]);
    }

    #[test]
    fn config_flag() {
        let a = parse_argv(&argv(&["-f", "my.conf"])).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("my.conf")));
        assert!(parse_argv(&argv(&["-f"])).is_err());
    }

    #[test]
    fn files_after_double_dash() {
        let a = parse_argv(&argv(&["--", "-d", "b.tcl"])).unwrap();
        assert!(!a.debug);
        assert_eq!(a.files, vec![PathBuf::from("-d"), PathBuf::from("b.tcl")]);
    }

    #[test]
    fn unknown_flag() {
        assert!(parse_argv(&argv(&["-z"])).is_err());
    }

    #[test]
    fn run_prints_output_and_result() {
        let args = CliArgs { command: Some("puts hello; expr {6 * 7}".into()), ..Default::default() };
        let (code, out, err) = run_args(&args);
        assert_eq!(code, 0);
        assert_eq!(out, "hello\n42\n");
        assert!(err.is_empty());
    }

    #[test]
    fn run_reports_error_info() {
        let args = CliArgs { command: Some("proc f {} { error bad }\nf".into()), ..Default::default() };
        let (code, _, err) = run_args(&args);
        assert_eq!(code, 1);
        assert!(err.starts_with("bad\n"));
        assert!(err.contains("(procedure \"f\" line 1)"));
    }

    #[test]
    fn run_honours_exit() {
        let args = CliArgs { command: Some("exit 4".into()), ..Default::default() };
        assert_eq!(run_args(&args).0, 4);
    }

    #[test]
    fn run_evaluates_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tcl");
        let b = dir.path().join("b.tcl");
        std::fs::write(&a, "set x 2").unwrap();
        std::fs::write(&b, "expr {$x + 1}").unwrap();
        let args = CliArgs { files: vec![a, b], ..Default::default() };
        let (code, out, _) = run_args(&args);
        assert_eq!(code, 0);
        assert_eq!(out, "3\n");
    }

    #[test]
    fn explicit_config_must_exist() {
        let args = CliArgs { config: Some(PathBuf::from("/nonexistent/engine.conf")), ..Default::default() };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn safe_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.conf");
        std::fs::write(&path, "max_levels = 50\n").unwrap();
        let args = CliArgs { safe: true, config: Some(path), ..Default::default() };
        let config = load_config(&args).unwrap();
        assert!(config.safe);
        assert_eq!(config.max_levels, 50);
    }
}
