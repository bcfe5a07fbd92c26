use talon::cli;
use tracing_subscriber::EnvFilter;

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("TALON_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let filter = if debug { filter.add_directive(tracing::Level::DEBUG.into()) } else { filter };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("talon: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    init_logging(args.debug);

    let config = match cli::load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("talon: {e}");
            std::process::exit(1);
        }
    };

    let init = cli::init_script_path();
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    let code = cli::run(&args, config, init.as_deref(), &mut stdout.lock(), &mut stderr.lock());
    std::process::exit(code);
}
