//! Main entry point for the packforge CLI app

use packforge::cli;
use packforge::cli_runner;
use tracing_subscriber::EnvFilter;

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn main() -> std::process::ExitCode {
    let args = match cli::run() {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    init_logging(args.global.log_level.as_deref());

    if let Err(e) = cli_runner::run_cli_app(args) {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}
