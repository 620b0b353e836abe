//! Command-line entry point: load a config file, run the pipeline, map the
//! outcome to an exit code (0 on clean soft shutdown, 1 on any fatal error).

use std::path::PathBuf;
use std::process::ExitCode;

use redotail::{Config, Pipeline};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();
}

fn run() -> redotail::Result<()> {
    let config_path: PathBuf = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: redotail <config.json>");
            return Err(redotail::RedotailError::config("missing config file path"));
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "redotail starting"
    );

    let config = Config::from_file(&config_path)?;
    let pipeline = Pipeline::start(&config)?;

    let contexts = pipeline.contexts();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        for ctx in &contexts {
            ctx.stop_soft();
        }
    })
    .map_err(|err| redotail::RedotailError::internal(format!("signal handler: {err}")))?;

    pipeline.wait()
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => {
            info!("redotail stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}
