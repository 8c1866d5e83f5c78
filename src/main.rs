//! execd - command-execution worker for monitoring masters.

mod cli;
mod codec;
mod error;
mod logging;
mod worker;

use clap::Parser;
use tracing::Level;

use cli::Cli;
use logging::{LogConfig, LogFormat};

fn main() {
    let cli = Cli::parse();
    logging::init(log_config(&cli));

    let master = match worker::socket_from_fd(cli.socket_fd) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(fd = cli.socket_fd, error = %e, "cannot adopt master socket");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let worker = match worker::Worker::new(master) {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(error = %e, "worker initialization failed");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    // Never returns: the loop exits the process directly.
    worker.run()
}

/// Fold CLI flags into the logging configuration. `-v` levels win over
/// `--log-level`; environment variables fill whatever is left unset.
fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::new();

    match cli.verbose {
        0 => {
            if let Some(level) = cli.log_level.as_deref() {
                if let Ok(parsed) = level.parse::<Level>() {
                    config = config.with_level(parsed);
                }
            }
        }
        1 => config = config.with_level(Level::DEBUG),
        _ => config = config.with_level(Level::TRACE),
    }

    if let Some(format) = cli.log_format.as_deref() {
        if let Ok(parsed) = format.parse::<LogFormat>() {
            config = config.with_format(parsed);
        }
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }

    config.with_env_overrides()
}
