//! Command-line interface definitions using clap.

use clap::Parser;
use std::path::PathBuf;

/// execd - command-execution worker for a monitoring master.
///
/// The master forks this process with one end of a socketpair and drives
/// it over that descriptor; there is no interactive surface.
#[derive(Parser, Debug)]
#[command(name = "execd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Inherited descriptor of the connected master socket.
    #[arg(long, env = "EXECD_SOCKET_FD", default_value_t = 3)]
    pub socket_fd: i32,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "EXECD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "EXECD_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "EXECD_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}
