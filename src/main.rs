mod api;
mod cli;
mod clock;
mod config;
mod db;
mod error;
mod events;
mod models;
mod music;
mod relay;
mod ring_spec;
mod scheduler;
mod server;
mod store;

use cli::Cli;
use directories::ProjectDirs;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::{debug, error};

use crate::config::Config;
use crate::error::BellError;

/// Rotated log files kept in the data directory
const LOG_FILES_KEPT: usize = 7;
const LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Start file logging in `<data dir>/logs`, with warnings and errors also
/// echoed to stderr. The returned handle must be kept alive.
pub fn setup_logging(project_dirs: &ProjectDirs, config: &Config) -> Result<LoggerHandle, BellError> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    let log_spec = format!("schoolbell={}", config.logging.schoolbell);

    let handle = Logger::try_with_str(&log_spec)
        .map_err(|e| BellError::Error(format!("Invalid log specification '{}': {}", log_spec, e)))?
        .log_to_file(FileSpec::default().directory(log_dir).basename("schoolbell"))
        .format_for_files(detailed_format)
        .duplicate_to_stderr(Duplicate::Warn)
        .rotate(
            Criterion::Size(LOG_FILE_MAX_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(LOG_FILES_KEPT),
        )
        .start()
        .map_err(|e| BellError::Error(format!("Failed to start logger: {}", e)))?;

    debug!(
        "Command-line args: {:?}",
        std::env::args_os().collect::<Vec<_>>()
    );

    Ok(handle)
}

fn main() {
    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
