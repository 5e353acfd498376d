//! Logging setup (component K, spec.md §6 "Logging"), grounded on
//! `tracing-subscriber`'s `fmt` layer plus `tracing-appender`'s
//! non-blocking file writer, mirroring `logInitLogFile`'s file-or-stderr
//! choice and verbose-gates-debug behavior.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;

/// Initializes the global subscriber. Returns a [`WorkerGuard`] that must be
/// held for the lifetime of the process when logging to a file - dropping it
/// flushes and stops the background writer thread, matching
/// `tracing-appender`'s own documented contract.
pub fn init(log_path: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    match log_path {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().unwrap_or_else(|| path.as_os_str());
            let file_appender =
                tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            fmt()
                .with_writer(writer)
                .with_max_level(level)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            fmt().with_max_level(level).init();
            None
        }
    }
}
