//! Tracing initialization.
//!
//! Nothing in the library installs a subscriber; the binary calls [`init`]
//! once and keeps the returned guard alive until exit. Log lines always go to
//! stderr because stdout carries the JSON results.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Number of `-v` flags.
    pub verbosity: u8,
    pub quiet: bool,
    /// Also write plain-text logs to this file.
    pub log_file: Option<PathBuf>,
    pub ansi: bool,
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log file path: {0}")]
    InvalidPath(PathBuf),

    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Flushes buffered file output when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(options: &LogOptions) -> &'static str {
    if options.quiet {
        return "error";
    }
    match options.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_filter(options: &LogOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(options)))
}

fn split_log_path(path: &Path) -> Result<(PathBuf, std::ffi::OsString), LoggingError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.to_path_buf()))?
        .to_os_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, file_name))
}

/// Install the global subscriber.
pub fn init(options: &LogOptions) -> Result<LoggingGuard, LoggingError> {
    let (file_layer, file_guard) = match &options.log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_ansi(options.ansi)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(build_filter(options))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuard { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let mut options = LogOptions::default();
        assert_eq!(default_directive(&options), "warn");
        options.verbosity = 1;
        assert_eq!(default_directive(&options), "info");
        options.verbosity = 5;
        assert_eq!(default_directive(&options), "trace");
        options.quiet = true;
        assert_eq!(default_directive(&options), "error");
    }

    #[test]
    fn log_path_splits_into_dir_and_name() {
        let (dir, name) = split_log_path(Path::new("logs/run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(name, "run.log");

        let (dir, _) = split_log_path(Path::new("run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));

        assert!(split_log_path(Path::new("/")).is_err());
    }
}
