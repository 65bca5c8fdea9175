use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "./logs/deep-index.log";

/// Where log lines go, resolved from `TRACING_LEVEL` and `LOG_FILE_PATH`.
struct LogSettings {
    filter: String,
    file: PathBuf,
}

impl LogSettings {
    fn from_env() -> Self {
        Self {
            filter: env::var("TRACING_LEVEL").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            file: PathBuf::from(
                env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string()),
            ),
        }
    }

    fn split_file(&self) -> (PathBuf, PathBuf) {
        let dir = match self.file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = self
            .file
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deep-index.log"));
        (dir, name)
    }
}

/// Stdout plus a non-blocking log file. The file lines carry the module
/// target and thread name (`scheduler`, `insertable-worker`,
/// `update-queue`, ...) so background activity can be told apart. Keep the
/// returned guard alive until exit or buffered lines are lost.
pub fn init_logger() -> WorkerGuard {
    let settings = LogSettings::from_env();
    let (filter_layer, bad_filter) = match EnvFilter::try_new(&settings.filter) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new(DEFAULT_FILTER), Some(err)),
    };

    let (dir, name) = settings.split_file();
    let dir_error = fs::create_dir_all(&dir).err();
    let file_appender = tracing_appender::rolling::never(&dir, &name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .pretty()
                .with_file(false)
                .without_time()
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false),
        )
        .with(filter_layer)
        .init();

    if let Some(err) = bad_filter {
        warn!(filter = %settings.filter, "Invalid TRACING_LEVEL ({}), using {}", err, DEFAULT_FILTER);
    }
    if let Some(err) = dir_error {
        warn!(dir = %dir.display(), "Cannot create log directory: {}", err);
    }
    info!(
        filter = %settings.filter,
        file = %Path::new(&dir).join(&name).display(),
        "Logging to stdout and file"
    );

    guard
}
