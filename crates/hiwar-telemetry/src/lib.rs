mod file;

pub use file::LogFile;

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },
    #[error("log file path has no file name: {}", .0.display())]
    InvalidLogPath(PathBuf),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "hiwar_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines on stdout instead of human-readable text.
    pub json: bool,
    /// Append a plain-text copy of every log line to this file.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_file: Some(PathBuf::from("chatbot.log")),
        }
    }
}

/// Keeps the log worker alive; dropping it flushes queued lines.
pub struct TelemetryGuard {
    log_file: Option<LogFile>,
}

impl TelemetryGuard {
    /// Path of the log file, if file logging is active.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_ref().map(LogFile::path)
    }
}

/// Build the filter directive string from config, e.g. `info,hiwar_server=debug`.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A log file that cannot be opened is reported on stderr and skipped; stdout
/// logging always comes up.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let (json_layer, text_layer) = if config.json {
        (
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        )
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };

    let log_file = config.log_file.as_deref().and_then(|path| match LogFile::open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("hiwar-telemetry: {e}");
            None
        }
    });
    let file_layer = log_file.as_ref().map(|file| file_layer(file.writer()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    TelemetryGuard { log_file }
}

type FileLayer<S> = fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, NonBlocking>;

fn file_layer<S>(writer: NonBlocking) -> FileLayer<S> {
    fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
}
