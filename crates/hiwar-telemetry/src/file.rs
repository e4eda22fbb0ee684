use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::TelemetryError;

/// Append-only log file written from a background worker thread.
///
/// Dropping it flushes whatever the worker still has queued.
pub struct LogFile {
    path: PathBuf,
    writer: NonBlocking,
    _worker: WorkerGuard,
}

impl LogFile {
    /// Open (creating parent directories) in append mode. The file is never rotated.
    pub fn open(path: &Path) -> Result<Self, TelemetryError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TelemetryError::InvalidLogPath(path.to_path_buf()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name)
            .build(dir)
            .map_err(|source| TelemetryError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        let (writer, worker) = tracing_appender::non_blocking(appender);

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            _worker: worker,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A cheap handle for a fmt layer; events are queued, not written inline.
    pub fn writer(&self) -> NonBlocking {
        self.writer.clone()
    }
}
