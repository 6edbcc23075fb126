//! Tracing setup for the render-queue binary.
//!
//! Log lines go to stderr and to `<log_dir>/render-queue.log.YYYY-MM-DD`,
//! written off-thread. The active filter can be swapped at runtime through
//! [`LogHandle::set_filter`], and rotated files past the retention window
//! are pruned once a day.

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "render_queue=info";

const LOG_FILE_PREFIX: &str = "render-queue.log";
const RETENTION_DAYS: u64 = 7;
const PRUNE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// RFC 3339 with milliseconds and the host's UTC offset.
#[derive(Debug, Clone, Copy)]
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Owner of the installed subscriber's reload handle and log directory.
pub struct LogHandle {
    filter: ReloadHandle,
    retention: LogRetention,
}

impl LogHandle {
    /// Directive string of the active filter.
    pub fn filter(&self) -> String {
        self.filter
            .with_current(|f| f.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter, e.g. with `render_queue=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Bad log filter '{}': {}", directive, e)))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("Log filter reload failed: {}", e)))?;
        info!(directive, "Log filter changed");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.retention.dir
    }

    /// Prune old log files daily until `cancel` fires.
    pub fn spawn_retention(self: &Arc<Self>, cancel: CancellationToken) {
        let retention = self.retention.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PRUNE_EVERY) => {}
                }
                match retention.prune(Local::now().date_naive()).await {
                    Ok(removed) if !removed.is_empty() => {
                        info!(count = removed.len(), "Pruned old log files");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(dir = %retention.dir.display(), "Log pruning failed: {}", e),
                }
            }
            debug!("Log retention task stopped");
        });
    }
}

/// Age-based cleanup of rotated log files.
#[derive(Debug, Clone)]
struct LogRetention {
    dir: PathBuf,
    keep_days: u64,
}

impl LogRetention {
    /// Rotation date encoded in a file name, if it is one of ours.
    fn file_date(name: &str) -> Option<NaiveDate> {
        let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Delete files dated more than `keep_days` before `today`.
    async fn prune(&self, today: NaiveDate) -> std::io::Result<Vec<PathBuf>> {
        let Some(cutoff) = today.checked_sub_days(chrono::Days::new(self.keep_days)) else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let expired = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Self::file_date)
                .is_some_and(|date| date < cutoff);
            if !expired || !path.is_file() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), "Could not remove log file: {}", e),
            }
        }
        Ok(removed)
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must live as
/// long as the process logs.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<(Arc<LogHandle>, WorkerGuard)> {
    let dir = log_dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    let console = fmt::layer().with_timer(LocalTime);
    let file = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_timer(LocalTime);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Logging already initialized: {}", e)))?;

    let handle = LogHandle {
        filter: reload_handle,
        retention: LogRetention {
            dir,
            keep_days: RETENTION_DAYS,
        },
    };
    Ok((Arc::new(handle), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_file_date() {
        assert_eq!(
            LogRetention::file_date("render-queue.log.2026-03-01"),
            Some(date("2026-03-01"))
        );
        assert_eq!(LogRetention::file_date("render-queue.log"), None);
        assert_eq!(LogRetention::file_date("render-queue.log.latest"), None);
        assert_eq!(LogRetention::file_date("other.log.2026-03-01"), None);
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "render-queue.log.2026-02-20",
            "render-queue.log.2026-02-22",
            "render-queue.log.2026-03-01",
            "other.log.2020-01-01",
        ];
        for name in names {
            std::fs::write(dir.path().join(name), "line\n").unwrap();
        }
        let retention = LogRetention {
            dir: dir.path().to_path_buf(),
            keep_days: 7,
        };

        let removed = retention.prune(date("2026-03-01")).await.unwrap();

        assert_eq!(removed, vec![dir.path().join("render-queue.log.2026-02-20")]);
        for kept in &names[1..] {
            assert!(dir.path().join(kept).exists());
        }
    }
}
