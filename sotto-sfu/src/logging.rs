//! Structured logging with an in-memory tail
//!
//! Logs are JSON lines on stdout (and optionally a file), mirrored into a
//! bounded in-memory ring so the admin endpoint can serve the recent tail
//! without touching disk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Capacity of the in-memory log tail.
pub const LOG_RING_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter, overridable via `RUST_LOG`.
    pub level: String,
    /// Optional log file, appended to alongside stdout.
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
        }
    }
}

/// Bounded ring of recent formatted log lines, oldest first.
pub struct LogRing {
    max: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogRing {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            lines: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    fn push(&self, line: String) {
        if self.max == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.max {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The most recent `limit` lines, most recent last.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// `MakeWriter` that feeds whole lines into a [`LogRing`].
#[derive(Clone)]
struct RingWriter {
    ring: Arc<LogRing>,
}

impl io::Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in String::from_utf8_lossy(buf).lines() {
            if !line.is_empty() {
                self.ring.push(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RingWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize the global subscriber and return the shared log tail.
///
/// Fails if a global subscriber is already installed or the log file
/// cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Arc<LogRing>> {
    let ring = Arc::new(LogRing::new(LOG_RING_CAPACITY));

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().json().with_target(true);
    let ring_layer = fmt::layer()
        .json()
        .with_target(false)
        .with_writer(RingWriter { ring: ring.clone() });

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(ring_layer);

    if let Some(path) = &config.file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        registry
            .with(fmt::layer().json().with_writer(Arc::new(file)))
            .try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(ring)
}
