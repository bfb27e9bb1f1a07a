//! Tracing setup and the in-process log capture buffer.
//!
//! Structured, async-aware logging via `tracing`/`tracing-subscriber`:
//! - multiple output formats (pretty, compact, JSON)
//! - environment-based filtering (`RUST_LOG` wins over the config level)
//! - an optional capture layer that mirrors recent events into a
//!   fixed-capacity buffer, which backs the operator-facing log panel
//!
//! Initialization is idempotent: a second `init` (tests, multiple
//! components) is a no-op rather than an error.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{AppResult, PhotodiagError};

const MAX_LOG_ENTRIES: usize = 1000;

/// Output format for the fmt layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed with colors (development).
    #[default]
    Pretty,
    /// Compact single-line output (production).
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Tracing configuration options.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Include file and line numbers.
    pub with_file_and_line: bool,
    /// Enable ANSI colors (pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create a config at the given level with default formatting.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Parse a textual log level (`trace`..`error`), case-insensitive.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(PhotodiagError::Configuration(format!(
            "invalid log level '{other}' (expected trace, debug, info, warn or error)"
        ))),
    }
}

/// Initialize the global subscriber; `capture` additionally mirrors events
/// into the given buffer.
pub fn init(config: TracingConfig, capture: Option<LogBuffer>) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .boxed(),
    };

    let capture_layer = capture.map(CaptureLayer::new);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(capture_layer)
        .try_init()
        .or_else(|e| {
            // A second init (tests, multiple components) is fine.
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(PhotodiagError::Configuration(format!(
                    "failed to initialize tracing: {e}"
                )))
            }
        })
}

/// A single captured log event.
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Wall-clock time the event was recorded.
    pub timestamp: DateTime<Local>,
    /// Event level.
    pub level: Level,
    /// Module path / target of the event.
    pub target: String,
    /// Rendered message plus structured fields.
    pub message: String,
}

/// A thread-safe, fixed-capacity buffer of recent log events.
#[derive(Clone)]
pub struct LogBuffer(Arc<Mutex<VecDeque<LogEntry>>>);

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_LOG_ENTRIES,
        ))))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, entry: LogEntry) {
        let mut buffer = self.lock();
        if buffer.len() >= MAX_LOG_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Ordered copy of the captured entries (oldest first).
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard all captured entries.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Layer mirroring every event into a [`LogBuffer`]. Level filtering is left
/// to the display side so the panel can re-filter without re-running.
pub struct CaptureLayer {
    buffer: LogBuffer,
}

impl CaptureLayer {
    /// Create a layer writing into `buffer`.
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogEntry {
            timestamp: Local::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.into_message(),
        });
    }
}

/// Collects the `message` field verbatim and renders the remaining fields as
/// `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("info").expect("level"), Level::INFO);
        assert_eq!(parse_log_level("DEBUG").expect("level"), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn buffer_evicts_oldest_entry_at_capacity() {
        let buffer = LogBuffer::new();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            buffer.push(LogEntry {
                timestamp: Local::now(),
                level: Level::INFO,
                target: "test".to_string(),
                message: format!("entry {i}"),
            });
        }
        assert_eq!(buffer.len(), MAX_LOG_ENTRIES);
        let entries = buffer.entries();
        assert_eq!(entries[0].message, "entry 5");
    }

    #[test]
    fn capture_layer_records_message_and_fields() {
        let buffer = LogBuffer::new();
        let subscriber =
            tracing_subscriber::registry().with(CaptureLayer::new(buffer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(channel = "XPOS", "value written");
        });

        let entries = buffer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, Level::INFO);
        assert!(entries[0].message.contains("value written"));
        assert!(entries[0].message.contains("channel"));
    }
}
