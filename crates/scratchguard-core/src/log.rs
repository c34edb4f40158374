//! Structured log records and the pluggable sink they are delivered to.
//!
//! Provides:
//! - [`LogEntry`]: JSONL-serializable record with required + optional fields.
//! - [`LogSink`]: the "log a message" collaborator the allocators call.
//! - [`StderrSink`], [`JsonlSink`], [`MemorySink`]: stock sinks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`, `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,
    pub message: String,

    // Optional
    /// API symbol (`talloc`, `temp_reset`, `free`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Caller site as `file:line (function)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

static NEXT_TRACE_SEQ: AtomicU64 = AtomicU64::new(1);

impl LogEntry {
    /// Create a new entry with required fields only.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>, message: impl Into<String>) -> Self {
        let event = event.into();
        let seq = NEXT_TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            timestamp: now_utc(),
            trace_id: format!("scratchguard::{event}::{seq:016x}"),
            level,
            event,
            message: message.into(),
            symbol: None,
            site: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives log entries from the allocators.
pub trait LogSink: Send + Sync {
    fn log(&self, entry: &LogEntry);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn LogSink>;

/// One human-readable line per entry on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn log(&self, entry: &LogEntry) {
        eprintln!(
            "[{}] {} {}: {}",
            entry.timestamp,
            entry.level.as_str(),
            entry.event,
            entry.message
        );
    }
}

/// Writes JSONL lines to any writer.
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Give back the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> LogSink for JsonlSink<W> {
    fn log(&self, entry: &LogEntry) {
        // A sink has nowhere to report its own failures.
        if let Ok(line) = entry.to_jsonl() {
            let mut writer = self.writer.lock();
            let _ = writeln!(writer, "{line}");
        }
    }
}

/// Collects entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries whose `event` matches.
    #[must_use]
    pub fn events(&self, event: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// The sink used when none is supplied.
#[must_use]
pub fn default_sink() -> SharedSink {
    Arc::new(StderrSink)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Whole seconds since the Unix epoch.
#[must_use]
pub fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `HH:MM:SS` (UTC) for a Unix timestamp.
#[must_use]
pub fn format_hms(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Proleptic Gregorian `(year, month, day)` for days since 1970-01-01.
fn civil_date(days: u64) -> (u64, u64, u64) {
    // Eras of 400 years starting 0000-03-01.
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

fn format_timestamp(secs: u64, millis: u32) -> String {
    let (year, month, day) = civil_date(secs / 86400);
    format!(
        "{year:04}-{month:02}-{day:02}T{}.{millis:03}Z",
        format_hms(secs)
    )
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_timestamp(duration.as_secs(), duration.subsec_millis())
}
