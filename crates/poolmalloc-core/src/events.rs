//! Structured lifecycle events.
//!
//! The allocator reports lifecycle transitions and ignored misuse as
//! [`AllocatorEvent`] records delivered to a pluggable [`EventSink`]. Records
//! serialize to one JSON object per line.
//!
//! Events are never emitted on the allocate/free fast path except for
//! failures and misuse.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured event.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorEvent {
    /// Per-allocator sequence number, starting at 1.
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub level: EventLevel,
    pub allocator_id: u64,
    pub event: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AllocatorEvent {
    #[must_use]
    pub fn new(allocator_id: u64, level: EventLevel, event: &str) -> Self {
        Self {
            seq: 0,
            timestamp_ms: now_ms(),
            level,
            allocator_id,
            event: event.to_string(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination for allocator events. Must tolerate calls from any thread,
/// including from thread-local destructors.
pub trait EventSink: Send + Sync {
    /// Cheap pre-check so callers can skip building details.
    fn enabled(&self, level: EventLevel) -> bool {
        let _ = level;
        true
    }

    fn emit(&self, event: &AllocatorEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn enabled(&self, _level: EventLevel) -> bool {
        false
    }

    fn emit(&self, _event: &AllocatorEvent) {}
}

/// Keeps events in memory.
#[derive(Debug)]
pub struct MemorySink {
    min_level: EventLevel,
    events: Mutex<Vec<AllocatorEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new(min_level: EventLevel) -> Self {
        Self {
            min_level,
            events: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<AllocatorEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<AllocatorEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events named `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(EventLevel::Trace)
    }
}

impl EventSink for MemorySink {
    fn enabled(&self, level: EventLevel) -> bool {
        level >= self.min_level
    }

    fn emit(&self, event: &AllocatorEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Writes one JSON line per event.
///
/// Write failures cannot be propagated out of the allocator; they are
/// counted and the event is dropped.
pub struct JsonLinesSink<W: Write + Send> {
    min_level: EventLevel,
    writer: Mutex<W>,
    write_errors: AtomicU64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W, min_level: EventLevel) -> Self {
        Self {
            min_level,
            writer: Mutex::new(writer),
            write_errors: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn enabled(&self, level: EventLevel) -> bool {
        level >= self.min_level
    }

    fn emit(&self, event: &AllocatorEvent) {
        let written = event
            .to_jsonl()
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(self.writer.lock(), "{line}"));
        if written.is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Stamps sequence numbers and allocator identity onto events.
pub(crate) struct EventEmitter {
    allocator_id: u64,
    seq: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub(crate) fn new(allocator_id: u64, sink: Arc<dyn EventSink>) -> Self {
        Self {
            allocator_id,
            seq: AtomicU64::new(0),
            sink,
        }
    }

    /// Emits `event` if the sink wants `level`. `details` runs only then.
    pub(crate) fn emit(
        &self,
        level: EventLevel,
        event: &str,
        details: impl FnOnce() -> serde_json::Value,
    ) {
        if !self.sink.enabled(level) {
            return;
        }
        let mut record = AllocatorEvent::new(self.allocator_id, level, event).with_details(details());
        record.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink.emit(&record);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
