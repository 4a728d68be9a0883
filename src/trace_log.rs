//! Bounded in-memory log of inbound and outbound messages.
//!
//! Installed at server construction, drained on destroy. In verbose mode
//! every record is also emitted through `tracing` as it arrives; otherwise
//! the buffer is inspection-only (tests, debugging a live process).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

/// One logged message.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub direction: Direction,
    pub document: String,
    pub kind: &'static str,
    pub bytes: usize,
}

/// Ring buffer of message records.
pub struct TraceLog {
    capacity: usize,
    verbose: AtomicBool,
    entries: Mutex<VecDeque<TraceEntry>>,
}

impl TraceLog {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize, verbose: bool) -> Self {
        Self {
            capacity,
            verbose: AtomicBool::new(verbose),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::SeqCst);
    }

    /// Append a record, evicting the oldest once at capacity.
    pub fn record(&self, direction: Direction, document: &str, kind: &'static str, bytes: usize) {
        if self.verbose.load(Ordering::SeqCst) {
            debug!(
                direction = direction.label(),
                document, kind, bytes, "message"
            );
        }
        let mut entries = self.entries.lock().expect("trace log lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(TraceEntry {
            direction,
            document: document.to_string(),
            kind,
            bytes,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("trace log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the buffered records, oldest first.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .expect("trace log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Drain the buffer, logging a summary of what was dropped.
    pub fn flush(&self) {
        let mut entries = self.entries.lock().expect("trace log lock poisoned");
        if !entries.is_empty() {
            info!(messages = entries.len(), "flushing message trace log");
        }
        entries.clear();
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, false)
    }
}
