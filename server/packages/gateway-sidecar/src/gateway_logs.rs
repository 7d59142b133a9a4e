//! In-memory ring of gateway output and sidecar system events.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_LOG_CAPACITY: usize = 4000;
pub const DEFAULT_SNAPSHOT_TAIL: usize = 200;
pub const MAX_SNAPSHOT_TAIL: usize = 2000;

/// Which stream a recorded line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSnapshot {
    pub entries: Vec<LogEntry>,
    /// More history exists than was returned.
    pub truncated: bool,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<LogEntry>>,
    next: usize,
    wrapped: bool,
}

impl Ring {
    fn len(&self) -> usize {
        if self.wrapped {
            self.slots.len()
        } else {
            self.next
        }
    }
}

/// Fixed-capacity log store shared by the supervisor, its output drainers
/// and the HTTP handlers.
///
/// The lock is held only while a single entry is written or while a
/// snapshot is copied out.
#[derive(Debug)]
pub struct LogRecorder {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl LogRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; capacity],
                next: 0,
                wrapped: false,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, stream: LogStream, line: impl Into<String>) {
        let entry = LogEntry {
            ts: format_timestamp(),
            stream,
            line: line.into(),
        };
        let mut ring = self.lock();
        let slot = ring.next;
        ring.slots[slot] = Some(entry);
        ring.next = (slot + 1) % self.capacity;
        if ring.next == 0 {
            ring.wrapped = true;
        }
    }

    pub fn system(&self, line: impl Into<String>) {
        self.append(LogStream::System, line);
    }

    /// Returns the most recent entries in chronological order.
    ///
    /// `tail <= 0` selects [`DEFAULT_SNAPSHOT_TAIL`]; larger requests are
    /// clamped to [`MAX_SNAPSHOT_TAIL`].
    pub fn snapshot(&self, tail: i64) -> LogSnapshot {
        let requested = if tail <= 0 {
            DEFAULT_SNAPSHOT_TAIL
        } else {
            usize::try_from(tail)
                .unwrap_or(MAX_SNAPSHOT_TAIL)
                .min(MAX_SNAPSHOT_TAIL)
        };

        let ring = self.lock();
        let available = ring.len();
        let count = requested.min(available);
        let start = available - count;

        let mut entries = Vec::with_capacity(count);
        for offset in start..available {
            // Once wrapped, the oldest entry sits at the write cursor.
            let position = if ring.wrapped {
                (ring.next + offset) % self.capacity
            } else {
                offset
            };
            if let Some(entry) = ring.slots[position].as_ref() {
                entries.push(entry.clone());
            }
        }

        LogSnapshot {
            entries,
            truncated: count < available,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

fn format_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
