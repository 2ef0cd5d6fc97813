//! Shared log for every running tunnel.
//!
//! All instances write into one undifferentiated text buffer (`LogAggregator`). The
//! buffer is published through a `watch` channel so readers always see the full
//! current text. Each `LogSnapshot` also remembers the absolute byte offset of its
//! first byte, which lets a tailing reader print only what is new.

use std::sync::Arc;

use strip_ansi_escapes::strip;
use tokio::sync::watch;

/// Default upper bound on retained log bytes.
pub const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;

/// The full log text at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSnapshot {
    text: String,
    base: u64,
}

impl LogSnapshot {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Absolute offset of the first retained byte.
    pub fn base_offset(&self) -> u64 {
        self.base
    }

    /// Absolute offset one past the last byte.
    pub fn end_offset(&self) -> u64 {
        self.base + self.text.len() as u64
    }

    /// Text written at or after the absolute `offset`.
    ///
    /// Returns everything retained when `offset` points before the buffer (the
    /// missed part was trimmed or cleared).
    pub fn since(&self, offset: u64) -> &str {
        if offset <= self.base {
            return &self.text;
        }
        let rel = (offset - self.base) as usize;
        self.text.get(rel..).unwrap_or("")
    }
}

/// Bounded, clearable text buffer shared by every running instance.
#[derive(Debug, Clone)]
pub struct LogAggregator {
    tx: Arc<watch::Sender<LogSnapshot>>,
    max_bytes: usize,
}

impl LogAggregator {
    pub fn new(max_bytes: usize) -> Self {
        let (tx, _) = watch::channel(LogSnapshot::default());
        Self {
            tx: Arc::new(tx),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Appends `text` and notifies every subscriber.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let max_bytes = self.max_bytes;
        self.tx.send_modify(|log| {
            log.text.push_str(text);
            trim_front(log, max_bytes);
        });
    }

    /// Empties the buffer and notifies every subscriber.
    pub fn clear(&self) {
        self.tx.send_modify(|log| {
            log.base += log.text.len() as u64;
            log.text.clear();
        });
    }

    /// Subscribes to the full log text.
    ///
    /// The receiver is marked changed so the first `changed().await` yields the
    /// current content immediately.
    pub fn subscribe(&self) -> watch::Receiver<LogSnapshot> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        rx
    }

    pub fn snapshot(&self) -> LogSnapshot {
        self.tx.borrow().clone()
    }

    pub fn text(&self) -> String {
        self.tx.borrow().text.clone()
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOG_BYTES)
    }
}

/// Tracks how much of the log a streaming reader has already consumed.
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    offset: u64,
    strip_ansi: bool,
}

impl LogTail {
    pub fn new(strip_ansi: bool) -> Self {
        Self {
            offset: 0,
            strip_ansi,
        }
    }

    /// Returns the text not yet consumed from `snapshot` and advances past it.
    pub fn take(&mut self, snapshot: &LogSnapshot) -> String {
        let fresh = snapshot.since(self.offset);
        self.offset = snapshot.end_offset();
        sanitize_text(fresh, self.strip_ansi)
    }
}

// Drop the oldest bytes beyond `max_bytes`, preferring to cut after a newline.
fn trim_front(log: &mut LogSnapshot, max_bytes: usize) {
    if log.text.len() <= max_bytes {
        return;
    }
    let mut cut = log.text.len() - max_bytes;
    while !log.text.is_char_boundary(cut) {
        cut += 1;
    }
    if let Some(newline) = log.text[cut..].find('\n') {
        if newline + 1 < log.text.len() - cut {
            cut += newline + 1;
        }
    }
    log.text.drain(..cut);
    log.base += cut as u64;
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
