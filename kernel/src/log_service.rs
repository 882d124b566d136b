//! Structured kernel log service
//!
//! Backend for the [`log`] facade. Provides a fixed-size, heap-free circular
//! buffer of structured log entries. Each entry carries a sequence number,
//! severity level, subsystem tag, and a fixed-length message. An optional
//! console sink sees every entry as it is recorded.
//!
//! # Usage
//!
//! ```ignore
//! log_service::log_init(log::LevelFilter::Info);
//! log::info!("[VIRTIO-GPU] Display ready");
//! let n = log_service::log_count();
//! ```
//!
//! The buffer holds up to [`LOG_BUFFER_CAPACITY`] entries. Once full it wraps
//! around and silently overwrites the oldest entries.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Maximum number of log entries the circular buffer can hold.
pub const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum length (in bytes) of a log message stored in a [`LogEntry`].
const LOG_MESSAGE_MAX_LEN: usize = 128;

/// Maximum length (in bytes) of the subsystem tag in a [`LogEntry`].
const LOG_SUBSYSTEM_MAX_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single structured log entry.
///
/// All fields are stored inline with fixed-size arrays so that the entry
/// can live in a static circular buffer without heap allocation.
#[derive(Clone)]
pub struct LogEntry {
    /// Position of this entry in the stream of all recorded entries.
    pub sequence: u64,
    pub level: Level,
    /// Short subsystem identifier: the last segment of the record's target
    /// (e.g. `"virtio_gpu"`, `"queue"`).
    subsystem_buf: [u8; LOG_SUBSYSTEM_MAX_LEN],
    subsystem_len: u8,
    /// The log message text, truncated to [`LOG_MESSAGE_MAX_LEN`] bytes.
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            sequence: 0,
            level: Level::Trace,
            subsystem_buf: [0u8; LOG_SUBSYSTEM_MAX_LEN],
            subsystem_len: 0,
            message_buf: [0u8; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn subsystem(&self) -> &str {
        let len = self.subsystem_len as usize;
        // Invariant: filled from a &str and cut on a char boundary.
        core::str::from_utf8(&self.subsystem_buf[..len]).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        let len = self.message_len as usize;
        core::str::from_utf8(&self.message_buf[..len]).unwrap_or("")
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>5}] {:<5} {}: {}",
            self.sequence,
            self.level,
            self.subsystem(),
            self.message()
        )
    }
}

/// `fmt::Write` into a fixed byte buffer, dropping whatever does not fit.
struct TruncatingWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for TruncatingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let mut n = s.len().min(room);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn copy_truncated(dst: &mut [u8], args: fmt::Arguments<'_>) -> u8 {
    let mut writer = TruncatingWriter { buf: dst, len: 0 };
    // TruncatingWriter never fails; a failing Display impl just stops early.
    let _ = writer.write_fmt(args);
    writer.len as u8
}

// ---------------------------------------------------------------------------
// Circular buffer
// ---------------------------------------------------------------------------

/// Fixed-size circular buffer of [`LogEntry`] items.
///
/// Uses a head index with a count to distinguish empty from full.
struct LogBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Index of the next slot to write.
    head: usize,
    /// Total number of valid entries (capped at `LOG_BUFFER_CAPACITY`).
    count: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        const EMPTY: LogEntry = LogEntry::empty();
        Self {
            entries: [EMPTY; LOG_BUFFER_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    /// Append a log entry, overwriting the oldest if full.
    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        if self.count < LOG_BUFFER_CAPACITY {
            self.count += 1;
        }
    }

    fn len(&self) -> usize {
        self.count
    }

    /// Return the tail index (oldest entry).
    fn tail(&self) -> usize {
        if self.count < LOG_BUFFER_CAPACITY {
            0
        } else {
            self.head // when full, head == tail (oldest)
        }
    }

    /// Get the entry at logical index `i` (0 = oldest).
    fn get(&self, i: usize) -> Option<&LogEntry> {
        if i >= self.count {
            return None;
        }
        let physical = (self.tail() + i) % LOG_BUFFER_CAPACITY;
        Some(&self.entries[physical])
    }
}

// ---------------------------------------------------------------------------
// LogService
// ---------------------------------------------------------------------------

/// The kernel log service wrapping a [`LogBuffer`].
struct LogService {
    buffer: LogBuffer,
    next_sequence: u64,
}

impl LogService {
    const fn new() -> Self {
        Self {
            buffer: LogBuffer::new(),
            next_sequence: 0,
        }
    }

    /// Record a log entry and return a copy of it.
    fn log(&mut self, level: Level, subsystem: &str, args: fmt::Arguments<'_>) -> LogEntry {
        let mut entry = LogEntry::empty();
        entry.sequence = self.next_sequence;
        entry.level = level;
        entry.subsystem_len = copy_truncated(&mut entry.subsystem_buf, format_args!("{}", subsystem));
        entry.message_len = copy_truncated(&mut entry.message_buf, args);

        self.next_sequence += 1;
        self.buffer.push(entry.clone());
        entry
    }

    fn count(&self) -> usize {
        self.buffer.len()
    }
}

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

/// Console sink: called with every entry after it is recorded.
pub type ConsoleSink = fn(&LogEntry);

struct KernelLogger {
    service: Mutex<LogService>,
    console: Once<ConsoleSink>,
}

impl KernelLogger {
    fn record(&self, level: Level, subsystem: &str, args: fmt::Arguments<'_>) {
        let entry = self.service.lock().log(level, subsystem, args);
        if let Some(sink) = self.console.get() {
            sink(&entry);
        }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let subsystem = record.target().rsplit("::").next().unwrap_or("");
        self.record(record.level(), subsystem, *record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger {
    service: Mutex::new(LogService::new()),
    console: Once::new(),
};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Install the log service as the `log` backend and set the level filter.
///
/// The first call installs the logger; later calls only change the filter.
/// Returns `true` if this call installed it.
pub fn log_init(level: LevelFilter) -> bool {
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(level);
    installed
}

/// Route every recorded entry to `sink` as well, outside the buffer lock.
/// Only the first sink registered is kept.
pub fn set_console(sink: ConsoleSink) {
    LOGGER.console.call_once(|| sink);
}

/// Record a structured log entry directly, bypassing the level filter.
pub fn klog(level: Level, subsystem: &str, message: &str) {
    LOGGER.record(level, subsystem, format_args!("{}", message));
}

/// Iterate over all buffered log entries from oldest to newest, calling `f`
/// for each. Returns the number of entries visited.
pub fn log_drain<F: FnMut(&LogEntry)>(mut f: F) -> usize {
    let service = LOGGER.service.lock();
    let n = service.buffer.len();
    for i in 0..n {
        if let Some(entry) = service.buffer.get(i) {
            f(entry);
        }
    }
    n
}

/// Return the number of entries currently in the log buffer.
pub fn log_count() -> usize {
    LOGGER.service.lock().count()
}
