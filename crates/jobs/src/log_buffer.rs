//! Bounded, timestamped job output.

use std::collections::VecDeque;
use std::fmt::Display;

use chrono::{DateTime, Local, TimeZone};

use redline_core::LogLevel;

/// Number of lines a job keeps when no capacity is configured.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Ring buffer of formatted log lines.
///
/// When full, the oldest line is discarded; `dropped()` counts how many were
/// lost since the last clear.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity,
            dropped: 0,
        }
    }

    /// Format `message` with the current local time and append it.
    ///
    /// Returns the stored line.
    pub fn record(&mut self, level: LogLevel, message: &str) -> String {
        let line = format_line(&Local::now(), level, message);
        self.push(line.clone());
        line
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.dropped = 0;
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// `[YYYY-MM-DD HH:MM:SS] LEVEL: message`
pub fn format_line<Tz>(at: &DateTime<Tz>, level: LogLevel, message: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("[{}] {}: {}", at.format("%Y-%m-%d %H:%M:%S"), level, message)
}
