// In-memory ring-buffer log sink for the `/logs` operator surface.
// Grounded on `engine/http.rs::RequestAuditLog` — same fixed-capacity,
// wrap-around `Vec` with a write-head index, guarded by a parking_lot
// Mutex. `log::Log` is implemented directly so ordinary `log::info!`/
// `log::warn!` call sites feed both stderr (via env_logger) and this
// buffer without call-site changes.

use log::{Log, Metadata, Record};
use parking_lot::Mutex;
use std::sync::LazyLock;

const LOG_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

struct LogRing {
    entries: Vec<LogLine>,
    head: usize,
}

impl LogRing {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(LOG_RING_CAPACITY),
            head: 0,
        }
    }

    fn push(&mut self, line: LogLine) {
        if self.entries.len() < LOG_RING_CAPACITY {
            self.entries.push(line);
        } else {
            self.entries[self.head] = line;
            self.head = (self.head + 1) % LOG_RING_CAPACITY;
        }
    }

    fn recent(&self, limit: usize) -> Vec<LogLine> {
        let len = self.entries.len();
        if len == 0 {
            return vec![];
        }
        let count = limit.min(len);
        let mut result = Vec::with_capacity(count);
        let mut idx = if len < LOG_RING_CAPACITY {
            len - 1
        } else {
            (self.head + LOG_RING_CAPACITY - 1) % LOG_RING_CAPACITY
        };
        for _ in 0..count {
            result.push(self.entries[idx].clone());
            idx = (idx + LOG_RING_CAPACITY - 1) % LOG_RING_CAPACITY;
        }
        result
    }
}

static RING: LazyLock<Mutex<LogRing>> = LazyLock::new(|| Mutex::new(LogRing::new()));

pub fn recent_logs(limit: usize) -> Vec<LogLine> {
    RING.lock().recent(limit)
}

/// A `log::Log` implementation that forwards to `env_logger`'s formatter
/// and also appends to the ring buffer, so both `RUST_LOG`-driven stderr
/// output and the `/logs` endpoint stay in sync.
pub struct RingBufferLogger {
    inner: env_logger::Logger,
}

impl RingBufferLogger {
    pub fn init() {
        let inner = env_logger::Builder::from_default_env().build();
        let level = inner.filter();
        let logger = RingBufferLogger { inner };
        log::set_boxed_logger(Box::new(logger)).expect("logger already set");
        log::set_max_level(level);
    }
}

impl Log for RingBufferLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        RING.lock().push(LogLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_around_at_capacity() {
        let mut ring = LogRing::new();
        for i in 0..(LOG_RING_CAPACITY + 5) {
            ring.push(LogLine {
                timestamp: "t".into(),
                level: "INFO".into(),
                target: "test".into(),
                message: format!("msg-{i}"),
            });
        }
        let recent = ring.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, format!("msg-{}", LOG_RING_CAPACITY + 4));
    }
}
