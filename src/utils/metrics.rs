use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Success and failure counters shared by every processing task of a run
#[derive(Debug)]
pub struct PageCounters {
    started_at: DateTime<Utc>,
    started: Instant,
    success: AtomicU64,
    fail: AtomicU64,
}

/// Point-in-time copy of [`PageCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    pub started_at: DateTime<Utc>,
    pub success: u64,
    pub fail: u64,
    pub elapsed_ms: u64,
}

impl PageStats {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    /// Pages finished per second since the counters were created
    pub fn rate(&self) -> f64 {
        let seconds = (self.elapsed_ms as f64 / 1000.0).max(0.001);
        self.total() as f64 / seconds
    }
}

impl Default for PageCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCounters {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
        }
    }

    pub fn page_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_fail(&self) {
        self.fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PageStats {
        PageStats {
            started_at: self.started_at,
            success: self.success(),
            fail: self.failure(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
