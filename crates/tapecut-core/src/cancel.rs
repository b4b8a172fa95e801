// crates/tapecut-core/src/cancel.rs
//
// Cooperative cancellation for long-running decode/encode loops.
//
// The loop polls `check()` once per demuxed packet. A token trips either when
// someone calls `cancel()` or when its optional deadline passes. Clones share
// the flag, so the queue can cancel a task whose exporter holds a clone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag:     Arc<AtomicBool>,
    deadline: Option<Instant>,
}

/// Why a token tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    TimedOut,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Cancelled => "cancelled",
            CancelReason::TimedOut  => "timed out",
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that trips on its own `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { flag: Arc::default(), deadline: Some(Instant::now() + timeout) }
    }

    /// A child sharing this token's flag, with an additional deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self {
            flag:     Arc::clone(&self.flag),
            deadline: timeout.map(|t| Instant::now() + t).or(self.deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn check(&self) -> Option<CancelReason> {
        if self.flag.load(Ordering::Relaxed) {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(CancelReason::TimedOut),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_some()
    }
}
