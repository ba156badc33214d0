use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::Ms;

/// Source of "now" for the engine. Injected so lead-time and completion
/// checks are deterministic under test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        ms_since_epoch(SystemTime::now())
    }
}

/// Signed, so a host clock set before 1970 reads as the past it claims to be
/// rather than as the epoch.
fn ms_since_epoch(t: SystemTime) -> Ms {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as Ms,
        Err(e) => {
            tracing::warn!("system clock is {:?} before the Unix epoch", e.duration());
            -(e.duration().as_millis() as Ms)
        }
    }
}

/// Manually driven clock for tests and benches.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}
