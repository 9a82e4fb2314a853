//! Entity tag generation
//!
//! Tags must be unique per publication across restarts and across the
//! cluster. The hostname scopes them to this node, the timestamp triple
//! scopes them in time and the per-process counter breaks ties within a
//! microsecond.

use crate::domain::shared::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Mints entity tags for the presence event processor
pub struct EtagGenerator {
    hostname: String,
    counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl EtagGenerator {
    pub fn new(hostname: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hostname: hostname.into(),
            counter: AtomicU64::new(0),
            clock,
        }
    }

    pub fn generate(&self) -> String {
        let now = self.clock.now();
        let seconds = now.timestamp();
        let megaseconds = seconds / 1_000_000;
        let remainder = seconds % 1_000_000;
        let micros = now.timestamp_subsec_micros();
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{}-{}",
            self.hostname, megaseconds, remainder, micros, n
        )
    }
}
