//! Objection tracking for task phases.
//!
//! An [`Objection`] counts outstanding "keep running" requests against one
//! phase node. Components raise and drop objections from their spawned
//! activities; the executor waits for the total to reach zero before the
//! node may leave `Executing`.
//!
//! Counts are tracked per source so that a drop without a matching raise
//! can be detected. Such a drop is clamped at zero and reported as a
//! warning; it never makes the count negative and never fails the run.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counts {
    per_source: HashMap<String, u32>,
    total: u32,
    raised: u64,
    dropped: u64,
    misuse: u32,
}

/// Counted objection for a single phase node.
#[derive(Debug)]
pub struct Objection {
    /// Label used in log records (e.g. "uvm.main")
    label: String,
    counts: Mutex<Counts>,
    total_tx: watch::Sender<u32>,
}

impl Objection {
    /// Create an objection with a zero count.
    pub fn new(label: impl Into<String>) -> Self {
        let (total_tx, _) = watch::channel(0);
        Self {
            label: label.into(),
            counts: Mutex::new(Counts::default()),
            total_tx,
        }
    }

    /// The label this objection reports under.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn counts(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise `count` objections on behalf of `source`.
    pub fn raise(&self, source: &str, count: u32) {
        if count == 0 {
            return;
        }
        let total = {
            let mut counts = self.counts();
            *counts.per_source.entry(source.to_string()).or_insert(0) += count;
            counts.total += count;
            counts.raised += u64::from(count);
            counts.total
        };
        debug!(objection = %self.label, source, count, total, "objection raised");
        self.total_tx.send_replace(total);
    }

    /// Drop `count` objections on behalf of `source`.
    ///
    /// Returns the number actually dropped. A drop larger than the source's
    /// outstanding raises is clamped and logged as a warning.
    pub fn lower(&self, source: &str, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let (dropped, total, outstanding) = {
            let mut counts = self.counts();
            let outstanding = counts.per_source.get(source).copied().unwrap_or(0);
            let dropped = count.min(outstanding);
            if dropped == outstanding {
                counts.per_source.remove(source);
            } else if let Some(n) = counts.per_source.get_mut(source) {
                *n -= dropped;
            }
            counts.total -= dropped;
            counts.dropped += u64::from(dropped);
            if dropped < count {
                counts.misuse += 1;
            }
            (dropped, counts.total, outstanding)
        };

        if dropped < count {
            warn!(
                objection = %self.label,
                source,
                requested = count,
                outstanding,
                "objection dropped more times than raised; count clamped at zero"
            );
        } else {
            debug!(objection = %self.label, source, count, total, "objection dropped");
        }
        self.total_tx.send_replace(total);
        dropped
    }

    /// Current total objection count.
    pub fn count(&self) -> u32 {
        self.counts().total
    }

    /// Outstanding objections raised by a single source.
    pub fn source_count(&self, source: &str) -> u32 {
        self.counts().per_source.get(source).copied().unwrap_or(0)
    }

    /// Cumulative number of objections raised.
    pub fn total_raised(&self) -> u64 {
        self.counts().raised
    }

    /// Cumulative number of objections dropped.
    pub fn total_dropped(&self) -> u64 {
        self.counts().dropped
    }

    /// Number of drops that exceeded the source's outstanding raises.
    pub fn misuse_count(&self) -> u32 {
        self.counts().misuse
    }

    /// Subscribe to changes of the total count.
    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.total_tx.subscribe()
    }

    /// Wait until the total count is zero.
    pub async fn wait_for_zero(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|total| *total == 0).await.map(|_| ());
    }

    /// Reset all counts, returning the total that was outstanding.
    pub fn clear(&self) -> u32 {
        let outstanding = {
            let mut counts = self.counts();
            let outstanding = counts.total;
            counts.per_source.clear();
            counts.total = 0;
            outstanding
        };
        self.total_tx.send_replace(0);
        outstanding
    }
}
