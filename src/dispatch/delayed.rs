//! Holding back entries until their deliver-at time.
//!
//! Delivery times are rounded up to the configured tick so that entries due
//! close together share one bucket and one timer wakeup.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::Position;

/// Wall-clock milliseconds since the Unix epoch, the unit deliver-at times use.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory index of delayed entries keyed by delivery bucket.
#[derive(Debug, Clone)]
pub struct DelayedDeliveryTracker {
    tick_ms: u64,
    buckets: BTreeMap<u64, BTreeSet<Position>>,
    count: usize,
}

impl DelayedDeliveryTracker {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick_ms: (tick.as_millis() as u64).max(1),
            buckets: BTreeMap::new(),
            count: 0,
        }
    }

    /// True when a message due at `deliver_at_ms` must still be held at `now_ms`.
    pub fn is_delayed(deliver_at_ms: u64, now_ms: u64) -> bool {
        deliver_at_ms > now_ms
    }

    fn bucket_of(&self, deliver_at_ms: u64) -> u64 {
        deliver_at_ms.div_ceil(self.tick_ms).saturating_mul(self.tick_ms)
    }

    /// Hold `position` until `deliver_at_ms`.
    ///
    /// Returns false, without tracking anything, when the message is
    /// already due.
    pub fn add_message(&mut self, position: Position, deliver_at_ms: u64, now_ms: u64) -> bool {
        if !Self::is_delayed(deliver_at_ms, now_ms) {
            return false;
        }
        let bucket = self.bucket_of(deliver_at_ms);
        if self.buckets.entry(bucket).or_default().insert(position) {
            self.count += 1;
        }
        true
    }

    /// Remove and return up to `max` entries due at `now_ms`, in log order
    /// within each bucket and bucket order across buckets.
    pub fn scheduled_messages(&mut self, now_ms: u64, max: usize) -> Vec<Position> {
        let mut due = Vec::new();
        while due.len() < max {
            let Some(mut entry) = self.buckets.first_entry() else {
                break;
            };
            if *entry.key() > now_ms {
                break;
            }
            let positions = entry.get_mut();
            while due.len() < max {
                match positions.pop_first() {
                    Some(position) => due.push(position),
                    None => break,
                }
            }
            if positions.is_empty() {
                entry.remove();
            }
        }
        self.count -= due.len();
        due
    }

    pub fn has_message_available(&self, now_ms: u64) -> bool {
        self.buckets
            .first_key_value()
            .is_some_and(|(bucket, _)| *bucket <= now_ms)
    }

    /// Earliest time a held entry becomes deliverable.
    pub fn next_wakeup_time(&self) -> Option<u64> {
        self.buckets.first_key_value().map(|(bucket, _)| *bucket)
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.buckets.values().any(|set| set.contains(position))
    }

    pub fn number_of_delayed_messages(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.count = 0;
    }
}
