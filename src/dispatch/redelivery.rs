//! Tracking of dispatched-but-unacknowledged entries.
//!
//! Every entry handed to a consumer is recorded here until it is
//! acknowledged. An entry is in one of two states:
//!
//! ```text
//!   mark_dispatched / claim          mark_for_redelivery / defer
//!  ┌─────────────────────────┐      ┌──────────────────────────┐
//!  │                         ▼      │                          ▼
//! Pending                 InFlight ─┘                       Pending
//!     ▲                      │
//!     └──────────────────────┴──── mark_acknowledged ──► (removed)
//! ```
//!
//! Pending entries form the replay pool, iterated in original dispatch
//! order. Each redelivery bumps the entry's epoch so that a claim made with
//! an older epoch is rejected.

use std::collections::{BTreeMap, HashMap};

use crate::types::{Epoch, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InFlight,
    Pending,
}

#[derive(Debug, Clone)]
struct Tracked {
    epoch: Epoch,
    key_hash: Option<u32>,
    dispatch_seq: u64,
    state: EntryState,
}

/// Redelivery bookkeeping for one subscription.
#[derive(Debug, Clone, Default)]
pub struct RedeliveryTracker {
    entries: BTreeMap<Position, Tracked>,
    /// Pending positions keyed by first dispatch sequence.
    pending: BTreeMap<u64, Position>,
    pending_keys: HashMap<u32, usize>,
    next_seq: u64,
}

impl RedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `position` was handed to a consumer.
    ///
    /// A position that is already tracked keeps its dispatch order and
    /// epoch; it simply leaves the replay pool.
    pub fn mark_dispatched(&mut self, position: Position, key_hash: Option<u32>) {
        match self.entries.get(&position).map(|t| (t.state, t.dispatch_seq)) {
            Some((EntryState::Pending, seq)) => self.leave_pending(position, seq),
            Some((EntryState::InFlight, _)) => {}
            None => {
                let seq = self.allocate_seq();
                self.entries.insert(
                    position,
                    Tracked {
                        epoch: Epoch::ZERO,
                        key_hash,
                        dispatch_seq: seq,
                        state: EntryState::InFlight,
                    },
                );
            }
        }
    }

    /// Forget `position`. Acknowledging an unknown position is a no-op.
    ///
    /// Returns true when the position was tracked.
    pub fn mark_acknowledged(&mut self, position: &Position) -> bool {
        let Some(tracked) = self.entries.remove(position) else {
            return false;
        };
        if tracked.state == EntryState::Pending {
            self.pending.remove(&tracked.dispatch_seq);
            self.release_key(tracked.key_hash);
        }
        true
    }

    /// Put `position` back into the replay pool with a new epoch.
    ///
    /// A position already pending is not duplicated, but its epoch still
    /// advances so older claims become stale.
    pub fn mark_for_redelivery(&mut self, position: Position) -> Epoch {
        if let Some(tracked) = self.entries.get_mut(&position) {
            tracked.epoch = tracked.epoch.next();
            let epoch = tracked.epoch;
            if tracked.state == EntryState::InFlight {
                tracked.state = EntryState::Pending;
                let (seq, key) = (tracked.dispatch_seq, tracked.key_hash);
                self.pending.insert(seq, position);
                self.hold_key(key);
            }
            return epoch;
        }

        let seq = self.allocate_seq();
        let epoch = Epoch::ZERO.next();
        self.entries.insert(
            position,
            Tracked {
                epoch,
                key_hash: None,
                dispatch_seq: seq,
                state: EntryState::Pending,
            },
        );
        self.pending.insert(seq, position);
        epoch
    }

    /// Park `position` in the replay pool without bumping its epoch.
    ///
    /// Used when an entry could not be sent this round (no credit, rate
    /// limited, ordering hold, transport refusal).
    pub fn defer(&mut self, position: Position, key_hash: Option<u32>) {
        if let Some(tracked) = self.entries.get_mut(&position) {
            if tracked.state == EntryState::InFlight {
                tracked.state = EntryState::Pending;
                if tracked.key_hash.is_none() {
                    tracked.key_hash = key_hash;
                }
                let (seq, key) = (tracked.dispatch_seq, tracked.key_hash);
                self.pending.insert(seq, position);
                self.hold_key(key);
            }
            return;
        }

        let seq = self.allocate_seq();
        self.entries.insert(
            position,
            Tracked {
                epoch: Epoch::ZERO,
                key_hash,
                dispatch_seq: seq,
                state: EntryState::Pending,
            },
        );
        self.pending.insert(seq, position);
        self.hold_key(key_hash);
    }

    /// Positions waiting for redelivery in original dispatch order.
    ///
    /// The iterator borrows the tracker; call again to restart.
    pub fn pending(&self) -> impl Iterator<Item = Position> + '_ {
        self.pending.values().copied()
    }

    /// Move a pending position to in-flight if `epoch` is still current.
    pub fn claim(&mut self, position: Position, epoch: Epoch) -> bool {
        let Some(tracked) = self.entries.get(&position) else {
            return false;
        };
        if tracked.state != EntryState::Pending || tracked.epoch != epoch {
            return false;
        }
        let seq = tracked.dispatch_seq;
        self.leave_pending(position, seq);
        true
    }

    pub fn epoch(&self, position: &Position) -> Option<Epoch> {
        self.entries.get(position).map(|t| t.epoch)
    }

    pub fn key_hash(&self, position: &Position) -> Option<u32> {
        self.entries.get(position).and_then(|t| t.key_hash)
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.entries.contains_key(position)
    }

    pub fn is_pending(&self, position: &Position) -> bool {
        self.entries
            .get(position)
            .is_some_and(|t| t.state == EntryState::Pending)
    }

    /// True when an entry with this key hash waits in the replay pool.
    pub fn is_key_pending(&self, key_hash: u32) -> bool {
        self.pending_keys.contains_key(&key_hash)
    }

    pub fn pending_key_hashes(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending_keys.keys().copied()
    }

    /// Drop every tracked position at or below `position`.
    pub fn remove_up_to(&mut self, position: Position) -> usize {
        let keep = self.entries.split_off(&position.next());
        let removed = std::mem::replace(&mut self.entries, keep);
        for tracked in removed.values() {
            if tracked.state == EntryState::Pending {
                self.pending.remove(&tracked.dispatch_seq);
                self.release_key(tracked.key_hash);
            }
        }
        removed.len()
    }

    /// Drop pending positions but keep in-flight ones.
    pub fn clear_pending(&mut self) -> usize {
        let positions: Vec<Position> = self.pending.values().copied().collect();
        for position in &positions {
            self.entries.remove(position);
        }
        self.pending.clear();
        self.pending_keys.clear();
        positions.len()
    }

    /// Total tracked positions, in flight and pending.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.pending_keys.clear();
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn leave_pending(&mut self, position: Position, seq: u64) {
        self.pending.remove(&seq);
        if let Some(tracked) = self.entries.get_mut(&position) {
            tracked.state = EntryState::InFlight;
            let key = tracked.key_hash;
            self.release_key(key);
        }
    }

    fn hold_key(&mut self, key_hash: Option<u32>) {
        if let Some(hash) = key_hash {
            *self.pending_keys.entry(hash).or_insert(0) += 1;
        }
    }

    fn release_key(&mut self, key_hash: Option<u32>) {
        if let Some(hash) = key_hash
            && let Some(count) = self.pending_keys.get_mut(&hash)
        {
            *count -= 1;
            if *count == 0 {
                self.pending_keys.remove(&hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(entry: u64) -> Position {
        Position::new(1, entry)
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut tracker = RedeliveryTracker::new();
        tracker.mark_dispatched(pos(1), None);
        assert!(tracker.mark_acknowledged(&pos(1)));
        assert!(!tracker.mark_acknowledged(&pos(1)));
        assert!(tracker.is_empty());
        assert!(!tracker.mark_acknowledged(&pos(99)));
    }

    #[test]
    fn test_redelivery_bumps_epoch_without_duplicates() {
        let mut tracker = RedeliveryTracker::new();
        tracker.mark_dispatched(pos(1), None);
        assert_eq!(tracker.mark_for_redelivery(pos(1)), Epoch(1));
        assert_eq!(tracker.mark_for_redelivery(pos(1)), Epoch(2));
        assert_eq!(tracker.pending().count(), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_stale_claim_rejected() {
        let mut tracker = RedeliveryTracker::new();
        tracker.mark_dispatched(pos(1), None);
        let first = tracker.mark_for_redelivery(pos(1));
        let second = tracker.mark_for_redelivery(pos(1));
        assert!(!tracker.claim(pos(1), first));
        assert!(tracker.claim(pos(1), second));
        assert!(!tracker.is_pending(&pos(1)));
        assert!(!tracker.claim(pos(1), second));
    }

    #[test]
    fn test_pending_keeps_dispatch_order() {
        let mut tracker = RedeliveryTracker::new();
        for entry in [5, 3, 9] {
            tracker.mark_dispatched(pos(entry), None);
        }
        tracker.mark_for_redelivery(pos(9));
        tracker.mark_for_redelivery(pos(5));
        tracker.mark_for_redelivery(pos(3));
        let order: Vec<_> = tracker.pending().collect();
        assert_eq!(order, vec![pos(5), pos(3), pos(9)]);
        // Restartable.
        assert_eq!(tracker.pending().count(), 3);
    }

    #[test]
    fn test_defer_keeps_epoch() {
        let mut tracker = RedeliveryTracker::new();
        tracker.defer(pos(1), Some(7));
        assert_eq!(tracker.epoch(&pos(1)), Some(Epoch::ZERO));
        assert!(tracker.is_key_pending(7));
        assert!(tracker.claim(pos(1), Epoch::ZERO));
        assert!(!tracker.is_key_pending(7));
        tracker.defer(pos(1), Some(7));
        assert_eq!(tracker.epoch(&pos(1)), Some(Epoch::ZERO));
        assert_eq!(tracker.pending_key_hashes().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_remove_up_to_last_entry_of_ledger() {
        let mut tracker = RedeliveryTracker::new();
        let last = Position::new(1, u64::MAX);
        tracker.mark_dispatched(last, None);
        tracker.mark_dispatched(Position::new(2, 0), None);
        assert_eq!(tracker.remove_up_to(last), 1);
        assert!(tracker.contains(&Position::new(2, 0)));
    }

    #[test]
    fn test_remove_up_to_and_clear_pending() {
        let mut tracker = RedeliveryTracker::new();
        for entry in 0..6 {
            tracker.mark_dispatched(pos(entry), Some(entry as u32));
        }
        tracker.mark_for_redelivery(pos(1));
        tracker.mark_for_redelivery(pos(4));
        assert_eq!(tracker.remove_up_to(pos(2)), 3);
        assert_eq!(tracker.pending().collect::<Vec<_>>(), vec![pos(4)]);
        assert!(!tracker.is_key_pending(1));

        assert_eq!(tracker.clear_pending(), 1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.pending_len(), 0);
    }
}
