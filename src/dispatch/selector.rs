//! Consumer selection per subscription type.
//!
//! The dispatcher shares one dispatch loop across every subscription type;
//! only the question "which consumer gets this entry" differs:
//!
//! | Type | Selector | Rule |
//! |------|----------|------|
//! | Exclusive, Failover | `SingleActive` | one active consumer, by priority then attach order |
//! | Shared | `RoundRobin` | next consumer in attach order that has credit |
//! | Key_Shared | `KeyShared` | owner of the entry's key hash (ring or declared ranges) |

use std::sync::Arc;

use conhash::{ConsistentHash, Node};

use crate::dispatch::consumer::Consumer;
use crate::error::{Error, Result};
use crate::types::{ConsumerId, HashRange, KeySharedMode, SubType};

/// Active consumer before and after a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveChange {
    pub previous: Option<ConsumerId>,
    pub current: Option<ConsumerId>,
}

pub(crate) enum ConsumerSelector {
    SingleActive(SingleActiveSelector),
    RoundRobin(RoundRobinSelector),
    KeyShared(KeySharedSelector),
}

impl ConsumerSelector {
    pub(crate) fn for_sub_type(
        sub_type: SubType,
        partition_index: Option<u32>,
        key_shared_mode: KeySharedMode,
        virtual_nodes: usize,
    ) -> Self {
        match sub_type {
            SubType::Exclusive | SubType::Failover => {
                ConsumerSelector::SingleActive(SingleActiveSelector::new(partition_index))
            }
            SubType::Shared => ConsumerSelector::RoundRobin(RoundRobinSelector::default()),
            SubType::KeyShared => {
                ConsumerSelector::KeyShared(KeySharedSelector::new(key_shared_mode, virtual_nodes))
            }
        }
    }

    /// Register a consumer. Returns the active-consumer change, if any.
    pub(crate) fn add_consumer(
        &mut self,
        subscription: &str,
        consumer: &Arc<Consumer>,
    ) -> Result<Option<ActiveChange>> {
        match self {
            ConsumerSelector::SingleActive(s) => Ok(s.add(consumer)),
            ConsumerSelector::RoundRobin(s) => {
                s.add(consumer.id());
                Ok(None)
            }
            ConsumerSelector::KeyShared(s) => {
                s.add(subscription, consumer)?;
                Ok(None)
            }
        }
    }

    pub(crate) fn remove_consumer(&mut self, id: ConsumerId) -> Option<ActiveChange> {
        match self {
            ConsumerSelector::SingleActive(s) => s.remove(id),
            ConsumerSelector::RoundRobin(s) => {
                s.remove(id);
                None
            }
            ConsumerSelector::KeyShared(s) => {
                s.remove(id);
                None
            }
        }
    }

    /// Pick the consumer for an entry with `key_hash`.
    ///
    /// `eligible` reports whether a consumer can take one more entry now.
    /// Returns `None` when the entry has to wait.
    pub(crate) fn select(
        &mut self,
        key_hash: u32,
        eligible: &dyn Fn(ConsumerId) -> bool,
    ) -> Option<ConsumerId> {
        match self {
            ConsumerSelector::SingleActive(s) => s.active().filter(|id| eligible(*id)),
            ConsumerSelector::RoundRobin(s) => s.next(eligible),
            ConsumerSelector::KeyShared(s) => s.owner(key_hash).filter(|id| eligible(*id)),
        }
    }

    pub(crate) fn active(&self) -> Option<ConsumerId> {
        match self {
            ConsumerSelector::SingleActive(s) => s.active(),
            _ => None,
        }
    }

    /// Owner of `key_hash` regardless of credit. Only key-shared routes by key.
    pub(crate) fn key_owner(&self, key_hash: u32) -> Option<ConsumerId> {
        match self {
            ConsumerSelector::KeyShared(s) => s.owner(key_hash),
            _ => None,
        }
    }
}

// =============================================================================
// Exclusive / Failover
// =============================================================================

pub(crate) struct SingleActiveSelector {
    /// (priority level, attach sequence, id), kept sorted.
    ranked: Vec<(u32, u64, ConsumerId)>,
    next_seq: u64,
    partition_index: Option<u32>,
    active: Option<ConsumerId>,
}

impl SingleActiveSelector {
    fn new(partition_index: Option<u32>) -> Self {
        Self {
            ranked: Vec::new(),
            next_seq: 0,
            partition_index,
            active: None,
        }
    }

    fn add(&mut self, consumer: &Arc<Consumer>) -> Option<ActiveChange> {
        self.ranked
            .push((consumer.priority_level(), self.next_seq, consumer.id()));
        self.next_seq += 1;
        self.ranked.sort_unstable();
        self.recompute()
    }

    fn remove(&mut self, id: ConsumerId) -> Option<ActiveChange> {
        self.ranked.retain(|(_, _, c)| *c != id);
        self.recompute()
    }

    fn active(&self) -> Option<ConsumerId> {
        self.active
    }

    fn recompute(&mut self) -> Option<ActiveChange> {
        let current = self.pick();
        if current == self.active {
            return None;
        }
        let change = ActiveChange {
            previous: self.active,
            current,
        };
        self.active = current;
        Some(change)
    }

    fn pick(&self) -> Option<ConsumerId> {
        let (top_priority, _, first) = *self.ranked.first()?;
        match self.partition_index {
            None => Some(first),
            Some(index) => {
                let group: Vec<ConsumerId> = self
                    .ranked
                    .iter()
                    .take_while(|(priority, _, _)| *priority == top_priority)
                    .map(|(_, _, id)| *id)
                    .collect();
                Some(group[index as usize % group.len()])
            }
        }
    }
}

// =============================================================================
// Shared
// =============================================================================

/// Round robin in attach order.
///
/// A consumer without credit is skipped and the scan continues with the
/// next one; after a hit, the scan resumes just past the consumer that
/// received the entry.
#[derive(Default)]
pub(crate) struct RoundRobinSelector {
    consumers: Vec<ConsumerId>,
    next: usize,
}

impl RoundRobinSelector {
    fn add(&mut self, id: ConsumerId) {
        self.consumers.push(id);
    }

    fn remove(&mut self, id: ConsumerId) {
        if let Some(index) = self.consumers.iter().position(|c| *c == id) {
            self.consumers.remove(index);
            if index < self.next {
                self.next -= 1;
            }
            if self.next >= self.consumers.len() {
                self.next = 0;
            }
        }
    }

    fn next(&mut self, eligible: &dyn Fn(ConsumerId) -> bool) -> Option<ConsumerId> {
        let n = self.consumers.len();
        for offset in 0..n {
            let index = (self.next + offset) % n;
            let id = self.consumers[index];
            if eligible(id) {
                self.next = (index + 1) % n;
                return Some(id);
            }
        }
        None
    }
}

// =============================================================================
// Key_Shared
// =============================================================================

#[derive(Clone)]
struct RingNode {
    id: ConsumerId,
    name: String,
}

impl Node for RingNode {
    fn name(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }
}

pub(crate) struct KeySharedSelector {
    mode: KeySharedMode,
    virtual_nodes: usize,
    ring: ConsistentHash<RingNode>,
    ring_nodes: Vec<RingNode>,
    ranges: Vec<(HashRange, ConsumerId)>,
}

impl KeySharedSelector {
    fn new(mode: KeySharedMode, virtual_nodes: usize) -> Self {
        Self {
            mode,
            virtual_nodes: virtual_nodes.max(1),
            ring: ConsistentHash::new(),
            ring_nodes: Vec::new(),
            ranges: Vec::new(),
        }
    }

    fn add(&mut self, subscription: &str, consumer: &Arc<Consumer>) -> Result<()> {
        let declared = consumer
            .key_shared_meta()
            .map(|meta| meta.mode)
            .unwrap_or_default();
        let reject = |reason: String| Error::ConsumerAssign {
            subscription: subscription.to_string(),
            consumer_id: consumer.id(),
            reason,
        };

        if declared != self.mode {
            return Err(reject(format!(
                "subscription uses {} mode, consumer requested {}",
                self.mode, declared
            )));
        }

        match self.mode {
            KeySharedMode::AutoSplit => {
                let node = RingNode {
                    id: consumer.id(),
                    name: consumer.name().to_string(),
                };
                self.ring.add(&node, self.virtual_nodes);
                self.ring_nodes.push(node);
            }
            KeySharedMode::Sticky => {
                let requested = consumer
                    .key_shared_meta()
                    .map(|meta| meta.hash_ranges.clone())
                    .unwrap_or_default();
                if requested.is_empty() {
                    return Err(reject("no hash ranges declared".to_string()));
                }
                for (i, range) in requested.iter().enumerate() {
                    if !range.is_valid() {
                        return Err(reject(format!("invalid hash range {}", range)));
                    }
                    if requested[..i].iter().any(|other| other.intersects(range)) {
                        return Err(reject(format!("hash range {} overlaps itself", range)));
                    }
                    if let Some((taken, owner)) =
                        self.ranges.iter().find(|(taken, _)| taken.intersects(range))
                    {
                        return Err(reject(format!(
                            "hash range {} conflicts with {} held by consumer {}",
                            range, taken, owner
                        )));
                    }
                }
                for range in requested {
                    self.ranges.push((range, consumer.id()));
                }
                self.ranges.sort_unstable_by_key(|(range, _)| range.start);
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: ConsumerId) {
        if let Some(index) = self.ring_nodes.iter().position(|node| node.id == id) {
            let node = self.ring_nodes.remove(index);
            self.ring.remove(&node);
        }
        self.ranges.retain(|(_, owner)| *owner != id);
    }

    fn owner(&self, key_hash: u32) -> Option<ConsumerId> {
        match self.mode {
            KeySharedMode::AutoSplit => {
                if self.ring_nodes.is_empty() {
                    return None;
                }
                self.ring.get(&key_hash.to_be_bytes()).map(|node| node.id)
            }
            KeySharedMode::Sticky => self
                .ranges
                .iter()
                .find(|(range, _)| range.contains(key_hash))
                .map(|(_, owner)| *owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u64]) -> Vec<ConsumerId> {
        v.iter().map(|i| ConsumerId(*i)).collect()
    }

    #[test]
    fn test_round_robin_skip_and_retry_next() {
        let mut rr = RoundRobinSelector::default();
        for id in ids(&[1, 2]) {
            rr.add(id);
        }
        let credits = std::cell::RefCell::new(std::collections::HashMap::from([
            (ConsumerId(1), 2u32),
            (ConsumerId(2), 1u32),
        ]));
        let mut take = || {
            let picked = rr.next(&|id| credits.borrow()[&id] > 0);
            if let Some(id) = picked {
                *credits.borrow_mut().get_mut(&id).unwrap() -= 1;
            }
            picked
        };
        assert_eq!(take(), Some(ConsumerId(1)));
        assert_eq!(take(), Some(ConsumerId(2)));
        assert_eq!(take(), Some(ConsumerId(1)));
        assert_eq!(take(), None);
    }

    #[test]
    fn test_round_robin_remove_keeps_cursor() {
        let mut rr = RoundRobinSelector::default();
        for id in ids(&[1, 2, 3]) {
            rr.add(id);
        }
        assert_eq!(rr.next(&|_| true), Some(ConsumerId(1)));
        assert_eq!(rr.next(&|_| true), Some(ConsumerId(2)));
        rr.remove(ConsumerId(1));
        assert_eq!(rr.next(&|_| true), Some(ConsumerId(3)));
        rr.remove(ConsumerId(3));
        assert_eq!(rr.next(&|_| true), Some(ConsumerId(2)));
    }
}
