//! Consumers attached to a dispatcher and their flow-control accounting.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::dispatch::cursor::TransportRef;
use crate::types::{ConsumerId, Epoch, KeySharedMeta, Position, SubType};

/// A client endpoint subscribed through a dispatcher.
///
/// The dispatcher references consumers through `Arc<Consumer>`; identity,
/// declared subscription type and routing preferences are fixed at creation.
/// Credits and unacked counts are not stored here: they belong to the
/// dispatcher's [`ConsumerFlowController`] so that every update happens
/// under the dispatcher's lock.
pub struct Consumer {
    id: ConsumerId,
    name: String,
    sub_type: SubType,
    priority_level: u32,
    key_shared_meta: Option<KeySharedMeta>,
    transport: TransportRef,
    connected: AtomicBool,
    epoch: AtomicU64,
}

impl Consumer {
    pub fn new(
        id: impl Into<ConsumerId>,
        name: impl Into<String>,
        sub_type: SubType,
        transport: TransportRef,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sub_type,
            priority_level: 0,
            key_shared_meta: None,
            transport,
            connected: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
        }
    }

    /// Lower values are preferred when picking a failover active consumer.
    pub fn with_priority_level(mut self, priority_level: u32) -> Self {
        self.priority_level = priority_level;
        self
    }

    pub fn with_key_shared_meta(mut self, meta: KeySharedMeta) -> Self {
        self.key_shared_meta = Some(meta);
        self
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub_type(&self) -> SubType {
        self.sub_type
    }

    pub fn priority_level(&self) -> u32 {
        self.priority_level
    }

    pub fn key_shared_meta(&self) -> Option<&KeySharedMeta> {
        self.key_shared_meta.as_ref()
    }

    pub fn allows_out_of_order_delivery(&self) -> bool {
        self.key_shared_meta
            .as_ref()
            .is_some_and(|meta| meta.allow_out_of_order_delivery)
    }

    pub fn transport(&self) -> &TransportRef {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_writable(&self) -> bool {
        self.is_connected() && self.transport.is_writable()
    }

    /// Latest redelivery epoch the client has sent.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    /// Record a client redelivery epoch.
    ///
    /// Returns false when `epoch` is older than one already seen, meaning the
    /// request that carried it is stale.
    pub fn advance_epoch(&self, epoch: Epoch) -> bool {
        let mut current = self.epoch.load(Ordering::Acquire);
        loop {
            if epoch.0 < current {
                return false;
            }
            match self.epoch.compare_exchange_weak(
                current,
                epoch.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sub_type", &self.sub_type)
            .field("priority_level", &self.priority_level)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Per-consumer credit and unacked accounting.
///
/// `permits` only grows through flow requests and only shrinks through
/// sends, so a consumer never receives more than it asked for.
///
/// Pending acks remember the sticky key hash they were sent with, so the
/// dispatcher can tell which keys a consumer still holds unacknowledged.
#[derive(Debug, Clone, Default)]
pub struct ConsumerFlowController {
    permits: u64,
    pending_acks: BTreeMap<Position, Option<u32>>,
    held_keys: HashMap<u32, usize>,
    max_unacked: u64,
}

impl ConsumerFlowController {
    pub fn new(max_unacked: u64) -> Self {
        Self {
            max_unacked,
            ..Default::default()
        }
    }

    pub fn permits(&self) -> u64 {
        self.permits
    }

    pub fn add_permits(&mut self, n: u64) {
        self.permits = self.permits.saturating_add(n);
    }

    pub fn unacked(&self) -> u64 {
        self.pending_acks.len() as u64
    }

    /// True once the consumer holds its unacked ceiling (0 = unlimited).
    pub fn is_blocked(&self) -> bool {
        self.max_unacked > 0 && self.unacked() >= self.max_unacked
    }

    /// Entries this consumer may receive right now.
    pub fn available(&self) -> u64 {
        if self.max_unacked == 0 {
            return self.permits;
        }
        let headroom = self.max_unacked.saturating_sub(self.unacked());
        self.permits.min(headroom)
    }

    /// Consume one permit for an entry that was accepted by the transport.
    pub fn record_sent(&mut self, position: Position, key_hash: Option<u32>) {
        self.permits = self.permits.saturating_sub(1);
        if let Some(previous) = self.pending_acks.insert(position, key_hash) {
            self.release_key(previous);
        }
        if let Some(hash) = key_hash {
            *self.held_keys.entry(hash).or_insert(0) += 1;
        }
    }

    /// Returns true if the position was pending on this consumer.
    pub fn record_ack(&mut self, position: &Position) -> bool {
        match self.pending_acks.remove(position) {
            Some(key_hash) => {
                self.release_key(key_hash);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, position: &Position) -> bool {
        self.pending_acks.contains_key(position)
    }

    pub fn pending_acks(&self) -> impl Iterator<Item = &Position> {
        self.pending_acks.keys()
    }

    /// True while an entry with this key hash waits for an ack here.
    pub fn holds_key(&self, key_hash: u32) -> bool {
        self.held_keys.contains_key(&key_hash)
    }

    /// Drop every pending ack, returning the positions in log order.
    pub fn take_pending(&mut self) -> Vec<Position> {
        self.held_keys.clear();
        std::mem::take(&mut self.pending_acks).into_keys().collect()
    }

    /// Drop pending acks at or below `position`. Returns how many were removed.
    pub fn remove_up_to(&mut self, position: Position) -> usize {
        let keep = self.pending_acks.split_off(&position.next());
        let removed = std::mem::replace(&mut self.pending_acks, keep);
        for key_hash in removed.values() {
            self.release_key(*key_hash);
        }
        removed.len()
    }

    fn release_key(&mut self, key_hash: Option<u32>) {
        if let Some(hash) = key_hash
            && let Some(count) = self.held_keys.get_mut(&hash)
        {
            *count -= 1;
            if *count == 0 {
                self.held_keys.remove(&hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits_and_sends() {
        let mut flow = ConsumerFlowController::new(0);
        flow.add_permits(2);
        assert_eq!(flow.available(), 2);
        flow.record_sent(Position::new(1, 0), None);
        flow.record_sent(Position::new(1, 1), None);
        assert_eq!(flow.permits(), 0);
        assert_eq!(flow.unacked(), 2);
        assert_eq!(flow.available(), 0);
    }

    #[test]
    fn test_unacked_ceiling_blocks() {
        let mut flow = ConsumerFlowController::new(1);
        flow.add_permits(10);
        assert_eq!(flow.available(), 1);
        flow.record_sent(Position::new(1, 0), None);
        assert!(flow.is_blocked());
        assert_eq!(flow.available(), 0);
        assert!(flow.record_ack(&Position::new(1, 0)));
        assert!(!flow.is_blocked());
        assert!(!flow.record_ack(&Position::new(1, 0)));
    }

    #[test]
    fn test_remove_up_to() {
        let mut flow = ConsumerFlowController::new(0);
        flow.add_permits(5);
        for entry in 0..5 {
            flow.record_sent(Position::new(3, entry), Some(entry as u32 % 2));
        }
        assert_eq!(flow.remove_up_to(Position::new(3, 2)), 3);
        let left: Vec<_> = flow.pending_acks().copied().collect();
        assert_eq!(left, vec![Position::new(3, 3), Position::new(3, 4)]);
        assert!(flow.holds_key(0));
        assert!(flow.holds_key(1));
    }

    #[test]
    fn test_held_keys_follow_pending_acks() {
        let mut flow = ConsumerFlowController::new(0);
        flow.add_permits(3);
        flow.record_sent(Position::new(1, 0), Some(7));
        flow.record_sent(Position::new(1, 1), Some(7));
        flow.record_sent(Position::new(1, 2), Some(9));
        assert!(flow.holds_key(7));

        flow.record_ack(&Position::new(1, 0));
        assert!(flow.holds_key(7));
        flow.record_ack(&Position::new(1, 1));
        assert!(!flow.holds_key(7));
        assert!(flow.holds_key(9));

        assert_eq!(flow.take_pending(), vec![Position::new(1, 2)]);
        assert!(!flow.holds_key(9));
    }
}
