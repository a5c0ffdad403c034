//! Type-safe wrappers for dispatch primitives.
//!
//! These newtypes keep positions, consumer identifiers and epochs from being
//! mixed up even though they share an integer representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::STICKY_KEY_HASH_RANGE_SIZE;

/// Location of an entry in the replicated log.
///
/// Ordered first by ledger, then by entry within the ledger, which matches
/// the order entries were appended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl Position {
    #[inline]
    pub const fn new(ledger_id: u64, entry_id: u64) -> Self {
        Position {
            ledger_id,
            entry_id,
        }
    }

    /// The position immediately after this one.
    ///
    /// The last entry of a ledger rolls over to the first entry of the next
    /// ledger; `Position::new(u64::MAX, u64::MAX)` is its own successor.
    #[inline]
    pub const fn next(self) -> Self {
        match self.entry_id.checked_add(1) {
            Some(entry_id) => Position {
                ledger_id: self.ledger_id,
                entry_id,
            },
            None => match self.ledger_id.checked_add(1) {
                Some(ledger_id) => Position {
                    ledger_id,
                    entry_id: 0,
                },
                None => self,
            },
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

impl From<(u64, u64)> for Position {
    fn from((ledger_id, entry_id): (u64, u64)) -> Self {
        Position::new(ledger_id, entry_id)
    }
}

/// Identifier of a consumer connection, unique within a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConsumerId(pub u64);

impl ConsumerId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        ConsumerId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConsumerId {
    fn from(value: u64) -> Self {
        ConsumerId(value)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic fencing token.
///
/// Used both for per-position redelivery epochs and for the consumer epoch a
/// client attaches to redelivery requests. A request carrying an older epoch
/// than the one currently recorded is stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const ZERO: Self = Epoch(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Epoch(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription dispatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubType {
    /// A single consumer receives every entry.
    Exclusive,
    /// Several consumers attach, one of them is active at a time.
    Failover,
    /// Entries are spread round-robin over all consumers.
    Shared,
    /// Entries are routed by the hash of their key.
    KeyShared,
}

impl SubType {
    /// True for policies where exactly one consumer receives entries.
    pub fn is_single_active(&self) -> bool {
        matches!(self, SubType::Exclusive | SubType::Failover)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubType::Exclusive => "Exclusive",
            SubType::Failover => "Failover",
            SubType::Shared => "Shared",
            SubType::KeyShared => "Key_Shared",
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "exclusive" => Ok(SubType::Exclusive),
            "failover" => Ok(SubType::Failover),
            "shared" => Ok(SubType::Shared),
            "keyshared" => Ok(SubType::KeyShared),
            _ => Err(format!(
                "Unknown subscription type '{}'. Valid types: exclusive, failover, shared, key_shared",
                s
            )),
        }
    }
}

/// How a key-shared subscription maps key hashes to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeySharedMode {
    /// The broker spreads the hash space over consumers with a consistent hash ring.
    #[default]
    AutoSplit,
    /// Every consumer declares the hash ranges it wants.
    Sticky,
}

impl fmt::Display for KeySharedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySharedMode::AutoSplit => write!(f, "auto_split"),
            KeySharedMode::Sticky => write!(f, "sticky"),
        }
    }
}

/// Inclusive range of sticky key hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub const fn new(start: u32, end: u32) -> Self {
        HashRange { start, end }
    }

    /// The whole hash space.
    pub const fn full() -> Self {
        HashRange {
            start: 0,
            end: STICKY_KEY_HASH_RANGE_SIZE - 1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.end < STICKY_KEY_HASH_RANGE_SIZE
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.start <= hash && hash <= self.end
    }

    pub fn intersects(&self, other: &HashRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Key-shared options a consumer declares when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeySharedMeta {
    pub mode: KeySharedMode,
    /// Ranges requested in [`KeySharedMode::Sticky`]; ignored otherwise.
    pub hash_ranges: Vec<HashRange>,
    /// When set, entries for a key are not held back behind older entries
    /// for the same key waiting to be redelivered.
    pub allow_out_of_order_delivery: bool,
}

impl KeySharedMeta {
    pub fn auto_split() -> Self {
        KeySharedMeta::default()
    }

    pub fn sticky(hash_ranges: Vec<HashRange>) -> Self {
        KeySharedMeta {
            mode: KeySharedMode::Sticky,
            hash_ranges,
            allow_out_of_order_delivery: false,
        }
    }

    pub fn with_out_of_order_delivery(mut self, allow: bool) -> Self {
        self.allow_out_of_order_delivery = allow;
        self
    }
}

/// Metadata the producer attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    /// Publish time in milliseconds since the Unix epoch.
    pub publish_time_ms: u64,
    /// Earliest delivery time in milliseconds since the Unix epoch.
    pub deliver_at_time_ms: Option<u64>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Bytes>,
    /// Number of messages batched into the entry.
    pub num_messages: u32,
}

impl MessageMetadata {
    pub fn new(producer_name: impl Into<String>, sequence_id: u64) -> Self {
        MessageMetadata {
            producer_name: producer_name.into(),
            sequence_id,
            num_messages: 1,
            ..Default::default()
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<Bytes>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_deliver_at(mut self, deliver_at_time_ms: u64) -> Self {
        self.deliver_at_time_ms = Some(deliver_at_time_ms);
        self
    }

    pub fn with_publish_time(mut self, publish_time_ms: u64) -> Self {
        self.publish_time_ms = publish_time_ms;
        self
    }

    /// Key used for key-shared routing: the ordering key when present, the
    /// partition key otherwise, empty when the message has neither.
    pub fn sticky_key(&self) -> &[u8] {
        if let Some(key) = &self.ordering_key {
            return key.as_ref();
        }
        match &self.partition_key {
            Some(key) => key.as_bytes(),
            None => &[],
        }
    }
}

/// An entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub position: Position,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(position: Position, metadata: MessageMetadata, payload: impl Into<Bytes>) -> Self {
        Entry {
            position,
            metadata,
            payload: payload.into(),
        }
    }

    /// Payload size in bytes, the unit the byte rate limit is charged in.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}
