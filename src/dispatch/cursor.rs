//! Collaborators the dispatcher talks to.
//!
//! The replicated log and the client connection are owned elsewhere in the
//! broker. The dispatcher only needs the narrow surfaces below, which keeps
//! it testable against in-memory stand-ins.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Entry, Position};

/// Read and acknowledgment position of a subscription in the log.
///
/// Implementations must call back into the owning dispatcher's
/// `cursor_is_reset` and `mark_delete_position_move_forward` hooks when
/// their state changes outside of dispatch (admin reset, expiry, skip).
#[async_trait]
pub trait ManagedCursor: Send + Sync {
    /// Read up to `max_entries` new entries, advancing the read position.
    async fn read_entries(&self, max_entries: usize) -> Result<Vec<Entry>>;

    /// Re-read specific entries for redelivery. Positions that were
    /// already deleted are silently skipped.
    async fn replay_entries(&self, positions: &[Position]) -> Result<Vec<Entry>>;

    /// Acknowledge an individual entry.
    async fn mark_delete(&self, position: Position) -> Result<()>;

    /// Highest position below which every entry is acknowledged.
    async fn mark_delete_position(&self) -> Position;

    /// Move the read position back to just after the mark-delete position.
    async fn rewind(&self) -> Result<()>;

    /// True when unread entries exist past the read position.
    async fn has_more_entries(&self) -> bool;

    /// Entries not yet acknowledged.
    async fn backlog(&self) -> u64;

    /// Persist acknowledgment state.
    async fn flush(&self) -> Result<()>;
}

/// Outbound half of a consumer connection.
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Push entries to the client. Returns how many leading entries were
    /// accepted; the rest are handed back to the dispatcher.
    async fn send_messages(&self, entries: Vec<Entry>) -> Result<usize>;

    /// False while the connection's outbound buffer is full.
    fn is_writable(&self) -> bool;

    /// Tell a failover consumer whether it is now the active one.
    async fn notify_active_consumer_change(&self, is_active: bool);

    /// Close the connection from the broker side.
    async fn disconnect(&self);
}

pub type CursorRef = Arc<dyn ManagedCursor>;
pub type TransportRef = Arc<dyn ConsumerTransport>;
