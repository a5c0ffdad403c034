//! In-memory collaborators for testing.
//!
//! [`InMemoryCursor`] keeps a whole log in a `BTreeMap` and
//! [`RecordingTransport`] records everything a consumer is sent, so
//! dispatcher behavior can be asserted without a storage layer or sockets.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! pulsaresque = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::dispatch::cursor::{ConsumerTransport, ManagedCursor};
use crate::error::{Error, Result};
use crate::types::{Entry, MessageMetadata, Position};

/// Ledger every appended entry lands in.
pub const MEMORY_LEDGER_ID: u64 = 1;

#[derive(Debug, Default)]
struct CursorState {
    entries: BTreeMap<Position, Entry>,
    deleted: BTreeSet<Position>,
    read_position: Position,
    mark_delete: Position,
    next_entry_id: u64,
}

impl CursorState {
    fn is_live(&self, position: &Position) -> bool {
        self.entries.contains_key(position) && !self.deleted.contains(position)
    }

    /// Advance the mark-delete position over the contiguous deleted prefix.
    fn advance_mark_delete(&mut self) {
        let mut next = self.mark_delete;
        for position in self.entries.range(self.mark_delete.next()..).map(|(p, _)| *p) {
            if !self.deleted.contains(&position) {
                break;
            }
            next = position;
        }
        self.mark_delete = next;
    }
}

/// A managed cursor over a log held in memory.
///
/// Entries start at `1:0`; the initial mark-delete position is `1:0`'s
/// predecessor, represented as [`Position::default`].
#[derive(Debug, Default)]
pub struct InMemoryCursor {
    state: RwLock<CursorState>,
    flush_failures: AtomicU32,
    mark_delete_failures: AtomicU32,
    flush_count: AtomicU64,
    fail_reads: AtomicBool,
}

impl InMemoryCursor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CursorState {
                read_position: Position::new(MEMORY_LEDGER_ID, 0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Append an entry to the log and return its position.
    pub async fn append(&self, metadata: MessageMetadata, payload: impl Into<Bytes>) -> Position {
        let mut state = self.state.write().await;
        let position = Position::new(MEMORY_LEDGER_ID, state.next_entry_id);
        state.next_entry_id += 1;
        state
            .entries
            .insert(position, Entry::new(position, metadata, payload));
        position
    }

    /// Append `count` keyless entries with a fixed payload.
    pub async fn append_many(&self, count: usize) -> Vec<Position> {
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            let sequence = self.state.read().await.next_entry_id;
            positions.push(
                self.append(MessageMetadata::new("producer", sequence), "payload")
                    .await,
            );
        }
        positions
    }

    /// Move the read position without going through the dispatcher, the
    /// way an admin reset would.
    pub async fn seek(&self, position: Position) {
        self.state.write().await.read_position = position;
    }

    pub async fn read_position(&self) -> Position {
        self.state.read().await.read_position
    }

    pub async fn is_deleted(&self, position: &Position) -> bool {
        self.state.read().await.deleted.contains(position)
    }

    /// Acknowledge everything up to and including `position` directly on
    /// the log, bypassing the dispatcher.
    pub async fn delete_up_to(&self, position: Position) {
        let mut state = self.state.write().await;
        let positions: Vec<Position> = state.entries.range(..=position).map(|(p, _)| *p).collect();
        state.deleted.extend(positions);
        state.advance_mark_delete();
    }

    /// Make the next `n` flushes fail with a cursor error.
    pub fn fail_next_flushes(&self, n: u32) {
        self.flush_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` mark-delete calls fail with a cursor error.
    pub fn fail_next_mark_deletes(&self, n: u32) {
        self.mark_delete_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedCursor for InMemoryCursor {
    async fn read_entries(&self, max_entries: usize) -> Result<Vec<Entry>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Cursor("read failed".to_string()));
        }
        let mut state = self.state.write().await;
        let entries: Vec<Entry> = state
            .entries
            .range(state.read_position..)
            .filter(|(position, _)| !state.deleted.contains(*position))
            .take(max_entries)
            .map(|(_, entry)| entry.clone())
            .collect();
        if let Some(last) = entries.last() {
            state.read_position = last.position.next();
        }
        Ok(entries)
    }

    async fn replay_entries(&self, positions: &[Position]) -> Result<Vec<Entry>> {
        let state = self.state.read().await;
        Ok(positions
            .iter()
            .filter(|position| state.is_live(position))
            .filter_map(|position| state.entries.get(position).cloned())
            .collect())
    }

    async fn mark_delete(&self, position: Position) -> Result<()> {
        let remaining = self.mark_delete_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.mark_delete_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Cursor(format!("mark delete of {} failed", position)));
        }
        let mut state = self.state.write().await;
        if state.entries.contains_key(&position) {
            state.deleted.insert(position);
            state.advance_mark_delete();
        }
        Ok(())
    }

    async fn mark_delete_position(&self) -> Position {
        self.state.read().await.mark_delete
    }

    async fn rewind(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.read_position = state
            .entries
            .range(state.mark_delete.next()..)
            .map(|(p, _)| *p)
            .next()
            .unwrap_or(Position::new(MEMORY_LEDGER_ID, state.next_entry_id));
        Ok(())
    }

    async fn has_more_entries(&self) -> bool {
        let state = self.state.read().await;
        state
            .entries
            .range(state.read_position..)
            .any(|(position, _)| !state.deleted.contains(position))
    }

    async fn backlog(&self) -> u64 {
        let state = self.state.read().await;
        (state.entries.len() - state.deleted.len()) as u64
    }

    async fn flush(&self) -> Result<()> {
        let remaining = self.flush_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.flush_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Cursor("flush failed".to_string()));
        }
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A consumer transport that records what it is sent.
#[derive(Debug)]
pub struct RecordingTransport {
    received: RwLock<Vec<Entry>>,
    notifications: RwLock<Vec<bool>>,
    writable: AtomicBool,
    disconnected: AtomicBool,
    fail_sends: AtomicBool,
    /// Accept at most this many entries per send; `u64::MAX` accepts all.
    accept_limit: AtomicU64,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            received: RwLock::new(Vec::new()),
            notifications: RwLock::new(Vec::new()),
            writable: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            accept_limit: AtomicU64::new(u64::MAX),
        }
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn received(&self) -> Vec<Entry> {
        self.received.read().await.clone()
    }

    pub async fn received_positions(&self) -> Vec<Position> {
        self.received
            .read()
            .await
            .iter()
            .map(|entry| entry.position)
            .collect()
    }

    pub async fn received_count(&self) -> usize {
        self.received.read().await.len()
    }

    /// Active-consumer notifications in the order they arrived.
    pub async fn notifications(&self) -> Vec<bool> {
        self.notifications.read().await.clone()
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Accept only the first `limit` entries of each send.
    pub fn accept_at_most(&self, limit: Option<u64>) {
        self.accept_limit
            .store(limit.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerTransport for RecordingTransport {
    async fn send_messages(&self, entries: Vec<Entry>) -> Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        let limit = self.accept_limit.load(Ordering::SeqCst);
        let accepted = entries.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        self.received
            .write()
            .await
            .extend(entries.into_iter().take(accepted));
        Ok(accepted)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst) && !self.disconnected.load(Ordering::SeqCst)
    }

    async fn notify_active_consumer_change(&self, is_active: bool) {
        self.notifications.write().await.push(is_active);
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}
