//! Subscription dispatch engine.
//!
//! A [`Dispatcher`] owns one subscription. It reads entries through a
//! [`ManagedCursor`], chooses a consumer for each entry according to the
//! subscription type, and pushes entries through each consumer's
//! [`ConsumerTransport`] while honoring flow permits, unacked ceilings,
//! rate limits, delayed delivery and entry filters.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │  ManagedCursor   │ ← read / replay / mark-delete
//!                 └────────┬─────────┘
//!                          ▼
//!   ┌───────────────────────────────────────────────┐
//!   │                  Dispatcher                   │
//!   │  filters → delayed tracker → selector → limiter│
//!   │        redelivery tracker (replay pool)       │
//!   └───────┬──────────────┬──────────────┬─────────┘
//!           ▼              ▼              ▼
//!     ┌──────────┐   ┌──────────┐   ┌──────────┐
//!     │Consumer 1│   │Consumer 2│   │Consumer 3│  ← ConsumerTransport
//!     └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! | Subscription | Selector |
//! |--------------|----------|
//! | Exclusive | single active consumer |
//! | Failover | highest priority, then attach order (or partition index) |
//! | Shared | round-robin over consumers with credit |
//! | Key_Shared | sticky key hash → consumer (hash ring or declared ranges) |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsaresque::dispatch::{Consumer, Dispatcher, InMemoryCursor, RecordingTransport};
//! use pulsaresque::config::DispatcherConfig;
//! use pulsaresque::types::{ConsumerId, SubType};
//!
//! # async fn run() -> pulsaresque::error::Result<()> {
//! let cursor = Arc::new(InMemoryCursor::new());
//! cursor.append_many(10).await;
//!
//! let dispatcher = Dispatcher::new("orders-sub", SubType::Shared, cursor, DispatcherConfig::default())?;
//! let transport = Arc::new(RecordingTransport::new());
//! dispatcher
//!     .add_consumer(Arc::new(Consumer::new(1, "c1", SubType::Shared, transport.clone())))
//!     .await?;
//! dispatcher.consumer_flow(ConsumerId::new(1), 10).await;
//! assert_eq!(transport.received_count().await, 10);
//! # Ok(())
//! # }
//! ```

mod consumer;
mod cursor;
mod delayed;
mod dispatcher;
mod filter;
pub mod hash;
#[cfg(any(test, feature = "test-utilities"))]
mod memory;
mod rate_limiter;
mod redelivery;
mod selector;

pub use consumer::{Consumer, ConsumerFlowController};
pub use cursor::{ConsumerTransport, CursorRef, ManagedCursor, TransportRef};
pub use delayed::{DelayedDeliveryTracker, now_millis};
pub use dispatcher::{ConsumerStats, Dispatcher, DispatcherBuilder, DispatcherState, DispatcherStats};
pub use filter::{EntryFilter, FilterContext, FilterResult};
#[cfg(any(test, feature = "test-utilities"))]
pub use memory::{InMemoryCursor, MEMORY_LEDGER_ID, RecordingTransport};
pub use rate_limiter::{AvailablePermits, DispatchRateLimiter};
pub use redelivery::RedeliveryTracker;
