//! # Pulsaresque
//! Subscription dispatch engine and bundle-split model for a Pulsar-style
//! message broker.
//!
//! A broker keeps one [`Dispatcher`](dispatch::Dispatcher) per subscription.
//! The dispatcher pulls entries from a replicated log through a
//! [`ManagedCursor`](dispatch::ManagedCursor) and fans them out to attached
//! consumers, honoring:
//!
//! - per-consumer flow permits and unacked ceilings
//! - the subscription type (exclusive, failover, shared, key-shared)
//! - redelivery of unacknowledged entries, fenced by epochs
//! - dispatch rate limits and delayed delivery
//! - pluggable entry filters
//!
//! The [`loadbalance`] module carries the data contract the load manager
//! hands to the orchestrator when a bundle has to be split in two.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsaresque::prelude::*;
//!
//! # async fn run(cursor: CursorRef, transport: TransportRef) -> Result<()> {
//! let config = DispatcherConfig::from_env()?;
//! let dispatcher = Dispatcher::new("persistent://public/default/orders", SubType::Shared, cursor, config)?;
//!
//! let consumer = Consumer::new(1, "worker-1", SubType::Shared, transport);
//! dispatcher.add_consumer(Arc::new(consumer)).await?;
//! dispatcher.consumer_flow(ConsumerId::new(1), 1000).await;
//!
//! dispatcher.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Logging goes through `tracing`; call
//! [`telemetry::init_logging`] once at startup. Metrics live in a dedicated
//! Prometheus registry, see [`metrics::gather_metrics`].

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod loadbalance;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Everything needed to run a dispatcher.
    pub use crate::config::{DispatchRate, DispatcherConfig};
    pub use crate::dispatch::{
        Consumer, ConsumerTransport, CursorRef, Dispatcher, DispatcherState, EntryFilter,
        FilterContext, FilterResult, ManagedCursor, TransportRef,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::loadbalance::{ServiceUnitId, Split};
    pub use crate::types::{
        ConsumerId, Entry, Epoch, HashRange, KeySharedMeta, KeySharedMode, MessageMetadata,
        Position, SubType,
    };

    pub use bytes;
}
