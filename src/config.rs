//! Dispatcher configuration.
//!
//! ```rust
//! use pulsaresque::config::{DispatchRate, DispatcherConfig};
//! use std::time::Duration;
//!
//! let config = DispatcherConfig::default()
//!     .with_max_unacked_messages_per_subscription(1_000)
//!     .with_dispatch_rate(DispatchRate::per_second(500, 0))
//!     .with_delayed_delivery(Duration::from_millis(100));
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_DELAYED_DELIVERY_TICK_MS, DEFAULT_DISPATCH_RATE_PERIOD_MS,
    DEFAULT_KEY_SHARED_VIRTUAL_NODES, DEFAULT_MAX_READ_BATCH_SIZE,
    DEFAULT_MAX_UNACKED_MESSAGES_PER_CONSUMER, DEFAULT_MAX_UNACKED_MESSAGES_PER_SUBSCRIPTION,
};
use crate::error::{Error, Result};
use crate::types::KeySharedMode;

/// Dispatch throttling policy for one subscription.
///
/// A zero rate leaves that dimension unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRate {
    /// Messages allowed per period.
    pub msgs_per_period: u64,
    /// Payload bytes allowed per period.
    pub bytes_per_period: u64,
    /// Refill period.
    pub period: Duration,
    /// Bucket capacity expressed in periods worth of tokens (minimum 1).
    pub burst_periods: u32,
}

impl DispatchRate {
    pub fn new(msgs_per_period: u64, bytes_per_period: u64, period: Duration) -> Self {
        Self {
            msgs_per_period,
            bytes_per_period,
            period,
            burst_periods: 1,
        }
    }

    pub fn per_second(msgs: u64, bytes: u64) -> Self {
        Self::new(msgs, bytes, Duration::from_millis(DEFAULT_DISPATCH_RATE_PERIOD_MS))
    }

    pub fn with_burst_periods(mut self, periods: u32) -> Self {
        self.burst_periods = periods.max(1);
        self
    }

    /// True when at least one dimension is limited.
    pub fn is_enabled(&self) -> bool {
        self.msgs_per_period > 0 || self.bytes_per_period > 0
    }
}

/// Configuration shared by every dispatcher of a broker.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum entries read from the cursor per dispatch round.
    pub max_read_batch_size: usize,

    /// Ceiling on unacknowledged entries for the whole subscription (0 = unlimited).
    pub max_unacked_messages_per_subscription: u64,

    /// Ceiling on unacknowledged entries per consumer (0 = unlimited).
    pub max_unacked_messages_per_consumer: u64,

    /// Optional dispatch throttling.
    pub dispatch_rate: Option<DispatchRate>,

    /// Whether shared and key-shared dispatchers honor deliver-at times.
    pub delayed_delivery_enabled: bool,

    /// Granularity delivery times are rounded up to.
    pub delayed_delivery_tick: Duration,

    /// Mode enforced by key-shared dispatchers.
    pub key_shared_mode: KeySharedMode,

    /// Ring replicas per consumer in auto-split mode.
    pub key_shared_virtual_nodes: usize,

    /// Partition index of the topic, used by failover to spread active
    /// consumers over partitions.
    pub failover_partition_index: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_read_batch_size: DEFAULT_MAX_READ_BATCH_SIZE,
            max_unacked_messages_per_subscription: DEFAULT_MAX_UNACKED_MESSAGES_PER_SUBSCRIPTION,
            max_unacked_messages_per_consumer: DEFAULT_MAX_UNACKED_MESSAGES_PER_CONSUMER,
            dispatch_rate: None,
            delayed_delivery_enabled: false,
            delayed_delivery_tick: Duration::from_millis(DEFAULT_DELAYED_DELIVERY_TICK_MS),
            key_shared_mode: KeySharedMode::AutoSplit,
            key_shared_virtual_nodes: DEFAULT_KEY_SHARED_VIRTUAL_NODES,
            failover_partition_index: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_read_batch_size(mut self, size: usize) -> Self {
        self.max_read_batch_size = size;
        self
    }

    pub fn with_max_unacked_messages_per_subscription(mut self, max: u64) -> Self {
        self.max_unacked_messages_per_subscription = max;
        self
    }

    pub fn with_max_unacked_messages_per_consumer(mut self, max: u64) -> Self {
        self.max_unacked_messages_per_consumer = max;
        self
    }

    pub fn with_dispatch_rate(mut self, rate: DispatchRate) -> Self {
        self.dispatch_rate = Some(rate);
        self
    }

    pub fn with_delayed_delivery(mut self, tick: Duration) -> Self {
        self.delayed_delivery_enabled = true;
        self.delayed_delivery_tick = tick;
        self
    }

    pub fn with_key_shared_mode(mut self, mode: KeySharedMode) -> Self {
        self.key_shared_mode = mode;
        self
    }

    pub fn with_failover_partition_index(mut self, index: u32) -> Self {
        self.failover_partition_index = Some(index);
        self
    }

    /// Validate configuration consistency.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_read_batch_size == 0 {
            errors.push("max_read_batch_size must be at least 1".to_string());
        }

        if self.max_unacked_messages_per_consumer > 0
            && self.max_unacked_messages_per_subscription > 0
            && self.max_unacked_messages_per_consumer > self.max_unacked_messages_per_subscription
        {
            errors.push(format!(
                "max_unacked_messages_per_consumer ({}) must not exceed max_unacked_messages_per_subscription ({})",
                self.max_unacked_messages_per_consumer, self.max_unacked_messages_per_subscription
            ));
        }

        if let Some(rate) = &self.dispatch_rate
            && rate.period.is_zero()
        {
            errors.push("dispatch_rate.period must be greater than zero".to_string());
        }

        if self.delayed_delivery_enabled && self.delayed_delivery_tick.is_zero() {
            errors.push("delayed_delivery_tick must be greater than zero".to_string());
        }

        if self.key_shared_virtual_nodes == 0 {
            errors.push("key_shared_virtual_nodes must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every problem into a single configuration error.
    pub fn validated(self) -> Result<Self> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(errors) => Err(Error::Config(errors.join("; "))),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DISPATCHER_MAX_READ_BATCH_SIZE` (default: 100)
    /// - `DISPATCHER_MAX_UNACKED_PER_SUBSCRIPTION` (default: 200000)
    /// - `DISPATCHER_MAX_UNACKED_PER_CONSUMER` (default: 50000)
    /// - `DISPATCHER_RATE_MSGS`, `DISPATCHER_RATE_BYTES` (default: unset, no throttling)
    /// - `DISPATCHER_RATE_PERIOD_MS` (default: 1000)
    /// - `DISPATCHER_RATE_BURST_PERIODS` (default: 1)
    /// - `DELAYED_DELIVERY_ENABLED` (default: false)
    /// - `DELAYED_DELIVERY_TICK_MS` (default: 1000)
    /// - `KEY_SHARED_MODE`: `auto_split` or `sticky` (default: auto_split)
    /// - `KEY_SHARED_VIRTUAL_NODES` (default: 100)
    /// - `FAILOVER_PARTITION_INDEX` (default: unset)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_read_batch_size =
            env_or("DISPATCHER_MAX_READ_BATCH_SIZE", defaults.max_read_batch_size)?;
        let max_unacked_messages_per_subscription = env_or(
            "DISPATCHER_MAX_UNACKED_PER_SUBSCRIPTION",
            defaults.max_unacked_messages_per_subscription,
        )?;
        let max_unacked_messages_per_consumer = env_or(
            "DISPATCHER_MAX_UNACKED_PER_CONSUMER",
            defaults.max_unacked_messages_per_consumer,
        )?;

        let rate_msgs: u64 = env_or("DISPATCHER_RATE_MSGS", 0)?;
        let rate_bytes: u64 = env_or("DISPATCHER_RATE_BYTES", 0)?;
        let rate_period_ms: u64 =
            env_or("DISPATCHER_RATE_PERIOD_MS", DEFAULT_DISPATCH_RATE_PERIOD_MS)?;
        let burst_periods: u32 = env_or("DISPATCHER_RATE_BURST_PERIODS", 1)?;
        let dispatch_rate = if rate_msgs > 0 || rate_bytes > 0 {
            Some(
                DispatchRate::new(rate_msgs, rate_bytes, Duration::from_millis(rate_period_ms))
                    .with_burst_periods(burst_periods),
            )
        } else {
            None
        };

        let delayed_delivery_enabled = env_or("DELAYED_DELIVERY_ENABLED", false)?;
        let delayed_delivery_tick = Duration::from_millis(env_or(
            "DELAYED_DELIVERY_TICK_MS",
            DEFAULT_DELAYED_DELIVERY_TICK_MS,
        )?);

        let key_shared_mode = match std::env::var("KEY_SHARED_MODE") {
            Ok(value) => match value.to_lowercase().replace('-', "_").as_str() {
                "auto_split" | "autosplit" => KeySharedMode::AutoSplit,
                "sticky" => KeySharedMode::Sticky,
                other => {
                    return Err(Error::Config(format!(
                        "KEY_SHARED_MODE must be auto_split or sticky, got '{}'",
                        other
                    )));
                }
            },
            Err(_) => defaults.key_shared_mode,
        };
        let key_shared_virtual_nodes =
            env_or("KEY_SHARED_VIRTUAL_NODES", defaults.key_shared_virtual_nodes)?;

        let failover_partition_index = match std::env::var("FAILOVER_PARTITION_INDEX") {
            Ok(value) => Some(parse_env("FAILOVER_PARTITION_INDEX", &value)?),
            Err(_) => None,
        };

        Self {
            max_read_batch_size,
            max_unacked_messages_per_subscription,
            max_unacked_messages_per_consumer,
            dispatch_rate,
            delayed_delivery_enabled,
            delayed_delivery_tick,
            key_shared_mode,
            key_shared_virtual_nodes,
            failover_partition_index,
        }
        .validated()
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => parse_env(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value '{}'", name, value)))
}
