//! Centralized dispatch and load-balancing constants.
//!
//! # Categories
//!
//! - **Dispatch Constants**: read batch sizes and unacked ceilings
//! - **Rate Limiting Constants**: default period and retry delays
//! - **Delayed Delivery Constants**: tick granularity
//! - **Key-Shared Constants**: hash space and ring replicas
//! - **Load Balancing Constants**: bundle split fan-out

// =============================================================================
// Dispatch Constants
// =============================================================================

/// Maximum number of entries read from the cursor in one dispatch round.
pub const DEFAULT_MAX_READ_BATCH_SIZE: usize = 100;

/// Default ceiling of dispatched-but-unacknowledged entries per subscription.
///
/// Zero disables the ceiling.
pub const DEFAULT_MAX_UNACKED_MESSAGES_PER_SUBSCRIPTION: u64 = 200_000;

/// Default ceiling of dispatched-but-unacknowledged entries per consumer.
///
/// Zero disables the ceiling.
pub const DEFAULT_MAX_UNACKED_MESSAGES_PER_CONSUMER: u64 = 50_000;

// =============================================================================
// Rate Limiting Constants
// =============================================================================

/// Default rate limiting period.
pub const DEFAULT_DISPATCH_RATE_PERIOD_MS: u64 = 1_000;

/// Lower bound on the delay before retrying a throttled dispatch.
pub const MIN_THROTTLE_RETRY_DELAY_MS: u64 = 1;

// =============================================================================
// Delayed Delivery Constants
// =============================================================================

/// Delivery times are rounded up to multiples of this tick.
pub const DEFAULT_DELAYED_DELIVERY_TICK_MS: u64 = 1_000;

// =============================================================================
// Key-Shared Constants
// =============================================================================

/// Size of the sticky key hash space. Hashes fall in `[0, 65536)`.
pub const STICKY_KEY_HASH_RANGE_SIZE: u32 = 65_536;

/// Virtual nodes placed on the ring per consumer in auto-split mode.
pub const DEFAULT_KEY_SHARED_VIRTUAL_NODES: usize = 100;

// =============================================================================
// Load Balancing Constants
// =============================================================================

/// A bundle always splits into exactly this many children.
pub const SPLIT_CHILD_COUNT: usize = 2;

/// Lowest hash of the bundle key space.
pub const BUNDLE_RANGE_MIN: u32 = 0x0000_0000;

/// Highest hash of the bundle key space.
pub const BUNDLE_RANGE_MAX: u32 = 0xffff_ffff;
