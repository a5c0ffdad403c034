//! Crate level errors.
//!
//! # Error Taxonomy
//!
//! Every [`Error`] belongs to one [`ErrorKind`]:
//!
//! - **Configuration**: malformed values rejected at construction
//!   (a [`Split`](crate::loadbalance::Split) with the wrong number of children,
//!   a missing service unit, an invalid dispatcher config). Nothing partially
//!   built ever enters the system.
//! - **ConsumerConflict**: the subscription type refuses the consumer
//!   (second exclusive consumer, type mismatch, overlapping key-shared ranges).
//!   Dispatcher state is left unchanged.
//! - **State**: the operation targets a closed dispatcher or a consumer that is
//!   not attached. Logged by callers, never fatal to the broker.
//! - **Collaborator**: the cursor or the consumer transport failed. Teardown
//!   failures surface here through the close result.
//!
//! Backpressure (no permits, rate limited, unacked ceiling reached) and
//! delayed delivery are scheduling decisions and never show up as errors.

use std::result;
use thiserror::Error as ThisError;

use crate::types::{ConsumerId, SubType};

pub type Result<T> = result::Result<T, Error>;

/// Broad classification used for logging and for mapping errors to client
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    ConsumerConflict,
    State,
    Collaborator,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::ConsumerConflict => "consumer_conflict",
            ErrorKind::State => "state",
            ErrorKind::Collaborator => "collaborator",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by the dispatch engine and the load-balancing models.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// An argument had an invalid value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A required argument was absent.
    #[error("Null argument: {0} must not be null")]
    NullArgument(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The subscription only admits a single consumer and one is attached.
    #[error("Exclusive consumer is already connected to subscription {subscription}")]
    ConsumerBusy { subscription: String },

    /// The consumer declared a subscription type the dispatcher does not enforce.
    #[error("Subscription {subscription} is of type {expected}, consumer requested {requested}")]
    SubscriptionBusy {
        subscription: String,
        expected: SubType,
        requested: SubType,
    },

    /// The key-shared selector could not assign hash ranges to the consumer.
    #[error("Consumer {consumer_id} cannot be assigned to subscription {subscription}: {reason}")]
    ConsumerAssign {
        subscription: String,
        consumer_id: ConsumerId,
        reason: String,
    },

    /// The dispatcher is closing or closed.
    #[error("Dispatcher for subscription {0} is closed")]
    Closed(String),

    /// The consumer is not attached to this dispatcher.
    #[error("Consumer {consumer_id} is not attached to subscription {subscription}")]
    ConsumerNotFound {
        subscription: String,
        consumer_id: ConsumerId,
    },

    /// The log cursor failed.
    #[error("Cursor error: {0}")]
    Cursor(String),

    /// The consumer transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Closing the dispatcher did not complete cleanly.
    #[error("Teardown failed: {0}")]
    Teardown(String),
}

impl Error {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::NullArgument(_) | Error::Config(_) => {
                ErrorKind::Configuration
            }
            Error::ConsumerBusy { .. }
            | Error::SubscriptionBusy { .. }
            | Error::ConsumerAssign { .. } => ErrorKind::ConsumerConflict,
            Error::Closed(_) | Error::ConsumerNotFound { .. } => ErrorKind::State,
            Error::Cursor(_) | Error::Transport(_) | Error::Teardown(_) => {
                ErrorKind::Collaborator
            }
        }
    }

    /// Returns true if the error was caused by the subscription type refusing
    /// a consumer.
    pub fn is_consumer_conflict(&self) -> bool {
        self.kind() == ErrorKind::ConsumerConflict
    }
}
