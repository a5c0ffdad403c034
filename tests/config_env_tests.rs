//! Integration tests for DispatcherConfig::from_env()
//!
//! Environment variables are process-global: every test takes the same lock
//! and starts from a clean slate.

use pulsaresque::config::DispatcherConfig;
use pulsaresque::constants::{DEFAULT_MAX_READ_BATCH_SIZE, DEFAULT_DISPATCH_RATE_PERIOD_MS};
use pulsaresque::error::Error;
use pulsaresque::telemetry::LogFormat;
use pulsaresque::types::KeySharedMode;
use serial_test::serial;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Every variable read by DispatcherConfig::from_env() and LogFormat::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "DISPATCHER_MAX_READ_BATCH_SIZE",
    "DISPATCHER_MAX_UNACKED_PER_SUBSCRIPTION",
    "DISPATCHER_MAX_UNACKED_PER_CONSUMER",
    "DISPATCHER_RATE_MSGS",
    "DISPATCHER_RATE_BYTES",
    "DISPATCHER_RATE_PERIOD_MS",
    "DISPATCHER_RATE_BURST_PERIODS",
    "DELAYED_DELIVERY_ENABLED",
    "DELAYED_DELIVERY_TICK_MS",
    "KEY_SHARED_MODE",
    "KEY_SHARED_VIRTUAL_NODES",
    "FAILOVER_PARTITION_INDEX",
    "LOG_FORMAT",
];

fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

#[test]
#[serial]
fn test_from_env_defaults() {
    with_env_vars(&[], || {
        let config = DispatcherConfig::from_env().expect("Should parse config");
        assert_eq!(config.max_read_batch_size, DEFAULT_MAX_READ_BATCH_SIZE);
        assert!(config.dispatch_rate.is_none());
        assert!(!config.delayed_delivery_enabled);
        assert_eq!(config.key_shared_mode, KeySharedMode::AutoSplit);
        assert_eq!(config.failover_partition_index, None);
    });
}

#[test]
#[serial]
fn test_from_env_unacked_ceilings() {
    with_env_vars(
        &[
            ("DISPATCHER_MAX_UNACKED_PER_SUBSCRIPTION", "5000"),
            ("DISPATCHER_MAX_UNACKED_PER_CONSUMER", "500"),
            ("DISPATCHER_MAX_READ_BATCH_SIZE", "25"),
        ],
        || {
            let config = DispatcherConfig::from_env().expect("Should parse config");
            assert_eq!(config.max_unacked_messages_per_subscription, 5000);
            assert_eq!(config.max_unacked_messages_per_consumer, 500);
            assert_eq!(config.max_read_batch_size, 25);
        },
    );
}

#[test]
#[serial]
fn test_from_env_dispatch_rate() {
    with_env_vars(
        &[
            ("DISPATCHER_RATE_MSGS", "100"),
            ("DISPATCHER_RATE_BURST_PERIODS", "3"),
        ],
        || {
            let config = DispatcherConfig::from_env().expect("Should parse config");
            let rate = config.dispatch_rate.expect("rate configured");
            assert_eq!(rate.msgs_per_period, 100);
            assert_eq!(rate.bytes_per_period, 0);
            assert_eq!(
                rate.period,
                Duration::from_millis(DEFAULT_DISPATCH_RATE_PERIOD_MS)
            );
            assert_eq!(rate.burst_periods, 3);
        },
    );
}

#[test]
#[serial]
fn test_from_env_zero_rate_period_fails() {
    with_env_vars(
        &[
            ("DISPATCHER_RATE_BYTES", "1024"),
            ("DISPATCHER_RATE_PERIOD_MS", "0"),
        ],
        || {
            let result = DispatcherConfig::from_env();
            assert!(matches!(result, Err(Error::Config(_))));
        },
    );
}

#[test]
#[serial]
fn test_from_env_delayed_delivery_and_key_shared() {
    with_env_vars(
        &[
            ("DELAYED_DELIVERY_ENABLED", "true"),
            ("DELAYED_DELIVERY_TICK_MS", "250"),
            ("KEY_SHARED_MODE", "Sticky"),
            ("FAILOVER_PARTITION_INDEX", "3"),
        ],
        || {
            let config = DispatcherConfig::from_env().expect("Should parse config");
            assert!(config.delayed_delivery_enabled);
            assert_eq!(config.delayed_delivery_tick, Duration::from_millis(250));
            assert_eq!(config.key_shared_mode, KeySharedMode::Sticky);
            assert_eq!(config.failover_partition_index, Some(3));
        },
    );
}

#[test]
#[serial]
fn test_from_env_invalid_values_fail() {
    for (key, value) in [
        ("DISPATCHER_MAX_READ_BATCH_SIZE", "lots"),
        ("DELAYED_DELIVERY_ENABLED", "yes please"),
        ("KEY_SHARED_MODE", "random"),
        ("FAILOVER_PARTITION_INDEX", "-1"),
    ] {
        with_env_vars(&[(key, value)], || {
            let err = DispatcherConfig::from_env().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{key}: {err:?}");
        });
    }
}

#[test]
#[serial]
fn test_from_env_consumer_ceiling_above_subscription_fails() {
    with_env_vars(
        &[
            ("DISPATCHER_MAX_UNACKED_PER_SUBSCRIPTION", "10"),
            ("DISPATCHER_MAX_UNACKED_PER_CONSUMER", "20"),
        ],
        || {
            let err = DispatcherConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("max_unacked_messages_per_consumer"));
        },
    );
}

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "JSON")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
