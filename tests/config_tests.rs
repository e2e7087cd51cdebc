//! Builder and ring configuration validation.

use maat::{RingConfig, RuntimeBuilder, TxnError};
use std::time::Duration;

mod common;
use common::{Account, account_registry, test_config};

#[test]
fn default_config_is_valid() {
    assert!(RingConfig::default().validate().is_ok());
}

#[test]
fn zero_ring_size_is_rejected() {
    let config = RingConfig {
        ring_size: 0,
        ..RingConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(TxnError::Configuration(_))
    ));
}

#[test]
fn zero_intervals_are_rejected() {
    let config = RingConfig {
        batch_interval: Duration::ZERO,
        ..RingConfig::default()
    };
    assert!(config.validate().is_err());

    let config = RingConfig {
        deadlock_timeout: Duration::ZERO,
        ..RingConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn idle_probe_must_not_exceed_backoff() {
    let config = RingConfig {
        backoff_interval: Duration::from_millis(1),
        idle_probe_interval: Duration::from_millis(5),
        ..RingConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(TxnError::Configuration(_))
    ));
}

#[test]
fn repeated_configuration_is_rejected() {
    let builder = RuntimeBuilder::<Account>::new(account_registry())
        .configure(test_config(1))
        .unwrap();
    assert!(matches!(
        builder.configure(test_config(2)),
        Err(TxnError::Configuration(_))
    ));
}

#[tokio::test]
async fn build_requires_an_entity() {
    let result = RuntimeBuilder::<Account>::new(account_registry())
        .configure(test_config(1))
        .unwrap()
        .build();
    assert!(matches!(result, Err(TxnError::Configuration(_))));
}

#[tokio::test]
async fn duplicate_entity_is_rejected() {
    let result = RuntimeBuilder::new(account_registry())
        .configure(test_config(1))
        .unwrap()
        .entity(0, Account::default())
        .entity(0, Account::default())
        .build();
    assert!(matches!(result, Err(TxnError::Configuration(_))));
}

#[tokio::test]
async fn unknown_entity_is_a_configuration_error() {
    let runtime = common::setup_runtime(1, 1, maat::cc::CcKind::TwoPhaseLocking);
    let outcome = runtime
        .start_non_deterministic(42, maat::FunctionCall::new("balance", Vec::new()))
        .await;
    assert!(matches!(outcome.error, Some(TxnError::Configuration(_))));
}
