//! Common utilities for Maat integration tests.

use ahash::AHashMap as HashMap;
use maat::cc::CcKind;
use maat::{
    CallFuture, EntityId, EntityState, FunctionRegistry, Payload, RingConfig, Runtime,
    RuntimeBuilder, TxnExecution,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A bank account: the canonical partitioned-state fixture.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub balance: i64,
}

impl EntityState for Account {
    fn snapshot(&self) -> Payload {
        bincode::serialize(self).unwrap()
    }
}

pub fn encode<T: Serialize>(value: &T) -> Payload {
    bincode::serialize(value).unwrap()
}

pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> T {
    bincode::deserialize(payload).unwrap()
}

/// Adds an amount to the current account and returns the new balance.
pub fn deposit(exec: &mut TxnExecution<Account>, input: Payload) -> CallFuture<'_> {
    Box::pin(async move {
        let amount: i64 = decode(&input);
        let balance = exec.update(|account| {
            account.balance += amount;
            account.balance
        })?;
        Ok(encode(&balance))
    })
}

/// Returns the current account's balance.
pub fn balance(exec: &mut TxnExecution<Account>, _input: Payload) -> CallFuture<'_> {
    Box::pin(async move {
        let account = exec.read()?;
        Ok(encode(&account.balance))
    })
}

/// Moves `(to, amount)` from the current account to another entity via a
/// nested `deposit` call.
pub fn transfer(exec: &mut TxnExecution<Account>, input: Payload) -> CallFuture<'_> {
    Box::pin(async move {
        let (to, amount): (EntityId, i64) = decode(&input);
        exec.update(|account| account.balance -= amount)?;
        exec.call(to, "deposit", encode(&amount)).await?;
        Ok(Payload::new())
    })
}

/// Two sequential nested deposits into `(to, amount)`; exercises repeated
/// accesses of the same entity within one transaction.
pub fn double_deposit(exec: &mut TxnExecution<Account>, input: Payload) -> CallFuture<'_> {
    Box::pin(async move {
        let (to, amount): (EntityId, i64) = decode(&input);
        exec.call(to, "deposit", encode(&amount)).await?;
        exec.call(to, "deposit", encode(&amount)).await?;
        Ok(Payload::new())
    })
}

/// Always fails in business logic.
pub fn fail(_exec: &mut TxnExecution<Account>, _input: Payload) -> CallFuture<'_> {
    Box::pin(async move { Err(maat::TxnError::Application("intentional failure".into())) })
}

/// Deposits, then holds its scheduler turn for the duration encoded in the
/// input (milliseconds).
pub fn slow_deposit(exec: &mut TxnExecution<Account>, input: Payload) -> CallFuture<'_> {
    Box::pin(async move {
        let (amount, millis): (i64, u64) = decode(&input);
        exec.update(|account| account.balance += amount)?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(Payload::new())
    })
}

/// The standard account registry.
pub fn account_registry() -> FunctionRegistry<Account> {
    let mut registry = FunctionRegistry::new();
    registry.register("deposit", deposit);
    registry.register("balance", balance);
    registry.register("transfer", transfer);
    registry.register("double_deposit", double_deposit);
    registry.register("fail", fail);
    registry.register("slow_deposit", slow_deposit);
    registry
}

/// Fast ring configuration for tests.
pub fn test_config(ring_size: usize) -> RingConfig {
    RingConfig {
        ring_size,
        batch_interval: Duration::from_millis(1),
        backoff_interval: Duration::from_millis(2),
        idle_probe_interval: Duration::from_millis(1),
        deadlock_timeout: Duration::from_millis(250),
    }
}

/// Builds a runtime with `entities` zero-balance accounts (ids `0..entities`).
pub fn setup_runtime(entities: u64, ring_size: usize, cc: CcKind) -> Runtime<Account> {
    let mut builder = RuntimeBuilder::new(account_registry())
        .configure(test_config(ring_size))
        .unwrap()
        .concurrency_control(cc);
    for id in 0..entities {
        builder = builder.entity(id, Account::default());
    }
    builder.build().unwrap()
}

/// Declared access map helper.
pub fn accesses(pairs: &[(EntityId, u32)]) -> HashMap<EntityId, u32> {
    pairs.iter().copied().collect()
}
