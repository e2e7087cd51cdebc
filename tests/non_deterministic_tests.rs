//! Non-deterministic transactions: speculative execution, two-phase commit,
//! the ordering check, and deadlock handling.

use maat::cc::CcKind;
use maat::{FunctionCall, FunctionResult, NO_BATCH, TxnError, check_serializability};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{accesses, decode, encode, setup_runtime};

#[tokio::test]
async fn act_deposit_commits_without_declaration() {
    let runtime = setup_runtime(1, 1, CcKind::TwoPhaseLocking);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("deposit", encode(&25i64)))
        .await;
    assert!(outcome.is_ok(), "unexpected error: {:?}", outcome.error);
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 25);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 25);
}

#[tokio::test]
async fn act_transfer_commits_across_entities() {
    let runtime = setup_runtime(2, 1, CcKind::TwoPhaseLocking);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("transfer", encode(&(1u64, 12i64))))
        .await;
    assert!(outcome.is_ok(), "unexpected error: {:?}", outcome.error);

    let from = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    let to = runtime
        .start_non_deterministic(1, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&from.output.unwrap()), -12);
    assert_eq!(decode::<i64>(&to.output.unwrap()), 12);
}

#[tokio::test]
async fn act_observes_committed_deterministic_state() {
    let runtime = setup_runtime(1, 1, CcKind::TwoPhaseLocking);

    let outcome = runtime
        .start_deterministic(0, FunctionCall::new("deposit", encode(&9i64)), accesses(&[(0, 1)]))
        .await;
    assert!(outcome.is_ok(), "unexpected error: {:?}", outcome.error);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 9);
}

#[tokio::test]
async fn business_failure_aborts_the_act() {
    let runtime = setup_runtime(1, 1, CcKind::TwoPhaseLocking);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("fail", Vec::new()))
        .await;
    assert!(matches!(outcome.error, Some(TxnError::Application(_))));

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_act_times_out_as_deadlock() {
    let runtime = Arc::new(setup_runtime(1, 1, CcKind::TwoPhaseLocking));

    // A deterministic transaction holds entity 0's turn well past the
    // deadlock timeout.
    let det = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .start_deterministic(
                    0,
                    FunctionCall::new("slow_deposit", encode(&(5i64, 800u64))),
                    accesses(&[(0, 1)]),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let blocked = runtime
        .start_non_deterministic(0, FunctionCall::new("deposit", encode(&1i64)))
        .await;
    assert_eq!(blocked.error, Some(TxnError::Deadlock));

    let det = det.await.unwrap();
    assert!(det.is_ok(), "unexpected error: {:?}", det.error);
    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_acts_abort_cleanly() {
    let runtime = Arc::new(setup_runtime(2, 1, CcKind::TwoPhaseLocking));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime
                .start_non_deterministic(0, FunctionCall::new("transfer", encode(&(1u64, 1i64))))
                .await
        }));
    }
    let mut committed = 0i64;
    for handle in handles {
        let outcome = handle.await.unwrap();
        match outcome.error {
            None => committed += 1,
            Some(TxnError::PrepareRejected)
            | Some(TxnError::NotSerializable)
            | Some(TxnError::NotSureSerializable)
            | Some(TxnError::Deadlock) => {}
            Some(other) => panic!("unexpected error class: {other:?}"),
        }
    }

    let from = runtime
        .start_deterministic(0, FunctionCall::new("balance", Vec::new()), accesses(&[(0, 1)]))
        .await;
    let to = runtime
        .start_deterministic(1, FunctionCall::new("balance", Vec::new()), accesses(&[(1, 1)]))
        .await;
    assert_eq!(decode::<i64>(&from.output.unwrap()), -committed);
    assert_eq!(decode::<i64>(&to.output.unwrap()), committed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_workload_conserves_money() {
    let runtime = Arc::new(setup_runtime(3, 2, CcKind::TwoPhaseLocking));

    let mut handles = Vec::new();
    for i in 0..30u64 {
        let runtime = runtime.clone();
        let from = i % 3;
        let to = (i + 1) % 3;
        let amount = rand::rng().random_range(1..8i64);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                runtime
                    .start_deterministic(
                        from,
                        FunctionCall::new("transfer", encode(&(to, amount))),
                        accesses(&[(from, 1), (to, 1)]),
                    )
                    .await
            } else {
                runtime
                    .start_non_deterministic(from, FunctionCall::new("transfer", encode(&(to, amount))))
                    .await
            }
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap();
        if let Some(err) = outcome.error {
            // Only the abort taxonomy is acceptable under contention.
            assert!(
                matches!(
                    err,
                    TxnError::PrepareRejected
                        | TxnError::NotSerializable
                        | TxnError::NotSureSerializable
                        | TxnError::Deadlock
                ),
                "unexpected error class: {err:?}"
            );
        }
    }

    let mut total = 0i64;
    for id in 0..3u64 {
        let outcome = runtime
            .start_deterministic(id, FunctionCall::new("balance", Vec::new()), accesses(&[(id, 1)]))
            .await;
        total += decode::<i64>(&outcome.output.unwrap());
    }
    assert_eq!(total, 0);
}

#[tokio::test]
async fn timestamp_ordering_commits_simple_acts() {
    let runtime = setup_runtime(2, 1, CcKind::TimestampOrdering);

    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("deposit", encode(&4i64)))
        .await;
    assert!(outcome.is_ok(), "unexpected error: {:?}", outcome.error);
    let outcome = runtime
        .start_non_deterministic(0, FunctionCall::new("balance", Vec::new()))
        .await;
    assert_eq!(decode::<i64>(&outcome.output.unwrap()), 4);
}

// --- ordering check, exercised directly ---

fn facts(before: &[i64], after: &[i64]) -> FunctionResult {
    let mut result = FunctionResult::new();
    for b in before {
        result.before_set.insert(*b);
        result.max_before = result.max_before.max(*b);
    }
    for a in after {
        result.after_set.insert(*a);
        result.min_after = result.min_after.min(*a);
    }
    result
}

#[test]
fn empty_before_set_is_serializable() {
    let result = facts(&[], &[7]);
    assert!(check_serializability(&result, NO_BATCH).is_ok());
}

#[test]
fn committed_before_set_is_serializable() {
    let result = facts(&[3, 5], &[9]);
    assert!(check_serializability(&result, 5).is_ok());
}

#[test]
fn overlap_is_not_serializable() {
    // Batch 5 is ordered both before and after the transaction.
    let result = facts(&[3, 5], &[5, 9]);
    assert_eq!(
        check_serializability(&result, NO_BATCH),
        Err(TxnError::NotSerializable)
    );
}

#[test]
fn consecutive_before_and_after_is_serializable() {
    let mut result = facts(&[5], &[9]);
    result.min_after_global_pred = 5;
    assert!(check_serializability(&result, NO_BATCH).is_ok());
}

#[test]
fn gap_between_before_and_after_is_unprovable() {
    let mut result = facts(&[5], &[9]);
    result.min_after_global_pred = 7;
    assert_eq!(
        check_serializability(&result, NO_BATCH),
        Err(TxnError::NotSureSerializable)
    );
}
