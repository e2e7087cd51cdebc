//! Scheduler chain behavior: turn order, placeholders, windows, commits.

use maat::context::{BatchId, NO_BATCH, TxnId};
use maat::scheduler::{DeterministicBatchSchedule, Scheduler, Turn};

fn schedule(
    batch_id: BatchId,
    predecessor: BatchId,
    global_predecessor: BatchId,
    txns: Vec<(TxnId, u32)>,
) -> DeterministicBatchSchedule {
    DeterministicBatchSchedule {
        batch_id,
        predecessor,
        global_predecessor,
        coordinator: 0,
        txns,
        highest_committed: NO_BATCH,
    }
}

#[tokio::test]
async fn turns_follow_declared_order() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1), (1, 2)]));

    // Second transaction cannot go first.
    let later = sched.wait_det(0, 1).unwrap();
    assert!(matches!(later, Turn::Wait(_)));

    let first = sched.wait_det(0, 0).unwrap();
    assert!(matches!(first, Turn::Ready));
    let done = sched.ack_det(0, 0).unwrap();
    assert!(!done.switching_batches);

    // The queued call of transaction 1 is granted now.
    later.acquired().await.unwrap();
    let done = sched.ack_det(0, 1).unwrap();
    assert!(!done.switching_batches);

    // Transaction 1 declared two accesses; the second is granted directly.
    let second = sched.wait_det(0, 1).unwrap();
    assert!(matches!(second, Turn::Ready));
    let done = sched.ack_det(0, 1).unwrap();
    assert!(done.switching_batches);
    assert_eq!(done.coordinator, 0);
}

#[tokio::test]
async fn second_batch_waits_for_first() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    sched.register_batch(schedule(1, 0, 0, vec![(1, 1)]));

    let blocked = sched.wait_det(1, 1).unwrap();
    assert!(matches!(blocked, Turn::Wait(_)));

    assert!(matches!(sched.wait_det(0, 0).unwrap(), Turn::Ready));
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);

    blocked.acquired().await.unwrap();
    assert!(sched.ack_det(1, 1).unwrap().switching_batches);
}

#[tokio::test]
async fn placeholder_links_unseen_predecessor() {
    let mut sched = Scheduler::new();
    // Batch 5 arrives first; its predecessor 2 has not been seen.
    sched.register_batch(schedule(5, 2, 2, vec![(5, 1)]));
    let blocked = sched.wait_det(5, 5).unwrap();
    assert!(matches!(blocked, Turn::Wait(_)));

    // The predecessor fills its placeholder and runs first.
    sched.register_batch(schedule(2, NO_BATCH, NO_BATCH, vec![(2, 1)]));
    assert!(matches!(sched.wait_det(2, 2).unwrap(), Turn::Ready));
    assert!(sched.ack_det(2, 2).unwrap().switching_batches);

    blocked.acquired().await.unwrap();
    assert!(sched.ack_det(5, 5).unwrap().switching_batches);
}

#[tokio::test]
async fn filled_placeholder_still_waits_for_its_predecessor() {
    let mut sched = Scheduler::new();
    // Batch 2 arrives first and creates a placeholder for batch 1.
    sched.register_batch(schedule(2, 1, 1, vec![(2, 1)]));
    // Batch 1 fills the placeholder but depends on the unseen batch 0.
    sched.register_batch(schedule(1, 0, 0, vec![(1, 1)]));

    let one = sched.wait_det(1, 1).unwrap();
    assert!(matches!(one, Turn::Wait(_)), "batch 1 must wait for batch 0");
    let two = sched.wait_det(2, 2).unwrap();
    assert!(matches!(two, Turn::Wait(_)));

    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(matches!(sched.wait_det(0, 0).unwrap(), Turn::Ready));
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);

    one.acquired().await.unwrap();
    assert!(sched.ack_det(1, 1).unwrap().switching_batches);
    two.acquired().await.unwrap();
    assert!(sched.ack_det(2, 2).unwrap().switching_batches);
}

#[tokio::test]
async fn late_delivered_batch_runs_before_its_successors() {
    let mut sched = Scheduler::new();
    // Batch 3 arrives first, creating a placeholder for batch 2; then the
    // independent batch 1 turns up late.
    sched.register_batch(schedule(3, 2, 2, vec![(3, 1)]));
    sched.register_batch(schedule(1, NO_BATCH, NO_BATCH, vec![(1, 1)]));

    // Batch 1 slots in ahead of the unseen batch 2 and runs immediately.
    assert!(matches!(sched.wait_det(1, 1).unwrap(), Turn::Ready));
    let three = sched.wait_det(3, 3).unwrap();
    assert!(matches!(three, Turn::Wait(_)));
    assert!(sched.ack_det(1, 1).unwrap().switching_batches);

    // Batch 2 fills its placeholder behind batch 1.
    sched.register_batch(schedule(2, 1, 1, vec![(2, 1)]));
    assert!(matches!(sched.wait_det(2, 2).unwrap(), Turn::Ready));
    assert!(sched.ack_det(2, 2).unwrap().switching_batches);

    three.acquired().await.unwrap();
    assert!(sched.ack_det(3, 3).unwrap().switching_batches);
}

#[tokio::test]
async fn calls_buffer_until_schedule_arrives() {
    let mut sched = Scheduler::new();
    let early = sched.wait_det(3, 7).unwrap();
    assert!(matches!(early, Turn::Wait(_)));

    sched.register_batch(schedule(3, NO_BATCH, NO_BATCH, vec![(7, 1)]));
    early.acquired().await.unwrap();
    assert!(sched.ack_det(3, 7).unwrap().switching_batches);
}

#[tokio::test]
async fn window_blocks_later_batch_until_drained() {
    let mut sched = Scheduler::new();

    // Nothing ahead: the window opens at the chain root and runs at once.
    let turn = sched.wait_act(100);
    assert!(matches!(turn, Turn::Ready));
    let facts = sched.before_after(100).unwrap();
    assert!(facts.before.is_empty());

    // A batch registered behind the open window must wait for it.
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    let blocked = sched.wait_det(0, 0).unwrap();
    assert!(matches!(blocked, Turn::Wait(_)));
    let facts = sched.before_after(100).unwrap();
    assert_eq!(facts.after.len(), 1);
    assert!(facts.after.contains(&0));

    sched.act_finished(100);
    blocked.acquired().await.unwrap();
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);
}

#[tokio::test]
async fn before_after_facts_for_sandwiched_window() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(matches!(sched.wait_det(0, 0).unwrap(), Turn::Ready));
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);

    // Window after batch 0, then batch 3 (global predecessor 0) after it.
    assert!(matches!(sched.wait_act(50), Turn::Ready));
    sched.register_batch(schedule(3, 0, 0, vec![(3, 1)]));

    let facts = sched.before_after(50).unwrap();
    assert!(facts.before.contains(&0));
    assert_eq!(facts.max_before, 0);
    assert!(facts.after.contains(&3));
    assert_eq!(facts.min_after, 3);
    assert_eq!(facts.min_after_global_pred, 0);
}

#[tokio::test]
async fn commit_resolves_promise_and_prunes() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(matches!(sched.wait_det(0, 0).unwrap(), Turn::Ready));
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);

    let promise = sched.wait_batch_commit(0).unwrap();
    assert!(matches!(promise, Turn::Wait(_)));
    sched.commit_batch(0);
    promise.acquired().await.unwrap();
    assert_eq!(sched.highest_committed(), 0);

    // After pruning the promise is answered from the watermark.
    assert!(matches!(sched.wait_batch_commit(0).unwrap(), Turn::Ready));
}

#[tokio::test]
async fn watermark_commits_covered_batches() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(matches!(sched.wait_det(0, 0).unwrap(), Turn::Ready));
    assert!(sched.ack_det(0, 0).unwrap().switching_batches);

    sched.advance_watermark(0);
    assert_eq!(sched.highest_committed(), 0);

    // A stale re-delivery of the committed schedule is ignored.
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(sched.wait_det(0, 0).is_err());
}

#[tokio::test]
async fn out_of_turn_ack_is_rejected() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1), (1, 1)]));
    assert!(sched.ack_det(0, 1).is_err());
}

#[tokio::test]
async fn undeclared_transaction_is_rejected() {
    let mut sched = Scheduler::new();
    sched.register_batch(schedule(0, NO_BATCH, NO_BATCH, vec![(0, 1)]));
    assert!(sched.wait_det(0, 9).is_err());
}
