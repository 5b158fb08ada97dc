use bucket_bft::{
    messages::{CheckpointMsg, Commit, Forward, Msg},
    node_inbox::{
        Classification, DropReason, InboxContext, NodeInbox, Receipt, RECENT_VIOLATIONS,
    },
    state_machine::ProtocolViolation,
    types::data_types::{BufferSize, Digest, EpochNumber, NodeID, SeqNo},
};

mod common;

use crate::common::fixtures::request_data;

fn context(low_watermark: u64, high_watermark: u64) -> InboxContext {
    InboxContext {
        active_epoch: Some(EpochNumber::new(3)),
        low_watermark: SeqNo::new(low_watermark),
        high_watermark: SeqNo::new(high_watermark),
        epoch_limit: SeqNo::new(100),
    }
}

fn commit(epoch: u64, seq_no: u64) -> Msg {
    Commit {
        epoch: EpochNumber::new(epoch),
        seq_no: SeqNo::new(seq_no),
        digest: Digest::from("digest"),
    }
    .into()
}

fn inbox(capacity: u64) -> NodeInbox {
    NodeInbox::new(NodeID::new(1), BufferSize::new(capacity))
}

#[test]
fn classification_test() {
    let context = context(10, 20);

    assert_eq!(context.classify(&commit(3, 15)), Classification::Deliver);
    assert_eq!(context.classify(&commit(3, 21)), Classification::Buffer);
    assert_eq!(context.classify(&commit(4, 1)), Classification::Buffer);
    assert_eq!(
        context.classify(&commit(3, 10)),
        Classification::Drop(DropReason::Stale)
    );
    assert_eq!(
        context.classify(&commit(2, 15)),
        Classification::Drop(DropReason::Stale)
    );
    assert_eq!(
        context.classify(&commit(5, 15)),
        Classification::Drop(DropReason::Violation(ProtocolViolation::FarFutureEpoch {
            epoch: EpochNumber::new(5),
        }))
    );
    assert_eq!(
        context.classify(&commit(3, 101)),
        Classification::Drop(DropReason::Violation(ProtocolViolation::SeqNoOutOfRange {
            epoch: EpochNumber::new(3),
            seq_no: SeqNo::new(101),
        }))
    );

    let forward: Msg = Forward {
        request_data: request_data("alice", 1),
    }
    .into();
    assert_eq!(context.classify(&forward), Classification::Deliver);
    assert_eq!(
        InboxContext::inactive().classify(&commit(3, 15)),
        Classification::Buffer
    );
}

#[test]
fn messages_are_delivered_in_order_test() {
    let mut inbox = inbox(64 * 1024);

    // 1. A message past the high watermark is queued, and so is every later one.
    assert_eq!(inbox.receive(commit(3, 25), &context(0, 20)), Receipt::Buffered);
    assert_eq!(inbox.receive(commit(3, 5), &context(0, 20)), Receipt::Buffered);
    assert_eq!(inbox.buffered(), 2);
    assert_eq!(
        inbox.buffer_size().int(),
        commit(3, 25).size() + commit(3, 5).size()
    );

    // 2. Draining in the same context delivers nothing.
    assert!(inbox.drain(&context(0, 20)).is_empty());

    // 3. Once the watermarks moved, both are delivered, in order.
    assert_eq!(
        inbox.drain(&context(0, 30)),
        vec![Receipt::Deliver(commit(3, 25)), Receipt::Deliver(commit(3, 5))]
    );
    assert_eq!(inbox.buffered(), 0);
    assert_eq!(inbox.buffer_size().int(), 0);
}

#[test]
fn queued_messages_may_become_stale_test() {
    let mut inbox = inbox(64 * 1024);
    assert_eq!(inbox.receive(commit(4, 5), &context(0, 20)), Receipt::Buffered);

    // Epoch 4 became active, then epoch 6, before the message was drained.
    let mut context = context(0, 20);
    context.active_epoch = Some(EpochNumber::new(6));
    assert_eq!(
        inbox.drain(&context),
        vec![Receipt::Dropped(commit(4, 5), DropReason::Stale)]
    );
    assert_eq!(inbox.violation_count(), 0);
}

#[test]
fn checkpoints_bypass_the_queue_test() {
    let mut inbox = inbox(64 * 1024);
    assert_eq!(inbox.receive(commit(3, 25), &context(0, 20)), Receipt::Buffered);

    let checkpoint: Msg = CheckpointMsg {
        seq_no: SeqNo::new(10),
        value: Digest::from("state"),
    }
    .into();
    assert_eq!(
        inbox.receive(checkpoint.clone(), &context(0, 20)),
        Receipt::Deliver(checkpoint)
    );
    assert_eq!(inbox.buffered(), 1);
}

#[test]
fn full_inbox_drops_messages_test() {
    let capacity = commit(3, 25).size();
    let mut inbox = inbox(capacity);

    assert_eq!(inbox.receive(commit(3, 25), &context(0, 20)), Receipt::Buffered);
    assert_eq!(
        inbox.receive(commit(3, 26), &context(0, 20)),
        Receipt::Dropped(commit(3, 26), DropReason::InboxFull)
    );
    assert_eq!(inbox.buffered(), 1);
}

#[test]
fn violations_are_recorded_test() {
    let mut inbox = inbox(64 * 1024);

    let receipt = inbox.receive(commit(5, 1), &context(0, 20));
    let violation = ProtocolViolation::FarFutureEpoch {
        epoch: EpochNumber::new(5),
    };
    assert_eq!(
        receipt,
        Receipt::Dropped(commit(5, 1), DropReason::Violation(violation.clone()))
    );

    inbox.record_violation(ProtocolViolation::NotLeader {
        epoch: EpochNumber::new(3),
        seq_no: SeqNo::new(1),
    });
    assert_eq!(inbox.violation_count(), 2);
    assert_eq!(inbox.recent_violations().len(), 2);
    assert_eq!(inbox.recent_violations()[0], violation);
    assert_eq!(inbox.node(), NodeID::new(1));
}

#[test]
fn violation_records_are_bounded_test() {
    let mut inbox = inbox(64 * 1024);

    // 1. A replica keeps sending preprepares for buckets it does not lead.
    for seq_no in 1..=100_000 {
        inbox.record_violation(ProtocolViolation::NotLeader {
            epoch: EpochNumber::new(3),
            seq_no: SeqNo::new(seq_no),
        });
    }
    inbox.receive(commit(5, 1), &context(0, 20));

    // 2. Every violation is counted, but only the latest are kept.
    assert_eq!(inbox.violation_count(), 100_001);
    assert_eq!(inbox.violation_counts().get("NotLeader"), Some(&100_000));
    assert_eq!(inbox.violation_counts().get("FarFutureEpoch"), Some(&1));
    assert_eq!(inbox.recent_violations().len(), RECENT_VIOLATIONS);
    assert_eq!(
        inbox.recent_violations().back(),
        Some(&ProtocolViolation::FarFutureEpoch {
            epoch: EpochNumber::new(5),
        })
    );
    assert_eq!(
        inbox.recent_violations().front(),
        Some(&ProtocolViolation::NotLeader {
            epoch: EpochNumber::new(3),
            seq_no: SeqNo::new(100_000 - RECENT_VIOLATIONS as u64 + 2),
        })
    );
}
