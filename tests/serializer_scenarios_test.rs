use std::{sync::mpsc, time::Duration};

use bucket_bft::{
    actions::{ActionResults, Actions, Batch, Commit, PEntry, ProcessResult, QEntry},
    events::{CommitSlotEvent, DropMessageEvent, ProtocolViolationEvent},
    messages::{self, Forward, Msg, Preprepare, Prepare},
    node_inbox::DropReason,
    replica::{Replica, ReplicaError, ReplicaSpec},
    state_machine::ProtocolViolation,
    types::{
        data_types::{Digest, EpochNumber, NodeID, SeqNo},
        network_config::ConfigError,
        requests::Request,
    },
};
use log::LevelFilter;

mod common;

use crate::common::{
    fixtures::{
        configuration, epoch_config, network_config, nodes, preprocessed, request_data,
        request_ref,
    },
    logging::setup_logger,
};

const EPOCH: EpochNumber = EpochNumber::new(3);
const FIRST_SEQ_NO: SeqNo = SeqNo::new(1);

fn next_actions(replica: &Replica) -> Actions {
    replica
        .actions()
        .recv_timeout(Duration::from_secs(5))
        .expect("the replica should have emitted actions")
}

fn assert_no_actions(replica: &Replica) {
    assert!(replica
        .actions()
        .recv_timeout(Duration::from_millis(200))
        .is_err());
}

fn fake_digest() -> Digest {
    Digest::from("fake-digest")
}

fn q_entry() -> QEntry {
    QEntry {
        epoch: EPOCH,
        seq_no: FIRST_SEQ_NO,
        digest: fake_digest(),
        requests: vec![request_ref("client-1", 1, 7)],
    }
}

fn prepare() -> Msg {
    Prepare {
        epoch: EPOCH,
        seq_no: FIRST_SEQ_NO,
        digest: fake_digest(),
    }
    .into()
}

fn commit() -> Msg {
    messages::Commit {
        epoch: EPOCH,
        seq_no: FIRST_SEQ_NO,
        digest: fake_digest(),
    }
    .into()
}

fn processed() -> ActionResults {
    ActionResults {
        processed: vec![ProcessResult {
            epoch: EPOCH,
            seq_no: FIRST_SEQ_NO,
            digest: fake_digest(),
        }],
        ..Default::default()
    }
}

fn preprocess_result() -> ActionResults {
    ActionResults {
        preprocessed: vec![preprocessed("client-1", 1, 7)],
        ..Default::default()
    }
}

#[test]
fn single_replica_commits_a_request_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start a single replica (F = 0), which leads the only bucket of epoch 3.
    let replica = ReplicaSpec::builder()
        .configuration(configuration(0))
        .network_config(network_config(0, 1, 1, 2, 10))
        .epoch_config(epoch_config(3, nodes(1)))
        .build()
        .start()
        .unwrap();

    // 2. Propose a request, and expect to be asked for its digest.
    log::debug!("Proposing a request.");
    replica.propose(request_data("client-1", 1)).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            preprocess: vec![Request {
                source: NodeID::new(0),
                client_request: request_data("client-1", 1),
            }],
            ..Default::default()
        }
    );

    // 3. Return the request digest, and expect the leader to cut a batch for sequence number 1.
    replica.apply_results(preprocess_result()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            process: vec![Batch {
                source: NodeID::new(0),
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                requests: vec![preprocessed("client-1", 1, 7)],
            }],
            ..Default::default()
        }
    );

    // 4. Return the batch digest, and expect the leader to forward the request and preprepare.
    replica.apply_results(processed()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            broadcast: vec![
                Forward {
                    request_data: request_data("client-1", 1),
                }
                .into(),
                Preprepare {
                    epoch: EPOCH,
                    seq_no: FIRST_SEQ_NO,
                    batch: vec![request_ref("client-1", 1, 7)],
                }
                .into(),
            ],
            q_entries: vec![q_entry()],
            ..Default::default()
        }
    );

    // 5. Receive its own preprepare, which on its own is a prepare certificate.
    replica
        .step(
            NodeID::new(0),
            Preprepare {
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                batch: vec![request_ref("client-1", 1, 7)],
            }
            .into(),
        )
        .unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            broadcast: vec![commit()],
            p_entries: vec![PEntry {
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                digest: fake_digest(),
            }],
            ..Default::default()
        }
    );

    // 6. Receive its own commit, and expect the batch to be delivered.
    replica.step(NodeID::new(0), commit()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            commits: vec![Commit { q_entry: q_entry() }],
            ..Default::default()
        }
    );

    // 7. The forwarded request coming back is stale, and yields nothing.
    replica
        .step(
            NodeID::new(0),
            Forward {
                request_data: request_data("client-1", 1),
            }
            .into(),
        )
        .unwrap();
    assert_no_actions(&replica);

    let status = replica.status().unwrap();
    assert_eq!(status.last_delivered, FIRST_SEQ_NO);
    assert_eq!(status.epoch, Some(EPOCH));

    replica.shutdown().unwrap();
}

#[test]
fn follower_commits_a_request_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start replica 0 of four (F = 1). In epoch 3, "client-1" is in bucket 0, which replica 3 leads.
    let replica = ReplicaSpec::builder()
        .configuration(configuration(0))
        .network_config(network_config(1, 4, 4, 5, 10))
        .epoch_config(epoch_config(3, nodes(4)))
        .build()
        .start()
        .unwrap();

    // 2. Propose a request, and expect to be asked for its digest.
    replica.propose(request_data("client-1", 1)).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            preprocess: vec![Request {
                source: NodeID::new(0),
                client_request: request_data("client-1", 1),
            }],
            ..Default::default()
        }
    );

    // 3. The request is ready, but replica 0 does not lead its bucket.
    replica.apply_results(preprocess_result()).unwrap();
    assert_no_actions(&replica);

    // 4. Receive the leader's preprepare, and expect to be asked for the batch digest.
    log::debug!("Receiving the preprepare of replica 3.");
    replica
        .step(
            NodeID::new(3),
            Preprepare {
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                batch: vec![request_ref("client-1", 1, 7)],
            }
            .into(),
        )
        .unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            process: vec![Batch {
                source: NodeID::new(3),
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                requests: vec![preprocessed("client-1", 1, 7)],
            }],
            ..Default::default()
        }
    );

    // 5. Return the batch digest, and expect a prepare.
    replica.apply_results(processed()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            broadcast: vec![prepare()],
            q_entries: vec![q_entry()],
            ..Default::default()
        }
    );

    // 6. Two prepares from non-leaders complete the prepare certificate.
    replica.step(NodeID::new(0), prepare()).unwrap();
    assert_no_actions(&replica);
    replica.step(NodeID::new(1), prepare()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            broadcast: vec![commit()],
            p_entries: vec![PEntry {
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                digest: fake_digest(),
            }],
            ..Default::default()
        }
    );

    // 7. Three commits complete the commit certificate.
    replica.step(NodeID::new(0), commit()).unwrap();
    replica.step(NodeID::new(1), commit()).unwrap();
    assert_no_actions(&replica);
    replica.step(NodeID::new(3), commit()).unwrap();
    assert_eq!(
        next_actions(&replica),
        Actions {
            commits: vec![Commit { q_entry: q_entry() }],
            ..Default::default()
        }
    );

    replica.shutdown().unwrap();
}

#[test]
fn replica_refuses_invalid_configuration_test() {
    // 1. Four nodes cannot tolerate two faults.
    let result = ReplicaSpec::builder()
        .configuration(configuration(0))
        .network_config(network_config(2, 4, 4, 5, 10))
        .build()
        .start();
    assert!(matches!(
        result,
        Err(ConfigError::TooFewNodes { nodes: 4, f: 2 })
    ));

    // 2. The local replica must be one of the nodes.
    let result = ReplicaSpec::builder()
        .configuration(configuration(7))
        .network_config(network_config(1, 4, 4, 5, 10))
        .build()
        .start();
    assert!(matches!(
        result,
        Err(ConfigError::UnknownSelf(id)) if id == NodeID::new(7)
    ));

    // 3. The serializer must have time between ticks to take inputs.
    let mut zero_tick = configuration(0);
    zero_tick.tick_interval = Duration::ZERO;
    let result = ReplicaSpec::builder()
        .configuration(zero_tick)
        .network_config(network_config(1, 4, 4, 5, 10))
        .build()
        .start();
    assert!(matches!(result, Err(ConfigError::ZeroTickInterval)));

    // 4. Epochs must be activated in increasing order.
    let replica = ReplicaSpec::builder()
        .configuration(configuration(0))
        .network_config(network_config(1, 4, 4, 5, 10))
        .epoch_config(epoch_config(3, nodes(4)))
        .build()
        .start()
        .unwrap();
    assert_eq!(
        replica.activate_epoch(epoch_config(2, nodes(4))),
        Err(ReplicaError::Config(ConfigError::StaleEpoch {
            active: EPOCH,
            proposed: EpochNumber::new(2),
        }))
    );
    replica.activate_epoch(epoch_config(4, nodes(4))).unwrap();
    assert_eq!(replica.status().unwrap().epoch, Some(EpochNumber::new(4)));
}

#[test]
fn replica_stops_on_unknown_results_test() {
    // 1. Return a digest for a request that was never proposed.
    let replica = ReplicaSpec::builder()
        .configuration(configuration(0))
        .network_config(network_config(0, 1, 1, 2, 10))
        .epoch_config(epoch_config(3, nodes(1)))
        .build()
        .start()
        .unwrap();
    let handle = replica.handle();
    handle.apply_results(preprocess_result()).unwrap();

    // 2. The serializer stops, and refuses further inputs.
    let mut stopped = false;
    for _ in 0..100 {
        if handle.status() == Err(ReplicaError::Stopped) {
            stopped = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(stopped);
    assert_eq!(
        handle.propose(request_data("client-1", 1)),
        Err(ReplicaError::Stopped)
    );

    // 3. Shutting down reports the failure.
    assert!(replica.shutdown().is_err());
}

#[test]
fn event_handlers_observe_progress_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Start a single replica that logs events, and reports commits, violations, and drops.
    let (commit_sender, commits) = mpsc::channel();
    let (violation_sender, violations) = mpsc::channel();
    let (drop_sender, drops) = mpsc::channel();
    let mut configuration = configuration(0);
    configuration.log_events = true;
    let replica = ReplicaSpec::builder()
        .configuration(configuration)
        .network_config(network_config(0, 1, 1, 2, 10))
        .epoch_config(epoch_config(3, nodes(1)))
        .on_commit_slot(move |event: &CommitSlotEvent| {
            let _ = commit_sender.send((event.seq_no, event.digest.clone()));
        })
        .on_protocol_violation(move |event: &ProtocolViolationEvent| {
            let _ = violation_sender.send((event.origin, event.violation.clone()));
        })
        .on_drop_message(move |event: &DropMessageEvent| {
            let _ = drop_sender.send((event.kind, event.reason.clone()));
        })
        .build()
        .start()
        .unwrap();

    // 2. Commit a request.
    replica.propose(request_data("client-1", 1)).unwrap();
    next_actions(&replica);
    replica.apply_results(preprocess_result()).unwrap();
    next_actions(&replica);
    replica.apply_results(processed()).unwrap();
    next_actions(&replica);
    replica
        .step(
            NodeID::new(0),
            Preprepare {
                epoch: EPOCH,
                seq_no: FIRST_SEQ_NO,
                batch: vec![request_ref("client-1", 1, 7)],
            }
            .into(),
        )
        .unwrap();
    next_actions(&replica);
    replica.step(NodeID::new(0), commit()).unwrap();
    next_actions(&replica);
    assert_eq!(
        commits.recv_timeout(Duration::from_secs(5)),
        Ok((FIRST_SEQ_NO, fake_digest()))
    );

    // 3. A vote for a far future epoch is dropped, and recorded as a violation.
    let far_future = Prepare {
        epoch: EpochNumber::new(5),
        seq_no: FIRST_SEQ_NO,
        digest: fake_digest(),
    };
    replica.step(NodeID::new(0), far_future.into()).unwrap();
    let violation = ProtocolViolation::FarFutureEpoch {
        epoch: EpochNumber::new(5),
    };
    assert_eq!(
        violations.recv_timeout(Duration::from_secs(5)),
        Ok((NodeID::new(0), violation.clone()))
    );
    assert_eq!(
        drops.recv_timeout(Duration::from_secs(5)),
        Ok(("Prepare", DropReason::Violation(violation)))
    );

    // 4. Shutting down stops the event bus, which drops the handlers.
    replica.shutdown().unwrap();
    assert!(commits.recv().is_err());
}
