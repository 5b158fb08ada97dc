use std::collections::HashMap;

use bucket_bft::types::data_types::{ClientID, ReqNo, SeqNo};
use log::LevelFilter;

mod common;

use crate::common::{
    fixtures::{client_in_bucket, epoch_config, network_config, nodes, request_data},
    logging::setup_logger,
    node::Cluster,
};

/// Check that every replica delivered the same requests in the same order, and that the requests of
/// every client were delivered in request number order, without gaps.
fn assert_agreement(cluster: &Cluster, expected_requests: usize) {
    let reference = &cluster.nodes[0].processor.app().delivered;
    assert_eq!(reference.len(), expected_requests);
    for node in &cluster.nodes[1..] {
        assert_eq!(&node.processor.app().delivered, reference);
    }

    let mut next_req_no: HashMap<ClientID, ReqNo> = HashMap::new();
    let mut last_seq_no = SeqNo::init();
    for (seq_no, request) in reference {
        assert!(*seq_no >= last_seq_no);
        last_seq_no = *seq_no;

        let next = next_req_no
            .entry(request.client_id.clone())
            .or_insert(ReqNo::first());
        assert_eq!(request.req_no, *next);
        *next += 1;
    }
}

/// Check that every replica delivered every sequence number up to the same one, and that every
/// checkpoint up to it became stable.
fn assert_progress(cluster: &Cluster) {
    let last_delivered = cluster.nodes[0].state_machine.status().last_delivered;
    let stable = cluster.nodes[0].state_machine.status().stable_checkpoint;
    assert_eq!(
        stable.seq_no,
        SeqNo::new(last_delivered.int() / 5 * 5)
    );

    for node in &cluster.nodes {
        let status = node.state_machine.status();
        assert_eq!(status.last_delivered, last_delivered);
        assert_eq!(status.stable_checkpoint, stable);
        assert_eq!(node.processor.app().batches, last_delivered.int());
        assert_eq!(
            node.processor.log().q_entries.len() as u64,
            last_delivered.int()
        );
        assert!(status.inboxes.iter().all(|inbox| inbox.violations == 0));
    }
}

#[test]
fn replicas_agree_on_every_bucket_test() {
    setup_logger(LevelFilter::Info);

    // 1. Four replicas (F = 1), four buckets, checkpoints every 5 sequence numbers.
    let network_config = network_config(1, 4, 4, 5, 100);
    let clients: Vec<String> = (0..4)
        .map(|bucket| client_in_bucket(&network_config, bucket))
        .collect();
    let mut cluster = Cluster::new(network_config, epoch_config(1, nodes(4)), 7);

    // 2. Every client submits 5 requests to every replica.
    for req_no in 1..=5 {
        for client in &clients {
            cluster.propose(request_data(client, req_no));
        }
    }
    cluster.run();

    // 3. Every request was delivered, in the same order, by every replica.
    assert_agreement(&cluster, 20);
    assert_progress(&cluster);
}

#[test]
fn idle_buckets_do_not_block_the_order_test() {
    setup_logger(LevelFilter::Info);

    // 1. Only buckets 0 and 2 receive requests.
    let network_config = network_config(1, 4, 4, 5, 100);
    let clients: Vec<String> = [0, 2]
        .iter()
        .map(|bucket| client_in_bucket(&network_config, *bucket))
        .collect();
    let mut cluster = Cluster::new(network_config, epoch_config(2, nodes(4)), 11);

    for req_no in 1..=3 {
        for client in &clients {
            cluster.propose(request_data(client, req_no));
        }
    }
    cluster.run();

    // 2. Bucket 2 holds sequence number 3 or a later one, so the sequence numbers of buckets 1 and 3
    //    below it were filled with empty batches.
    assert_agreement(&cluster, 6);
    assert_progress(&cluster);
    let status = cluster.nodes[0].state_machine.status();
    assert!(status.last_delivered >= SeqNo::new(3));
}

#[test]
fn replicas_agree_under_different_schedules_test() {
    let network_config = network_config(1, 4, 4, 5, 100);
    let clients: Vec<String> = (0..4)
        .map(|bucket| client_in_bucket(&network_config, bucket))
        .collect();

    for seed in 0..5 {
        let mut cluster = Cluster::new(network_config.clone(), epoch_config(0, nodes(4)), seed);
        for req_no in 1..=3 {
            for client in &clients {
                cluster.propose(request_data(client, req_no));
            }
        }
        cluster.run();
        assert_agreement(&cluster, 12);
        assert_progress(&cluster);
    }
}
