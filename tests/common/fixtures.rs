use std::time::Duration;

use bucket_bft::{
    replica::{BatchParameters, Configuration},
    types::{
        data_types::{BufferSize, ClientID, Digest, EpochNumber, NodeID, ReqNo},
        network_config::{Checkpoint, EpochConfig, NetworkConfig},
        requests::{PreprocessResult, RequestData, RequestRef},
    },
};

pub(crate) fn nodes(n: u64) -> Vec<NodeID> {
    (0..n).map(NodeID::new).collect()
}

pub(crate) fn network_config(
    f: u64,
    n: u64,
    number_of_buckets: u64,
    checkpoint_interval: u64,
    max_epoch_length: u64,
) -> NetworkConfig {
    NetworkConfig {
        nodes: nodes(n),
        f,
        number_of_buckets,
        checkpoint_interval,
        max_epoch_length,
    }
}

pub(crate) fn epoch_config(number: u64, leaders: Vec<NodeID>) -> EpochConfig {
    EpochConfig {
        number: EpochNumber::new(number),
        leaders,
        starting_checkpoint: Checkpoint::genesis(),
    }
}

/// A configuration that cuts a batch for every request, and never ticks on its own.
pub(crate) fn configuration(id: u64) -> Configuration {
    Configuration::builder()
        .id(NodeID::new(id))
        .batch_parameters(BatchParameters {
            cut_size_bytes: 1,
            cut_ticks: 1,
        })
        .tick_interval(Duration::from_secs(3600))
        .node_inbox_capacity(BufferSize::new(64 * 1024))
        .client_window_width(100)
        .log_events(false)
        .build()
}

pub(crate) fn request_data(client: &str, req_no: u64) -> RequestData {
    RequestData {
        client_id: ClientID::from(client),
        req_no: ReqNo::new(req_no),
        data: b"data".to_vec(),
        signature: b"signature".to_vec(),
    }
}

/// The eight big-endian bytes of `value`, as a digest.
pub(crate) fn u64_digest(value: u64) -> Digest {
    Digest::new(value.to_be_bytes().to_vec())
}

pub(crate) fn preprocessed(client: &str, req_no: u64, digest: u64) -> PreprocessResult {
    PreprocessResult {
        digest: u64_digest(digest),
        request_data: request_data(client, req_no),
    }
}

pub(crate) fn request_ref(client: &str, req_no: u64, digest: u64) -> RequestRef {
    preprocessed(client, req_no, digest).request_ref()
}

/// A client id that `network_config` maps to `bucket`.
pub(crate) fn client_in_bucket(network_config: &NetworkConfig, bucket: u64) -> String {
    (0..)
        .map(|i| format!("client-{}", i))
        .find(|client| {
            network_config
                .client_bucket(&ClientID::from(client.as_str()))
                .int()
                == bucket
        })
        .unwrap()
}
