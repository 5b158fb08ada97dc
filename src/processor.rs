/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A reference executor of [`Actions`], for library users whose needs it fits and for tests.
//!
//! [`Processor`] does the work an `Actions` value asks for, in the order recommended by
//! [`crate::actions`], and returns the [`ActionResults`] to feed back into the replica. It is
//! pluggable through three traits:
//! 1. [`Link`]: sends messages to every replica, the local one included.
//! 2. [`Log`]: persists `QEntry`s and `PEntry`s.
//! 3. [`App`]: the replicated application, which commits are delivered to.
//!
//! Digests are computed with SHA-256:
//! - The digest of a request is the hash of its borsh encoding.
//! - The digest of a batch is the hash of the concatenation of the digests of its requests.

use std::collections::HashMap;

use borsh::BorshSerialize;
use sha2::{Digest as _, Sha256};

use crate::{
    actions::{
        ActionResults, Actions, Batch, CheckpointResult, Commit, PEntry, ProcessResult, QEntry,
    },
    messages::Msg,
    types::{
        data_types::{ClientID, Digest, ReqNo, SeqNo},
        requests::{PreprocessResult, RequestData},
    },
};

/// Sends messages to every replica.
pub trait Link {
    /// Send `msg` to every replica, the local one included, without blocking.
    fn broadcast(&mut self, msg: Msg);
}

/// Durable storage for the entries a replica must not forget across restarts.
pub trait Log {
    fn persist_q_entry(&mut self, q_entry: &QEntry);

    fn persist_p_entry(&mut self, p_entry: &PEntry);
}

/// The replicated application.
pub trait App {
    /// Apply a committed batch. `requests` holds the data of the batch's requests, in batch order.
    fn deliver(&mut self, commit: &Commit, requests: &[RequestData]);

    /// Get a digest of the application state after everything up to `seq_no` was delivered.
    fn snapshot(&mut self, seq_no: SeqNo) -> Digest;
}

pub struct Processor<L: Link, G: Log, A: App> {
    link: L,
    log: G,
    app: A,
    // Data of the requests seen in `preprocess` and `process` actions, until they are delivered.
    requests: HashMap<(ClientID, ReqNo), RequestData>,
}

impl<L: Link, G: Log, A: App> Processor<L, G, A> {
    pub fn new(link: L, log: G, app: A) -> Self {
        Self {
            link,
            log,
            app,
            requests: HashMap::new(),
        }
    }

    pub fn log(&self) -> &G {
        &self.log
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    /// Execute `actions`, and return the results of the work that produced values.
    pub fn process(&mut self, actions: Actions) -> ActionResults {
        let Actions {
            broadcast,
            preprocess,
            process,
            q_entries,
            p_entries,
            commits,
            checkpoints,
        } = actions;

        // 1. Persist.
        for q_entry in &q_entries {
            self.log.persist_q_entry(q_entry);
        }
        for p_entry in &p_entries {
            self.log.persist_p_entry(p_entry);
        }

        // 2. Send.
        for msg in broadcast {
            self.link.broadcast(msg);
        }

        // 3. Hash.
        let mut results = ActionResults::default();
        for request in preprocess {
            let request_data = request.client_request;
            results.preprocessed.push(PreprocessResult {
                digest: request_digest(&request_data),
                request_data: request_data.clone(),
            });
            self.remember(request_data);
        }
        for batch in process {
            results.processed.push(ProcessResult {
                epoch: batch.epoch,
                seq_no: batch.seq_no,
                digest: batch_digest(&batch.requests),
            });
            self.remember_batch(batch);
        }

        // 4. Deliver.
        for commit in commits {
            let requests: Vec<RequestData> = commit
                .q_entry
                .requests
                .iter()
                .filter_map(|request_ref| {
                    self.requests
                        .remove(&(request_ref.client_id.clone(), request_ref.req_no))
                })
                .collect();
            self.app.deliver(&commit, &requests);
        }

        // 5. Snapshot.
        for seq_no in checkpoints {
            results.checkpoints.push(CheckpointResult {
                seq_no,
                value: self.app.snapshot(seq_no),
            });
        }

        results
    }

    fn remember(&mut self, request_data: RequestData) {
        self.requests.insert(
            (request_data.client_id.clone(), request_data.req_no),
            request_data,
        );
    }

    fn remember_batch(&mut self, batch: Batch) {
        for request in batch.requests {
            self.remember(request.request_data);
        }
    }
}

/// SHA-256 of the borsh encoding of `request_data`.
pub fn request_digest(request_data: &RequestData) -> Digest {
    let bytes = request_data.try_to_vec().unwrap_or_default();
    Digest::new(Sha256::digest(bytes).to_vec())
}

/// SHA-256 of the concatenated digests of `requests`.
pub fn batch_digest(requests: &[PreprocessResult]) -> Digest {
    let mut hasher = Sha256::new();
    for request in requests {
        hasher.update(request.digest.bytes());
    }
    Digest::new(hasher.finalize().to_vec())
}
