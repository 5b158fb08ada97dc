/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! One era of sequencing under a fixed leader set.
//!
//! ## Buckets and leaders
//!
//! The sequence numbers of an epoch start right after its starting checkpoint, and are partitioned
//! round-robin across `number_of_buckets` buckets:
//!
//! ```text
//! bucket(seq_no) = (seq_no - starting_checkpoint.seq_no - 1) mod number_of_buckets
//! leader(bucket) = leaders[(bucket + epoch_number) mod leaders.len()]
//! ```
//!
//! Every bucket is driven by its own leader, so up to `number_of_buckets` preprepares can be in
//! flight at the same time. Each client is mapped to one bucket (see
//! [`NetworkConfig::client_bucket`]), which makes the client's requests ordered by a single leader.
//!
//! ## Batch formation
//!
//! As leader of a bucket, the local replica appends the ready requests of the bucket's clients to the
//! bucket's pending batch, and cuts the batch into the bucket's next sequence number when:
//! 1. The size of its requests reaches [`BatchParameters::cut_size_bytes`], or
//! 2. It has been non-empty for [`BatchParameters::cut_ticks`] ticks, or
//! 3. It is empty, but a higher sequence number of the epoch was already preprepared, so that an idle
//!    bucket does not hold back the total order.
//!
//! A batch is only cut into a sequence number at or below the high watermark.

pub(crate) mod certificates;

pub(crate) mod slot;

use std::{collections::BTreeMap, mem, sync::mpsc::Sender, time::SystemTime};

use crate::{
    actions::{Actions, Batch, Commit, ProcessResult},
    checkpoint::CheckpointTracker,
    client_window::{BatchResolution, ClientWindows, InvalidBatch},
    events::*,
    messages::{self, Forward, Msg, Preprepare, Prepare},
    replica::BatchParameters,
    state_machine::{ProtocolViolation, SlotStatus, StateMachineError},
    types::{
        data_types::{encoded_size, BucketID, ClientID, Digest, EpochNumber, NodeID, SeqNo},
        network_config::{EpochConfig, NetworkConfig},
        requests::{PreprocessResult, RequestRef},
    },
};

use self::{
    certificates::Collected,
    slot::{Content, Slot},
};

pub use self::slot::Phase;

/// Everything outside of the epoch that applying an input to it reads or changes.
pub(crate) struct EpochContext<'a> {
    pub(crate) me: NodeID,
    pub(crate) network_config: &'a NetworkConfig,
    pub(crate) batch_parameters: &'a BatchParameters,
    pub(crate) client_windows: &'a mut ClientWindows,
    pub(crate) checkpoints: &'a mut CheckpointTracker,
    pub(crate) event_publisher: &'a Option<Sender<Event>>,
    pub(crate) actions: &'a mut Actions,
    /// Protocol violations detected while applying the input, with the replica that committed them.
    pub(crate) violations: Vec<(NodeID, ProtocolViolation)>,
}

impl<'a> EpochContext<'a> {
    fn broadcast(&mut self, msg: impl Into<Msg>) {
        self.actions.broadcast.push(msg.into())
    }

    fn violation(&mut self, node: NodeID, violation: ProtocolViolation) {
        self.violations.push((node, violation))
    }
}

struct Bucket {
    id: BucketID,
    leader: NodeID,
    next_seq_no: SeqNo,
    pending: PendingBatch,
}

#[derive(Default)]
struct PendingBatch {
    requests: Vec<PreprocessResult>,
    size: u64,
    ticks: u64,
}

pub(crate) struct Epoch {
    config: EpochConfig,
    limit: SeqNo,
    buckets: Vec<Bucket>,
    slots: BTreeMap<SeqNo, Slot>,
    last_delivered: SeqNo,
    highest_preprepared: SeqNo,
}

impl Epoch {
    /// Create an epoch. `config` must have been validated against `network_config`.
    pub(crate) fn new(config: EpochConfig, network_config: &NetworkConfig) -> Epoch {
        let base = config.starting_checkpoint.seq_no;
        let buckets = (0..network_config.number_of_buckets)
            .map(|bucket| {
                let leader_index = (bucket + config.number.int()) % config.leaders.len() as u64;
                Bucket {
                    id: BucketID::new(bucket),
                    leader: config.leaders[leader_index as usize],
                    next_seq_no: base + 1 + bucket,
                    pending: PendingBatch::default(),
                }
            })
            .collect();

        Epoch {
            limit: base + network_config.max_epoch_length,
            last_delivered: base,
            highest_preprepared: base,
            buckets,
            slots: BTreeMap::new(),
            config,
        }
    }

    pub(crate) fn number(&self) -> EpochNumber {
        self.config.number
    }

    /// The last sequence number of the epoch.
    pub(crate) fn limit(&self) -> SeqNo {
        self.limit
    }

    /// The highest sequence number whose batch was handed to the application.
    pub(crate) fn last_delivered(&self) -> SeqNo {
        self.last_delivered
    }

    pub(crate) fn bucket_of(&self, seq_no: SeqNo) -> Option<BucketID> {
        let base = self.config.starting_checkpoint.seq_no;
        if seq_no <= base || seq_no > self.limit {
            return None;
        }
        Some(BucketID::new((seq_no - base - 1) % self.buckets.len() as u64))
    }

    pub(crate) fn leader_of_bucket(&self, bucket: BucketID) -> NodeID {
        self.buckets[bucket.int() as usize].leader
    }

    /// The buckets the local replica leads.
    pub(crate) fn led_buckets(&self, me: NodeID) -> Vec<BucketID> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.leader == me)
            .map(|bucket| bucket.id)
            .collect()
    }

    /// Number of requests waiting in pending batches.
    pub(crate) fn pending_requests(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.pending.requests.len())
            .sum()
    }

    pub(crate) fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.slots
            .values()
            .map(|slot| SlotStatus {
                seq_no: slot.seq_no,
                bucket: slot.bucket,
                leader: slot.leader,
                phase: slot.phase,
                prepares: slot.prepares.len(),
                commits: slot.commits.len(),
                conflicted: slot.conflicted,
            })
            .collect()
    }

    /// Move the ready requests of `client_id` into the pending batch of its bucket, if the local
    /// replica leads that bucket, cutting the batch if it grew large enough.
    pub(crate) fn batch_ready_requests(&mut self, client_id: &ClientID, ctx: &mut EpochContext) {
        let index = ctx.network_config.client_bucket(client_id).int() as usize;
        if self.buckets[index].leader != ctx.me {
            return;
        }

        let ready = ctx.client_windows.window_mut(client_id).drain_ready();
        if ready.is_empty() {
            return;
        }

        let pending = &mut self.buckets[index].pending;
        for request in ready {
            pending.size = pending
                .size
                .saturating_add(encoded_size(&request.request_data));
            pending.requests.push(request);
        }

        if pending.size >= ctx.batch_parameters.cut_size_bytes {
            self.cut(index, ctx);
        }
    }

    /// [`batch_ready_requests`](Self::batch_ready_requests) for every known client.
    pub(crate) fn batch_all_ready_requests(&mut self, ctx: &mut EpochContext) {
        let mut clients: Vec<ClientID> = ctx
            .client_windows
            .iter_mut()
            .map(|(client_id, _)| client_id.clone())
            .collect();
        clients.sort();
        for client_id in clients {
            self.batch_ready_requests(&client_id, ctx);
        }
    }

    /// Advance the cut timers of the pending batches of the local replica's buckets, cutting the ones
    /// that expired, and fill the gaps below the highest preprepared sequence number.
    pub(crate) fn tick(&mut self, ctx: &mut EpochContext) {
        for index in 0..self.buckets.len() {
            if self.buckets[index].leader != ctx.me {
                continue;
            }

            let bucket = &mut self.buckets[index];
            if !bucket.pending.requests.is_empty() {
                bucket.pending.ticks += 1;
                if bucket.pending.ticks >= ctx.batch_parameters.cut_ticks {
                    self.cut(index, ctx);
                }
            } else if bucket.next_seq_no < self.highest_preprepared {
                self.cut(index, ctx);
            }
        }
    }

    /// Cut the pending batches that could not be cut before because the high watermark was in the
    /// way.
    pub(crate) fn retry_cuts(&mut self, ctx: &mut EpochContext) {
        for index in 0..self.buckets.len() {
            let bucket = &self.buckets[index];
            if bucket.leader != ctx.me || bucket.pending.requests.is_empty() {
                continue;
            }
            if bucket.pending.size >= ctx.batch_parameters.cut_size_bytes
                || bucket.pending.ticks >= ctx.batch_parameters.cut_ticks
            {
                self.cut(index, ctx);
            }
        }
    }

    /// Cut the pending batch of the bucket at `index` into the bucket's next sequence number, and ask
    /// for its digest. Returns whether the batch was cut.
    fn cut(&mut self, index: usize, ctx: &mut EpochContext) -> bool {
        let high_watermark = ctx.checkpoints.high_watermark(self.limit);
        let number_of_buckets = self.buckets.len() as u64;
        let epoch = self.config.number;

        let bucket = &mut self.buckets[index];
        let seq_no = bucket.next_seq_no;
        if seq_no > high_watermark {
            return false;
        }
        let pending = mem::take(&mut bucket.pending);
        bucket.next_seq_no += number_of_buckets;
        let (bucket_id, leader) = (bucket.id, bucket.leader);

        let batch: Vec<RequestRef> = pending
            .requests
            .iter()
            .map(PreprocessResult::request_ref)
            .collect();
        ctx.client_windows.assign_batch(&batch, seq_no);

        let slot = self
            .slots
            .entry(seq_no)
            .or_insert_with(|| Slot::new(epoch, seq_no, bucket_id, leader));
        slot.content = Content::Processing(batch);
        slot.requests = pending.requests.clone();

        Event::publish(
            ctx.event_publisher,
            Event::CutBatch(CutBatchEvent {
                timestamp: SystemTime::now(),
                epoch,
                seq_no,
                bucket: bucket_id,
                requests: pending.requests.len(),
            }),
        );

        ctx.actions.process.push(Batch {
            source: ctx.me,
            epoch,
            seq_no,
            requests: pending.requests,
        });
        true
    }

    /// Accept the digest of a batch handed out for processing.
    ///
    /// # Errors
    /// - [`StateMachineError::UnknownBatch`] if no batch was handed out for the slot.
    /// - [`StateMachineError::MismatchedBatchResult`] if the slot's batch was already digested to a
    ///   different value.
    pub(crate) fn on_processed(
        &mut self,
        result: ProcessResult,
        ctx: &mut EpochContext,
    ) -> Result<(), StateMachineError> {
        let epoch = self.config.number;
        let seq_no = result.seq_no;
        let slot = match self.slots.get_mut(&seq_no) {
            Some(slot) => slot,
            None if seq_no <= self.last_delivered => return Ok(()),
            None => return Err(StateMachineError::UnknownBatch { epoch, seq_no }),
        };

        let batch = match &slot.content {
            Content::Processing(batch) => batch.clone(),
            Content::Digested(_, digest) if *digest == result.digest => return Ok(()),
            Content::Digested(_, digest) => {
                return Err(StateMachineError::MismatchedBatchResult {
                    epoch,
                    seq_no,
                    expected: digest.clone(),
                    actual: result.digest,
                })
            }
            Content::Unknown | Content::Waiting(_) => {
                return Err(StateMachineError::UnknownBatch { epoch, seq_no })
            }
        };
        slot.content = Content::Digested(batch.clone(), result.digest.clone());
        // Equivocation was detected while the batch was being digested.
        if slot.conflicted {
            return Ok(());
        }

        if let Some(q_entry) = slot.q_entry() {
            ctx.actions.q_entries.push(q_entry);
        }

        if slot.leader == ctx.me {
            for request in &slot.requests {
                ctx.broadcast(Forward {
                    request_data: request.request_data.clone(),
                });
            }
            ctx.broadcast(Preprepare {
                epoch,
                seq_no,
                batch,
            });
            slot.phase = Phase::Preprepared;
            self.highest_preprepared = self.highest_preprepared.max(seq_no);

            Event::publish(
                ctx.event_publisher,
                Event::Preprepare(PreprepareEvent {
                    timestamp: SystemTime::now(),
                    epoch,
                    seq_no,
                    digest: result.digest.clone(),
                }),
            );
        } else {
            ctx.broadcast(Prepare {
                epoch,
                seq_no,
                digest: result.digest.clone(),
            });
        }

        // Votes that arrived before the digest was known.
        let dissenters: Vec<(NodeID, ProtocolViolation)> = slot
            .prepares
            .dissenters(&result.digest)
            .chain(slot.commits.dissenters(&result.digest))
            .map(|(voter, digest)| {
                (
                    voter,
                    ProtocolViolation::ConflictingVote {
                        epoch,
                        seq_no,
                        digest: digest.clone(),
                    },
                )
            })
            .collect();
        ctx.violations.extend(dissenters);

        self.advance(seq_no, ctx);
        Ok(())
    }

    pub(crate) fn on_preprepare(
        &mut self,
        source: NodeID,
        preprepare: Preprepare,
        ctx: &mut EpochContext,
    ) {
        let epoch = self.config.number;
        let seq_no = preprepare.seq_no;
        let bucket = match self.bucket_of(seq_no) {
            Some(bucket) => bucket,
            None => {
                ctx.violation(source, ProtocolViolation::SeqNoOutOfRange { epoch, seq_no });
                return;
            }
        };
        let leader = self.leader_of_bucket(bucket);
        if source != leader {
            ctx.violation(source, ProtocolViolation::NotLeader { epoch, seq_no });
            return;
        }

        let slot = self
            .slots
            .entry(seq_no)
            .or_insert_with(|| Slot::new(epoch, seq_no, bucket, leader));

        if slot.preprepare_received {
            if slot.content.batch() != Some(&preprepare.batch[..]) {
                slot.conflicted = true;
                ctx.violation(source, ProtocolViolation::Equivocation { epoch, seq_no });
            }
            return;
        }

        match slot.content {
            Content::Unknown => {
                slot.preprepare_received = true;
                slot.phase = Phase::Preprepared;
                self.highest_preprepared = self.highest_preprepared.max(seq_no);

                Event::publish(
                    ctx.event_publisher,
                    Event::ReceivePreprepare(ReceivePreprepareEvent {
                        timestamp: SystemTime::now(),
                        origin: source,
                        epoch,
                        seq_no,
                        requests: preprepare.batch.len(),
                    }),
                );

                let wrong_bucket = preprepare
                    .batch
                    .iter()
                    .find(|request| ctx.network_config.client_bucket(&request.client_id) != bucket)
                    .cloned();
                slot.content = Content::Waiting(preprepare.batch);

                if let Some(request) = wrong_bucket {
                    slot.conflicted = true;
                    ctx.violation(
                        source,
                        ProtocolViolation::InvalidBatch {
                            epoch,
                            seq_no,
                            reason: InvalidBatch::WrongBucket {
                                client_id: request.client_id,
                                req_no: request.req_no,
                            },
                        },
                    );
                    return;
                }

                self.materialize_waiting(ctx);
            }
            // The local replica leads the slot, and this is its own preprepare coming back.
            _ => {
                if slot.content.batch() == Some(&preprepare.batch[..]) {
                    slot.preprepare_received = true;
                    self.advance(seq_no, ctx);
                } else {
                    slot.conflicted = true;
                    ctx.violation(source, ProtocolViolation::Equivocation { epoch, seq_no });
                }
            }
        }
    }

    pub(crate) fn on_prepare(&mut self, source: NodeID, prepare: Prepare, ctx: &mut EpochContext) {
        let epoch = self.config.number;
        let seq_no = prepare.seq_no;
        let bucket = match self.bucket_of(seq_no) {
            Some(bucket) => bucket,
            None => {
                ctx.violation(source, ProtocolViolation::SeqNoOutOfRange { epoch, seq_no });
                return;
            }
        };
        let leader = self.leader_of_bucket(bucket);
        if source == leader {
            ctx.violation(source, ProtocolViolation::LeaderPrepare { epoch, seq_no });
            return;
        }

        let slot = self
            .slots
            .entry(seq_no)
            .or_insert_with(|| Slot::new(epoch, seq_no, bucket, leader));
        let accepted = Self::check_vote(
            slot.collect_prepare(source, prepare.digest.clone()),
            slot,
            source,
            prepare.digest,
            ctx,
        );
        if accepted {
            self.advance(seq_no, ctx);
        }
    }

    pub(crate) fn on_commit(
        &mut self,
        source: NodeID,
        commit: messages::Commit,
        ctx: &mut EpochContext,
    ) {
        let epoch = self.config.number;
        let seq_no = commit.seq_no;
        let bucket = match self.bucket_of(seq_no) {
            Some(bucket) => bucket,
            None => {
                ctx.violation(source, ProtocolViolation::SeqNoOutOfRange { epoch, seq_no });
                return;
            }
        };
        let leader = self.leader_of_bucket(bucket);

        let slot = self
            .slots
            .entry(seq_no)
            .or_insert_with(|| Slot::new(epoch, seq_no, bucket, leader));
        let accepted = Self::check_vote(
            slot.collect_commit(source, commit.digest.clone()),
            slot,
            source,
            commit.digest,
            ctx,
        );
        if accepted {
            self.advance(seq_no, ctx);
        }
    }

    /// Record the violation revealed by a collected vote, if any. Returns whether the vote was
    /// counted.
    fn check_vote(
        collected: Collected,
        slot: &Slot,
        source: NodeID,
        digest: Digest,
        ctx: &mut EpochContext,
    ) -> bool {
        let conflicting = match &collected {
            Collected::Duplicate => return false,
            Collected::Conflicting { .. } => true,
            Collected::New => slot.digest().is_some_and(|local| *local != digest),
        };
        if conflicting {
            ctx.violation(
                source,
                ProtocolViolation::ConflictingVote {
                    epoch: slot.epoch,
                    seq_no: slot.seq_no,
                    digest,
                },
            );
        }
        collected == Collected::New
    }

    /// Hand out, in sequence number order, the batches of the preprepared slots whose requests have
    /// all become ready locally.
    pub(crate) fn materialize_waiting(&mut self, ctx: &mut EpochContext) {
        let epoch = self.config.number;
        for slot in self.slots.values_mut() {
            if slot.conflicted {
                continue;
            }
            let batch = match &slot.content {
                Content::Waiting(batch) => batch.clone(),
                _ => continue,
            };

            match ctx.client_windows.resolve_batch(&batch, slot.seq_no) {
                BatchResolution::Ready(requests) => {
                    ctx.client_windows.assign_batch(&batch, slot.seq_no);
                    slot.content = Content::Processing(batch);
                    ctx.actions.process.push(Batch {
                        source: slot.leader,
                        epoch,
                        seq_no: slot.seq_no,
                        requests,
                    });
                }
                BatchResolution::Waiting => (),
                BatchResolution::Invalid(reason) => {
                    slot.conflicted = true;
                    ctx.violation(
                        slot.leader,
                        ProtocolViolation::InvalidBatch {
                            epoch,
                            seq_no: slot.seq_no,
                            reason,
                        },
                    );
                }
            }
        }
    }

    /// Move the slot at `seq_no` as far through its phases as the collected evidence allows.
    fn advance(&mut self, seq_no: SeqNo, ctx: &mut EpochContext) {
        let epoch = self.config.number;
        let slot = match self.slots.get_mut(&seq_no) {
            Some(slot) => slot,
            None => return,
        };

        if !slot.conflicted && slot.competing_digest(ctx.network_config).is_some() {
            slot.conflicted = true;
            ctx.violation(slot.leader, ProtocolViolation::Equivocation { epoch, seq_no });
            return;
        }

        if slot.can_prepare(ctx.network_config) {
            slot.phase = Phase::Prepared;
            if let Some(p_entry) = slot.p_entry() {
                ctx.broadcast(messages::Commit {
                    epoch,
                    seq_no,
                    digest: p_entry.digest.clone(),
                });
                Event::publish(
                    ctx.event_publisher,
                    Event::Prepared(PreparedEvent {
                        timestamp: SystemTime::now(),
                        epoch,
                        seq_no,
                        digest: p_entry.digest.clone(),
                    }),
                );
                ctx.actions.p_entries.push(p_entry);
            }
        }

        if slot.can_commit(ctx.network_config) {
            slot.phase = Phase::Committed;
            if let Some(digest) = slot.digest() {
                Event::publish(
                    ctx.event_publisher,
                    Event::CommitSlot(CommitSlotEvent {
                        timestamp: SystemTime::now(),
                        epoch,
                        seq_no,
                        digest: digest.clone(),
                    }),
                );
            }
            self.deliver(ctx);
        }
    }

    /// Deliver every committed slot that directly follows the last delivered one, and request the
    /// application state digest at checkpoint sequence numbers.
    fn deliver(&mut self, ctx: &mut EpochContext) {
        loop {
            let next = self.last_delivered + 1;
            let q_entry = match self.slots.get(&next) {
                Some(slot) if slot.phase == Phase::Committed => match slot.q_entry() {
                    Some(q_entry) => q_entry,
                    None => return,
                },
                _ => return,
            };

            let admitted = ctx.client_windows.observe_commits(&q_entry.requests);
            ctx.actions.preprocess.extend(admitted);
            ctx.actions.commits.push(Commit { q_entry });
            self.last_delivered = next;

            if ctx.checkpoints.is_checkpoint(next) {
                ctx.checkpoints.request(next);
                ctx.actions.checkpoints.push(next);
                Event::publish(
                    ctx.event_publisher,
                    Event::RequestCheckpoint(RequestCheckpointEvent {
                        timestamp: SystemTime::now(),
                        seq_no: next,
                    }),
                );
            }
        }
    }

    /// Forget the slots that were delivered, and are covered by the stable checkpoint at `stable`.
    pub(crate) fn garbage_collect(&mut self, stable: SeqNo) {
        let bound = stable.min(self.last_delivered);
        self.slots = self.slots.split_off(&(bound + 1));
    }
}
