/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The deterministic ordering core.
//!
//! [`StateMachine`] composes the [client windows](crate::client_window), the
//! [node inboxes](crate::node_inbox), the [checkpoint tracker](crate::checkpoint), and the active
//! [epoch](crate::epoch). It accepts four kinds of input:
//! 1. [`propose`](StateMachine::propose): a client request submitted to the local replica.
//! 2. [`step`](StateMachine::step): a message received from a replica (the local one included).
//! 3. [`apply_results`](StateMachine::apply_results): the results of work requested by earlier
//!    [`Actions`].
//! 4. [`tick`](StateMachine::tick): the passage of time.
//!
//! Each input is applied completely before the next, and yields the [`Actions`] the caller must now
//! execute. `StateMachine` does no I/O and reads no clock, so the same inputs in the same order
//! always yield the same actions.
//!
//! ## Errors
//!
//! Misbehaving replicas cannot make `StateMachine` fail. What they send wrong is recorded as a
//! [`ProtocolViolation`] against them, and at worst blocks the slot it was about. Only results that
//! do not match what `StateMachine` requested, which can only come from a bug in the caller, fail an
//! input with a [`StateMachineError`].

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::SystemTime,
};

use crate::{
    actions::{ActionResults, Actions},
    checkpoint::{CheckpointOutcome, CheckpointTracker},
    client_window::{ClientWindow, ClientWindows, InvalidBatch},
    epoch::{Epoch, EpochContext, Phase},
    events::*,
    messages::{CheckpointMsg, Msg},
    node_inbox::{DropReason, InboxContext, NodeInbox, Receipt},
    replica::{BatchParameters, Configuration},
    types::{
        data_types::{BucketID, BufferSize, ClientID, Digest, EpochNumber, NodeID, ReqNo, SeqNo},
        network_config::{Checkpoint, ConfigError, EpochConfig, NetworkConfig},
        requests::{Request, RequestData},
    },
};

pub struct StateMachine {
    id: NodeID,
    network_config: NetworkConfig,
    batch_parameters: BatchParameters,
    client_windows: ClientWindows,
    node_inboxes: BTreeMap<NodeID, NodeInbox>,
    checkpoints: CheckpointTracker,
    active_epoch: Option<Epoch>,
    event_publisher: Option<Sender<Event>>,
}

impl StateMachine {
    /// Create a state machine for the replica `configuration.id`, with no active epoch.
    pub fn new(
        configuration: &Configuration,
        network_config: NetworkConfig,
    ) -> Result<StateMachine, ConfigError> {
        network_config.validate()?;
        if !network_config.contains(configuration.id) {
            return Err(ConfigError::UnknownSelf(configuration.id));
        }

        let node_inboxes = network_config
            .nodes
            .iter()
            .map(|node| {
                (
                    *node,
                    NodeInbox::new(*node, configuration.node_inbox_capacity),
                )
            })
            .collect();

        Ok(StateMachine {
            id: configuration.id,
            batch_parameters: configuration.batch_parameters.clone(),
            client_windows: ClientWindows::new(configuration.client_window_width),
            checkpoints: CheckpointTracker::new(&network_config),
            node_inboxes,
            network_config,
            active_epoch: None,
            event_publisher: None,
        })
    }

    pub(crate) fn set_event_publisher(&mut self, event_publisher: Option<Sender<Event>>) {
        self.event_publisher = event_publisher;
    }

    pub fn id(&self) -> NodeID {
        self.id
    }

    pub fn network_config(&self) -> &NetworkConfig {
        &self.network_config
    }

    /// The inbox of the messages received from `node`.
    pub fn node_inbox(&self, node: NodeID) -> Option<&NodeInbox> {
        self.node_inboxes.get(&node)
    }

    /// The admission window of `client_id`, if a request of the client was ever seen.
    pub fn client_window(&self, client_id: &ClientID) -> Option<&ClientWindow> {
        self.client_windows.get(client_id)
    }

    /// Start sequencing in a new epoch.
    ///
    /// Requests that were assigned to sequence numbers but not committed in the previous epoch become
    /// ready to be batched again. Messages queued for the new epoch are delivered.
    ///
    /// # Errors
    /// If `epoch_config` is invalid, or does not come after the active epoch.
    pub fn activate_epoch(&mut self, epoch_config: EpochConfig) -> Result<Actions, ConfigError> {
        epoch_config.validate(&self.network_config)?;
        if let Some(active) = &self.active_epoch {
            if epoch_config.number <= active.number() {
                return Err(ConfigError::StaleEpoch {
                    active: active.number(),
                    proposed: epoch_config.number,
                });
            }
        }

        Event::publish(
            &self.event_publisher,
            Event::ActivateEpoch(ActivateEpochEvent {
                timestamp: SystemTime::now(),
                epoch: epoch_config.number,
                leaders: epoch_config.leaders.clone(),
                starting_checkpoint: epoch_config.starting_checkpoint.clone(),
            }),
        );

        let mut actions = Actions::default();
        let starting_checkpoint = epoch_config.starting_checkpoint.clone();
        self.client_windows.reset_unassigned();
        self.active_epoch = Some(Epoch::new(epoch_config, &self.network_config));
        if self.checkpoints.adopt(starting_checkpoint) {
            self.publish_stable_checkpoint();
        }

        self.drain_inboxes(&mut actions);
        self.with_epoch(&mut actions, |epoch, ctx| {
            epoch.batch_all_ready_requests(ctx);
            epoch.materialize_waiting(ctx);
        });
        Ok(actions)
    }

    /// Admit a request submitted to the local replica.
    pub fn propose(&mut self, request_data: RequestData) -> Actions {
        let mut actions = Actions::default();
        self.admit(self.id, request_data, &mut actions);
        actions
    }

    /// Apply a message received from `source`.
    pub fn step(&mut self, source: NodeID, msg: Msg) -> Actions {
        let mut actions = Actions::default();
        let context = self.inbox_context();
        let receipt = match self.node_inboxes.get_mut(&source) {
            Some(inbox) => inbox.receive(msg, &context),
            None => Receipt::Dropped(msg, DropReason::UnknownSource),
        };
        self.handle_receipt(source, receipt, &mut actions);
        actions
    }

    /// Apply the results of work requested by earlier actions.
    ///
    /// # Errors
    /// If any result does not correspond to requested work. The state machine must not be used
    /// after that.
    pub fn apply_results(&mut self, results: ActionResults) -> Result<Actions, StateMachineError> {
        let mut actions = Actions::default();

        for result in results.preprocessed {
            let client_id = result.request_data.client_id.clone();
            let ready = self
                .client_windows
                .window_mut(&client_id)
                .on_preprocessed(result)?;
            if ready {
                self.with_epoch(&mut actions, |epoch, ctx| {
                    epoch.batch_ready_requests(&client_id, ctx);
                    epoch.materialize_waiting(ctx);
                });
            }
        }

        for result in results.processed {
            match self.active_epoch.as_ref().map(Epoch::number) {
                Some(active) if result.epoch == active => {
                    if let Some(outcome) =
                        self.with_epoch(&mut actions, |epoch, ctx| epoch.on_processed(result, ctx))
                    {
                        outcome?;
                    }
                }
                // The batch belonged to an epoch that has ended.
                Some(active) if result.epoch < active => (),
                _ => {
                    return Err(StateMachineError::UnknownBatch {
                        epoch: result.epoch,
                        seq_no: result.seq_no,
                    })
                }
            }
        }

        for result in results.checkpoints {
            if let Some(checkpoint_msg) = self.checkpoints.on_result(result)? {
                actions.broadcast.push(checkpoint_msg.into());
            }
        }

        Ok(actions)
    }

    /// Let time pass: cut the pending batches that waited long enough.
    pub fn tick(&mut self) -> Actions {
        let mut actions = Actions::default();
        self.with_epoch(&mut actions, |epoch, ctx| epoch.tick(ctx));
        actions
    }

    /// Get a snapshot of the state machine's state.
    pub fn status(&self) -> Status {
        let context = self.inbox_context();
        Status {
            id: self.id,
            epoch: self.active_epoch.as_ref().map(Epoch::number),
            led_buckets: self
                .active_epoch
                .as_ref()
                .map(|epoch| epoch.led_buckets(self.id))
                .unwrap_or_default(),
            stable_checkpoint: self.checkpoints.stable_checkpoint().clone(),
            low_watermark: context.low_watermark,
            high_watermark: context.high_watermark,
            last_delivered: self
                .active_epoch
                .as_ref()
                .map(Epoch::last_delivered)
                .unwrap_or(self.checkpoints.low_watermark()),
            slots: self
                .active_epoch
                .as_ref()
                .map(Epoch::slot_statuses)
                .unwrap_or_default(),
            pending_requests: self
                .active_epoch
                .as_ref()
                .map(Epoch::pending_requests)
                .unwrap_or(0),
            pending_checkpoints: self.checkpoints.pending(),
            inboxes: self
                .node_inboxes
                .values()
                .map(|inbox| InboxStatus {
                    node: inbox.node(),
                    buffered: inbox.buffered(),
                    buffer_size: inbox.buffer_size(),
                    violations: inbox.violation_count(),
                })
                .collect(),
            clients: self.client_windows.len(),
        }
    }

    fn admit(&mut self, source: NodeID, request_data: RequestData, actions: &mut Actions) {
        let admission = self
            .client_windows
            .window_mut(&request_data.client_id)
            .admit(source, &request_data);

        Event::publish(
            &self.event_publisher,
            Event::AdmitRequest(AdmitRequestEvent {
                timestamp: SystemTime::now(),
                origin: source,
                client_id: request_data.client_id.clone(),
                req_no: request_data.req_no,
                admission,
            }),
        );

        if admission.is_accepted() {
            actions.preprocess.push(Request {
                source,
                client_request: request_data,
            });
        }
    }

    fn handle_receipt(&mut self, source: NodeID, receipt: Receipt, actions: &mut Actions) {
        match receipt {
            Receipt::Deliver(msg) => self.apply_msg(source, msg, actions),
            Receipt::Buffered => (),
            Receipt::Dropped(msg, reason) => {
                // Inboxes record the violations they detect themselves.
                if let DropReason::Violation(violation) = &reason {
                    self.publish_violation(source, violation.clone());
                }
                Event::publish(
                    &self.event_publisher,
                    Event::DropMessage(DropMessageEvent {
                        timestamp: SystemTime::now(),
                        origin: source,
                        kind: msg.kind(),
                        reason,
                    }),
                );
            }
        }
    }

    fn apply_msg(&mut self, source: NodeID, msg: Msg, actions: &mut Actions) {
        match msg {
            Msg::Forward(forward) => self.admit(source, forward.request_data, actions),
            Msg::Checkpoint(checkpoint_msg) => {
                self.apply_checkpoint(source, checkpoint_msg, actions)
            }
            Msg::Preprepare(preprepare) => {
                self.with_epoch(actions, |epoch, ctx| {
                    epoch.on_preprepare(source, preprepare, ctx)
                });
            }
            Msg::Prepare(prepare) => {
                self.with_epoch(actions, |epoch, ctx| epoch.on_prepare(source, prepare, ctx));
            }
            Msg::Commit(commit) => {
                self.with_epoch(actions, |epoch, ctx| epoch.on_commit(source, commit, ctx));
            }
        }
    }

    fn apply_checkpoint(
        &mut self,
        source: NodeID,
        checkpoint_msg: CheckpointMsg,
        actions: &mut Actions,
    ) {
        let CheckpointMsg { seq_no, value } = checkpoint_msg;
        match self.checkpoints.apply(source, seq_no, value.clone()) {
            CheckpointOutcome::Stable => self.on_stable_checkpoint(actions),
            CheckpointOutcome::Divergent => self.record_violation(
                source,
                ProtocolViolation::DivergentCheckpoint { seq_no, value },
            ),
            CheckpointOutcome::Invalid => {
                self.record_violation(source, ProtocolViolation::InvalidCheckpoint { seq_no })
            }
            CheckpointOutcome::Pending | CheckpointOutcome::Stale => (),
        }
    }

    /// Forget what the new stable checkpoint covers, and resume the work that waited for the
    /// watermarks to move.
    fn on_stable_checkpoint(&mut self, actions: &mut Actions) {
        self.publish_stable_checkpoint();
        let stable_seq_no = self.checkpoints.low_watermark();
        if let Some(epoch) = self.active_epoch.as_mut() {
            epoch.garbage_collect(stable_seq_no);
        }
        self.drain_inboxes(actions);
        self.with_epoch(actions, |epoch, ctx| epoch.retry_cuts(ctx));
    }

    fn drain_inboxes(&mut self, actions: &mut Actions) {
        let nodes: Vec<NodeID> = self.node_inboxes.keys().copied().collect();
        for node in nodes {
            let context = self.inbox_context();
            let receipts = match self.node_inboxes.get_mut(&node) {
                Some(inbox) => inbox.drain(&context),
                None => continue,
            };
            for receipt in receipts {
                self.handle_receipt(node, receipt, actions);
            }
        }
    }

    fn inbox_context(&self) -> InboxContext {
        match &self.active_epoch {
            Some(epoch) => InboxContext {
                active_epoch: Some(epoch.number()),
                low_watermark: self
                    .checkpoints
                    .low_watermark()
                    .min(epoch.last_delivered()),
                high_watermark: self.checkpoints.high_watermark(epoch.limit()),
                epoch_limit: epoch.limit(),
            },
            None => InboxContext::inactive(),
        }
    }

    /// Apply `f` to the active epoch, if any, then record the protocol violations it detected.
    fn with_epoch<R>(
        &mut self,
        actions: &mut Actions,
        f: impl FnOnce(&mut Epoch, &mut EpochContext) -> R,
    ) -> Option<R> {
        let epoch = self.active_epoch.as_mut()?;
        let mut ctx = EpochContext {
            me: self.id,
            network_config: &self.network_config,
            batch_parameters: &self.batch_parameters,
            client_windows: &mut self.client_windows,
            checkpoints: &mut self.checkpoints,
            event_publisher: &self.event_publisher,
            actions,
            violations: Vec::new(),
        };
        let result = f(epoch, &mut ctx);

        let violations = ctx.violations;
        for (node, violation) in violations {
            self.record_violation(node, violation);
        }
        Some(result)
    }

    fn record_violation(&mut self, node: NodeID, violation: ProtocolViolation) {
        if let Some(inbox) = self.node_inboxes.get_mut(&node) {
            inbox.record_violation(violation.clone());
        }
        self.publish_violation(node, violation);
    }

    fn publish_violation(&self, node: NodeID, violation: ProtocolViolation) {
        Event::publish(
            &self.event_publisher,
            Event::ProtocolViolation(ProtocolViolationEvent {
                timestamp: SystemTime::now(),
                origin: node,
                violation,
            }),
        );
    }

    fn publish_stable_checkpoint(&self) {
        Event::publish(
            &self.event_publisher,
            Event::StableCheckpoint(StableCheckpointEvent {
                timestamp: SystemTime::now(),
                checkpoint: self.checkpoints.stable_checkpoint().clone(),
            }),
        );
    }
}

/// Misbehavior of a replica, detected in the messages it sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A slot-scoped message for an epoch more than one ahead of the active epoch.
    FarFutureEpoch { epoch: EpochNumber },
    /// A slot-scoped message for a sequence number outside of the active epoch.
    SeqNoOutOfRange { epoch: EpochNumber, seq_no: SeqNo },
    /// A preprepare from a replica that does not lead the slot's bucket.
    NotLeader { epoch: EpochNumber, seq_no: SeqNo },
    /// A prepare from the leader of the slot. The leader's preprepare stands for its prepare.
    LeaderPrepare { epoch: EpochNumber, seq_no: SeqNo },
    /// Two different preprepares for one slot, or proof that the leader sent them.
    Equivocation { epoch: EpochNumber, seq_no: SeqNo },
    /// A preprepare whose batch can never be valid.
    InvalidBatch {
        epoch: EpochNumber,
        seq_no: SeqNo,
        reason: InvalidBatch,
    },
    /// A vote for a different digest than the local one, or than the replica's earlier vote.
    ConflictingVote {
        epoch: EpochNumber,
        seq_no: SeqNo,
        digest: Digest,
    },
    /// A checkpoint attestation that contradicts the stable checkpoint, or an earlier attestation.
    DivergentCheckpoint { seq_no: SeqNo, value: Digest },
    /// A checkpoint attestation for a sequence number at which no checkpoint is taken.
    InvalidCheckpoint { seq_no: SeqNo },
}

impl ProtocolViolation {
    /// PascalCase name of the violation variant, for counting and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolViolation::FarFutureEpoch { .. } => "FarFutureEpoch",
            ProtocolViolation::SeqNoOutOfRange { .. } => "SeqNoOutOfRange",
            ProtocolViolation::NotLeader { .. } => "NotLeader",
            ProtocolViolation::LeaderPrepare { .. } => "LeaderPrepare",
            ProtocolViolation::Equivocation { .. } => "Equivocation",
            ProtocolViolation::InvalidBatch { .. } => "InvalidBatch",
            ProtocolViolation::ConflictingVote { .. } => "ConflictingVote",
            ProtocolViolation::DivergentCheckpoint { .. } => "DivergentCheckpoint",
            ProtocolViolation::InvalidCheckpoint { .. } => "InvalidCheckpoint",
        }
    }
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::FarFutureEpoch { epoch } => {
                write!(f, "message for far future epoch {}", epoch)
            }
            ProtocolViolation::SeqNoOutOfRange { epoch, seq_no } => {
                write!(f, "seq_no {} is outside of epoch {}", seq_no, epoch)
            }
            ProtocolViolation::NotLeader { epoch, seq_no } => {
                write!(f, "preprepare for {}/{} from a non-leader", epoch, seq_no)
            }
            ProtocolViolation::LeaderPrepare { epoch, seq_no } => {
                write!(f, "prepare for {}/{} from its leader", epoch, seq_no)
            }
            ProtocolViolation::Equivocation { epoch, seq_no } => {
                write!(f, "equivocation in {}/{}", epoch, seq_no)
            }
            ProtocolViolation::InvalidBatch {
                epoch,
                seq_no,
                reason,
            } => write!(f, "invalid batch for {}/{}: {:?}", epoch, seq_no, reason),
            ProtocolViolation::ConflictingVote {
                epoch,
                seq_no,
                digest,
            } => write!(f, "conflicting vote for {}/{}: {:?}", epoch, seq_no, digest),
            ProtocolViolation::DivergentCheckpoint { seq_no, value } => {
                write!(f, "divergent checkpoint at {}: {:?}", seq_no, value)
            }
            ProtocolViolation::InvalidCheckpoint { seq_no } => {
                write!(f, "checkpoint at non-checkpoint seq_no {}", seq_no)
            }
        }
    }
}

/// Local consistency failures: results that do not match the work the state machine requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateMachineError {
    /// A preprocess result for a request that was never admitted.
    UnknownRequest { client_id: ClientID, req_no: ReqNo },
    /// A process result for a slot whose batch was never handed out.
    UnknownBatch { epoch: EpochNumber, seq_no: SeqNo },
    /// A checkpoint result for a sequence number whose digest was never requested.
    UnknownCheckpoint { seq_no: SeqNo },
    /// A second process result for a slot, with a different digest.
    MismatchedBatchResult {
        epoch: EpochNumber,
        seq_no: SeqNo,
        expected: Digest,
        actual: Digest,
    },
}

impl Display for StateMachineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateMachineError::UnknownRequest { client_id, req_no } => write!(
                f,
                "preprocess result for unknown request {}/{}",
                client_id, req_no
            ),
            StateMachineError::UnknownBatch { epoch, seq_no } => {
                write!(f, "process result for unknown batch {}/{}", epoch, seq_no)
            }
            StateMachineError::UnknownCheckpoint { seq_no } => {
                write!(f, "checkpoint result for unrequested seq_no {}", seq_no)
            }
            StateMachineError::MismatchedBatchResult {
                epoch,
                seq_no,
                expected,
                actual,
            } => write!(
                f,
                "process result for {}/{} is {:?}, but was {:?} before",
                epoch, seq_no, actual, expected
            ),
        }
    }
}

impl std::error::Error for StateMachineError {}

/// A snapshot of a [`StateMachine`], for monitoring and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub id: NodeID,
    pub epoch: Option<EpochNumber>,
    /// The buckets the local replica leads in the active epoch.
    pub led_buckets: Vec<BucketID>,
    pub stable_checkpoint: Checkpoint,
    pub low_watermark: SeqNo,
    pub high_watermark: SeqNo,
    pub last_delivered: SeqNo,
    /// The slots of the active epoch that have not been garbage collected, by sequence number.
    pub slots: Vec<SlotStatus>,
    pub pending_requests: usize,
    pub pending_checkpoints: usize,
    pub inboxes: Vec<InboxStatus>,
    pub clients: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotStatus {
    pub seq_no: SeqNo,
    pub bucket: BucketID,
    pub leader: NodeID,
    pub phase: Phase,
    /// Number of replicas whose prepare was counted.
    pub prepares: usize,
    /// Number of replicas whose commit was counted.
    pub commits: usize,
    pub conflicted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxStatus {
    pub node: NodeID,
    pub buffered: usize,
    pub buffer_size: BufferSize,
    /// Number of protocol violations recorded against the node.
    pub violations: u64,
}
