/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! bucket_bft orders client requests across a set of replicas. Each replica is uniquely identified by
//! a [`NodeID`], which the transport layer is trusted to authenticate. This crate implements only the
//! ordering core: executing the [`Actions`] it emits (sending messages, persisting log entries,
//! digesting requests and batches, and delivering commits) is up to the library user, for example
//! with the reference [processor](crate::processor).
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive, and the [handles](ReplicaHandle) used to feed
//!   it inputs from other threads.
//!
//! ## Starting a replica
//!
//! Here is an example that demonstrates how to build and start running a replica using the builder pattern:
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .configuration(configuration)
//!     .network_config(network_config)
//!     .epoch_config(epoch_config)
//!     .on_commit_slot(commit_slot_handler)
//!     .build()
//!     .start()?;
//!
//! replica.propose(request_data)?;
//! let actions = replica.actions().recv()?;
//! ```
//!
//! ### Required setters
//!
//! - `.configuration(...)`
//! - `.network_config(...)`
//!
//! ### Optional setters
//!
//! `.epoch_config(...)` activates an epoch as soon as the replica starts. Without it, the replica
//! buffers slot messages until [`Replica::activate_epoch`] is called.
//!
//! The other optional setters are for registering user-defined event handlers for events from
//! [crate::events]:
//! - `.on_activate_epoch(...)`
//! - `.on_stable_checkpoint(...)`
//! - `.on_admit_request(...)`
//! - `.on_cut_batch(...)`
//! - `.on_preprepare(...)`
//! - `.on_receive_preprepare(...)`
//! - `.on_prepared(...)`
//! - `.on_commit_slot(...)`
//! - `.on_request_checkpoint(...)`
//! - `.on_protocol_violation(...)`
//! - `.on_drop_message(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .id(NodeID::new(0))
//!     .batch_parameters(BatchParameters { cut_size_bytes: 1, cut_ticks: 2 })
//!     .tick_interval(Duration::from_millis(500))
//!     .node_inbox_capacity(BufferSize::new(1024 * 1024))
//!     .client_window_width(100)
//!     .log_events(true)
//!     .build()
//! ```

use std::fmt::{self, Display, Formatter};
use std::panic;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::actions::{ActionResults, Actions};
use crate::event_bus::*;
use crate::events::*;
use crate::messages::Msg;
use crate::serializer::{Input, Serializer};
use crate::state_machine::{StateMachine, StateMachineError, Status};
use crate::types::data_types::{BufferSize, NodeID};
use crate::types::network_config::{ConfigError, EpochConfig, NetworkConfig};
use crate::types::requests::RequestData;

/// When a leader cuts the pending batch of a bucket it leads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchParameters {
    /// Cut as soon as the requests of the pending batch add up to this many bytes (borsh-encoded).
    pub cut_size_bytes: u64,
    /// Cut a non-empty pending batch that has been waiting for this many ticks.
    pub cut_ticks: u64,
}

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's [`NodeID`].
/// 2. The [batch parameters](BatchParameters), which decide when batches are cut.
/// 3. The tick interval, i.e., how often the replica lets time pass in its state machine.
/// 4. The node inbox capacity, which defines the maximum number of bytes of messages that may be
///    buffered for a single peer. Messages that would exceed it are dropped.
/// 5. The client window width, i.e., how many request numbers past a client's lowest uncommitted
///    one are accepted.
/// 6. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Tick interval
///
/// Durations stored in [Configuration::tick_interval] must be non-zero. Timeout cuts and gap filling
/// happen on ticks, so the tick interval (times `cut_ticks`) bounds how long a request may wait
/// in a pending batch.
///
/// ## Log Events
///
/// bucket_bft logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.id(...)`
    - `.batch_parameters(...)`
    - `.tick_interval(...)`
    - `.node_inbox_capacity(...)`
    - `.client_window_width(...)`
    - `.log_events(...)`
"
))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's ID, as known to its peers. Required."))]
    pub id: NodeID,
    #[builder(setter(doc = "Set the parameters that decide when batches are cut. Required."))]
    pub batch_parameters: BatchParameters,
    #[builder(setter(doc = "Set how often the replica's state machine is ticked. Required."))]
    pub tick_interval: Duration,
    #[builder(setter(doc = "Set the maximum number of bytes of messages buffered for each peer. Required."))]
    pub node_inbox_capacity: BufferSize,
    #[builder(setter(doc = "Set the number of request numbers each client may have in flight. Required."))]
    pub client_window_width: u64,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc =
    "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.configuration(...)`
    - `.network_config(...)`

    Optional:
    - `.epoch_config(...)`
    - `.on_activate_epoch(...)`
    - `.on_stable_checkpoint(...)`
    - `.on_admit_request(...)`
    - `.on_cut_batch(...)`
    - `.on_preprepare(...)`
    - `.on_receive_preprepare(...)`
    - `.on_prepared(...)`
    - `.on_commit_slot(...)`
    - `.on_request_checkpoint(...)`
    - `.on_protocol_violation(...)`
    - `.on_drop_message(...)`
"
))]
pub struct ReplicaSpec {
    // Required parameters
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the [network configuration](NetworkConfig) shared by every replica. Required."))]
    network_config: NetworkConfig,
    // Optional parameters
    #[builder(default, setter(strip_option,
    doc = "Set the epoch to activate when the replica starts. Optional."))]
    epoch_config: Option<EpochConfig>,
    #[builder(default, setter(transform = |handler: impl Fn(&ActivateEpochEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ActivateEpochEvent>),
    doc = "Register a handler closure to be invoked after the replica activates an epoch. Optional."))]
    on_activate_epoch: Option<HandlerPtr<ActivateEpochEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint becomes stable. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AdmitRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AdmitRequestEvent>),
    doc = "Register a handler closure to be invoked after a request is offered to a client window. Optional."))]
    on_admit_request: Option<HandlerPtr<AdmitRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CutBatchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CutBatchEvent>),
    doc = "Register a handler closure to be invoked after the replica cuts a batch. Optional."))]
    on_cut_batch: Option<HandlerPtr<CutBatchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreprepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreprepareEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a preprepare. Optional."))]
    on_preprepare: Option<HandlerPtr<PreprepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePreprepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePreprepareEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts a preprepare. Optional."))]
    on_receive_preprepare: Option<HandlerPtr<ReceivePreprepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PreparedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PreparedEvent>),
    doc = "Register a handler closure to be invoked after a slot is prepared. Optional."))]
    on_prepared: Option<HandlerPtr<PreparedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitSlotEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitSlotEvent>),
    doc = "Register a handler closure to be invoked after a slot is committed. Optional."))]
    on_commit_slot: Option<HandlerPtr<CommitSlotEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestCheckpointEvent>),
    doc = "Register a handler closure to be invoked after the replica requests a checkpoint digest. Optional."))]
    on_request_checkpoint: Option<HandlerPtr<RequestCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProtocolViolationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProtocolViolationEvent>),
    doc = "Register a handler closure to be invoked after a peer is caught violating the protocol. Optional."))]
    on_protocol_violation: Option<HandlerPtr<ProtocolViolationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DropMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DropMessageEvent>),
    doc = "Register a handler closure to be invoked after a received message is dropped. Optional."))]
    on_drop_message: Option<HandlerPtr<DropMessageEvent>>,
}

impl ReplicaSpec {
    /// Starts all threads and channels associated with running a replica, and returns the handles
    /// to them in a [Replica] struct.
    ///
    /// # Errors
    /// If the network configuration or the epoch configuration is invalid, or if the replica's ID is
    /// not in the network configuration.
    pub fn start(self) -> Result<Replica, ConfigError> {
        let tick_interval = self.configuration.tick_interval;
        if tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        let mut state_machine = StateMachine::new(&self.configuration, self.network_config)?;

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_activate_epoch,
            self.on_stable_checkpoint,
            self.on_admit_request,
            self.on_cut_batch,
            self.on_preprepare,
            self.on_receive_preprepare,
            self.on_prepared,
            self.on_commit_slot,
            self.on_request_checkpoint,
            self.on_protocol_violation,
            self.on_drop_message,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        state_machine.set_event_publisher(event_publisher);

        let (actions_sender, actions) = mpsc::channel();
        if let Some(epoch_config) = self.epoch_config {
            let initial_actions = state_machine.activate_epoch(epoch_config)?;
            if !initial_actions.is_empty() {
                // Cannot fail: `actions` is alive.
                let _ = actions_sender.send(initial_actions);
            }
        }

        let event_bus = event_subscriber
            .map(|event_subscriber| start_event_bus(event_handlers, event_subscriber));

        let (inputs, inputs_receiver) = mpsc::channel();
        let (serializer_shutdown, serializer_shutdown_receiver) = mpsc::channel();
        let serializer = Serializer::new(
            state_machine,
            inputs_receiver,
            actions_sender,
            tick_interval,
            serializer_shutdown_receiver,
        )
        .start();

        Ok(Replica {
            handle: ReplicaHandle { inputs },
            actions,
            serializer: Some(serializer),
            serializer_shutdown,
            event_bus,
        })
    }
}

/// A handle to the background threads of a bucket_bft replica. When this value is dropped, all
/// background threads are gracefully shut down.
pub struct Replica {
    handle: ReplicaHandle,
    actions: Receiver<Actions>,
    serializer: Option<JoinHandle<Result<(), StateMachineError>>>,
    serializer_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
}

impl Replica {
    /// Get a handle through which other threads can feed the replica inputs.
    pub fn handle(&self) -> ReplicaHandle {
        self.handle.clone()
    }

    /// The channel on which the replica sends the [`Actions`] its inputs result in.
    pub fn actions(&self) -> &Receiver<Actions> {
        &self.actions
    }

    /// See [`ReplicaHandle::propose`].
    pub fn propose(&self, request_data: RequestData) -> Result<(), ReplicaError> {
        self.handle.propose(request_data)
    }

    /// See [`ReplicaHandle::step`].
    pub fn step(&self, source: NodeID, msg: Msg) -> Result<(), ReplicaError> {
        self.handle.step(source, msg)
    }

    /// See [`ReplicaHandle::apply_results`].
    pub fn apply_results(&self, results: ActionResults) -> Result<(), ReplicaError> {
        self.handle.apply_results(results)
    }

    /// See [`ReplicaHandle::activate_epoch`].
    pub fn activate_epoch(&self, epoch_config: EpochConfig) -> Result<(), ReplicaError> {
        self.handle.activate_epoch(epoch_config)
    }

    /// See [`ReplicaHandle::status`].
    pub fn status(&self) -> Result<Status, ReplicaError> {
        self.handle.status()
    }

    /// Stop the serializer and the event bus.
    ///
    /// # Errors
    /// If the serializer had already stopped because an input failed, returns that failure.
    pub fn shutdown(mut self) -> Result<(), StateMachineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), StateMachineError> {
        // The serializer may have stopped on its own.
        let _ = self.serializer_shutdown.send(());
        let outcome = match self.serializer.take() {
            Some(serializer) => match serializer.join() {
                Ok(outcome) => outcome,
                Err(panic) => panic::resume_unwind(panic),
            },
            None => Ok(()),
        };

        // The event bus exits once the serializer, which owns the event publisher, is gone.
        if let Some(event_bus) = self.event_bus.take() {
            if let Err(panic) = event_bus.join() {
                panic::resume_unwind(panic)
            }
        }

        outcome
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if !thread::panicking() {
            let _ = self.stop();
        }
    }
}

/// A cloneable handle for feeding a [`Replica`] inputs from any thread.
///
/// Inputs sent through one handle are applied in the order they were sent.
#[derive(Clone)]
pub struct ReplicaHandle {
    inputs: Sender<Input>,
}

impl ReplicaHandle {
    /// Submit a client request to the local replica.
    pub fn propose(&self, request_data: RequestData) -> Result<(), ReplicaError> {
        self.send(Input::Propose(request_data))
    }

    /// Hand the replica a message received from `source`. `source` must have been authenticated by
    /// the transport layer.
    pub fn step(&self, source: NodeID, msg: Msg) -> Result<(), ReplicaError> {
        self.send(Input::Step(source, msg))
    }

    /// Hand the replica the results of executing earlier [`Actions`].
    pub fn apply_results(&self, results: ActionResults) -> Result<(), ReplicaError> {
        self.send(Input::Results(results))
    }

    /// Start sequencing in a new epoch. Blocks until the serializer has applied the epoch.
    pub fn activate_epoch(&self, epoch_config: EpochConfig) -> Result<(), ReplicaError> {
        let (reply, outcome) = mpsc::channel();
        self.send(Input::ActivateEpoch(epoch_config, reply))?;
        outcome
            .recv()
            .map_err(|_| ReplicaError::Stopped)?
            .map_err(ReplicaError::Config)
    }

    /// Get a snapshot of the replica's state machine. Blocks until the serializer replies.
    pub fn status(&self) -> Result<Status, ReplicaError> {
        let (reply, status) = mpsc::channel();
        self.send(Input::Status(reply))?;
        status.recv().map_err(|_| ReplicaError::Stopped)
    }

    fn send(&self, input: Input) -> Result<(), ReplicaError> {
        self.inputs.send(input).map_err(|_| ReplicaError::Stopped)
    }
}

/// Errors returned by [`Replica`] and [`ReplicaHandle`] methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaError {
    /// The serializer has stopped, and accepts no more inputs.
    Stopped,
    /// The epoch configuration was refused.
    Config(ConfigError),
}

impl Display for ReplicaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaError::Stopped => write!(f, "the replica has stopped"),
            ReplicaError::Config(err) => write!(f, "invalid configuration: {}", err),
        }
    }
}

impl std::error::Error for ReplicaError {}

impl From<ConfigError> for ReplicaError {
    fn from(err: ConfigError) -> Self {
        ReplicaError::Config(err)
    }
}
