/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The deterministic ordering core of a bucketed, pipelined, three-phase Byzantine fault tolerant
//! state machine replication protocol.
//!
//! A cluster of `N >= 3F + 1` replicas agrees on a single total order of client requests, tolerating
//! up to `F` Byzantine replicas. The sequence number space of each epoch is partitioned into buckets,
//! each driven by its own leader, so several leaders propose concurrently. Every slot goes through
//! preprepare, prepare, and commit, and committed slots are delivered strictly in sequence order.
//! Periodic checkpoints bound how far ahead of the last agreed state replicas may run.
//!
//! The core is a pure [state machine](state_machine::StateMachine) driven by the
//! [serializer](serializer) thread: it does no I/O and reads no clock. Everything it needs done is
//! described by the [`Actions`](actions::Actions) it emits, and the values it needs back are returned
//! to it as [`ActionResults`](actions::ActionResults).
//!
//! Start a replica with [`ReplicaSpec`](replica::ReplicaSpec). Execute its actions yourself, or with
//! the reference [`Processor`](processor::Processor).

pub mod actions;

pub mod checkpoint;

pub mod client_window;

pub mod epoch;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod messages;

pub mod node_inbox;

pub mod processor;

pub mod replica;

pub mod serializer;

pub mod state_machine;

pub mod types;
