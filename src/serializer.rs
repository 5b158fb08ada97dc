/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that owns the [`StateMachine`] and feeds it its inputs one at a time.
//!
//! Inputs come from any number of [replica handles](crate::replica::ReplicaHandle) through one
//! channel, so inputs sent by one handle are applied in the order they were sent, and inputs sent by
//! different handles are interleaved in the order they arrived. Ticks are generated by the
//! serializer itself, every `tick_interval`.
//!
//! After applying an input, the serializer sends the resulting [`Actions`] on its output channel.
//! `Actions` that carry no work are not sent.
//!
//! The serializer stops when it is told to shut down, when every handle is gone, or when an input
//! fails with a [`StateMachineError`]. The error is then logged and returned from the thread.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{
    actions::{ActionResults, Actions},
    messages::Msg,
    state_machine::{StateMachine, StateMachineError, Status},
    types::{
        data_types::NodeID,
        network_config::{ConfigError, EpochConfig},
        requests::RequestData,
    },
};

/// The longest the serializer waits for an input before checking whether it was told to shut down.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An input to the serializer.
pub(crate) enum Input {
    Propose(RequestData),
    Step(NodeID, Msg),
    Results(ActionResults),
    ActivateEpoch(EpochConfig, Sender<Result<(), ConfigError>>),
    Status(Sender<Status>),
}

pub(crate) struct Serializer {
    state_machine: StateMachine,
    inputs: Receiver<Input>,
    actions: Sender<Actions>,
    tick_interval: Duration,
    shutdown_signal: Receiver<()>,
}

impl Serializer {
    pub(crate) fn new(
        state_machine: StateMachine,
        inputs: Receiver<Input>,
        actions: Sender<Actions>,
        tick_interval: Duration,
        shutdown_signal: Receiver<()>,
    ) -> Serializer {
        Serializer {
            state_machine,
            inputs,
            actions,
            tick_interval,
            shutdown_signal,
        }
    }

    pub(crate) fn start(self) -> JoinHandle<Result<(), StateMachineError>> {
        thread::spawn(move || self.execute())
    }

    fn execute(mut self) -> Result<(), StateMachineError> {
        let mut next_tick = Instant::now() + self.tick_interval;
        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
                Err(TryRecvError::Empty) => (),
            }

            let now = Instant::now();
            if now >= next_tick {
                let actions = self.state_machine.tick();
                self.emit(actions);
                next_tick = now + self.tick_interval;
                continue;
            }

            let timeout = (next_tick - now).min(SHUTDOWN_POLL_INTERVAL);
            match self.inputs.recv_timeout(timeout) {
                Ok(input) => {
                    if let Err(err) = self.apply(input) {
                        log::error!("Serializer stopped: {}", err);
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    fn apply(&mut self, input: Input) -> Result<(), StateMachineError> {
        match input {
            Input::Propose(request_data) => {
                let actions = self.state_machine.propose(request_data);
                self.emit(actions);
            }
            Input::Step(source, msg) => {
                let actions = self.state_machine.step(source, msg);
                self.emit(actions);
            }
            Input::Results(results) => {
                let actions = self.state_machine.apply_results(results)?;
                self.emit(actions);
            }
            Input::ActivateEpoch(epoch_config, reply) => {
                let outcome = self
                    .state_machine
                    .activate_epoch(epoch_config)
                    .map(|actions| self.emit(actions));
                // The caller may have stopped waiting for the outcome.
                let _ = reply.send(outcome);
            }
            Input::Status(reply) => {
                let _ = reply.send(self.state_machine.status());
            }
        }
        Ok(())
    }

    fn emit(&self, actions: Actions) {
        if !actions.is_empty() {
            // The receiving end lives in the replica, which stops the serializer before dropping it.
            let _ = self.actions.send(actions);
        }
    }
}
