use std::{
    collections::{BTreeMap, VecDeque},
    sync::mpsc::Receiver,
};

use bucket_bft::{
    actions::{ActionResults, Actions},
    messages::Msg,
    processor::Processor,
    state_machine::StateMachine,
    types::{
        data_types::NodeID,
        network_config::{EpochConfig, NetworkConfig},
        requests::RequestData,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::common::{
    counter_app::CounterApp,
    fixtures::configuration,
    mem_log::MemLog,
    network::{mock_network, NetworkStub},
};

/// A replica whose state machine is driven directly by the test, and whose actions are executed by
/// a [`Processor`].
pub(crate) struct Node {
    pub(crate) state_machine: StateMachine,
    pub(crate) processor: Processor<NetworkStub, MemLog, CounterApp>,
    inbox: Receiver<(NodeID, Msg)>,
    // Received messages, per source, in the order they were sent.
    queues: BTreeMap<NodeID, VecDeque<Msg>>,
    // Results of executed actions, one result per `ActionResults`, not yet applied.
    results: Vec<ActionResults>,
}

impl Node {
    fn execute(&mut self, actions: Actions) {
        let results = self.processor.process(actions);
        for preprocessed in results.preprocessed {
            self.results.push(ActionResults {
                preprocessed: vec![preprocessed],
                ..Default::default()
            });
        }
        for processed in results.processed {
            self.results.push(ActionResults {
                processed: vec![processed],
                ..Default::default()
            });
        }
        for checkpoint in results.checkpoints {
            self.results.push(ActionResults {
                checkpoints: vec![checkpoint],
                ..Default::default()
            });
        }
    }

    fn receive(&mut self) {
        while let Ok((source, msg)) = self.inbox.try_recv() {
            self.queues.entry(source).or_default().push_back(msg);
        }
    }

    fn has_work(&mut self) -> bool {
        self.receive();
        !self.results.is_empty() || self.queues.values().any(|queue| !queue.is_empty())
    }

    /// Apply one pending input, chosen at random among the heads of the per-source message queues and
    /// the pending results.
    fn apply_random_input(&mut self, rng: &mut StdRng) {
        self.receive();
        let sources: Vec<NodeID> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(source, _)| *source)
            .collect();
        let choices = sources.len() + self.results.len();
        if choices == 0 {
            return;
        }

        let pick = rng.gen_range(0, choices);
        let actions = if pick < sources.len() {
            let source = sources[pick];
            let msg = self.queues.get_mut(&source).unwrap().pop_front().unwrap();
            self.state_machine.step(source, msg)
        } else {
            let results = self.results.swap_remove(pick - sources.len());
            self.state_machine.apply_results(results).unwrap()
        };
        self.execute(actions);
    }
}

/// A set of [`Node`]s connected by a mock network. Inputs are applied in a random, but seeded, order.
pub(crate) struct Cluster {
    pub(crate) nodes: Vec<Node>,
    rng: StdRng,
}

impl Cluster {
    pub(crate) fn new(
        network_config: NetworkConfig,
        epoch_config: EpochConfig,
        seed: u64,
    ) -> Cluster {
        let mut nodes: Vec<Node> = mock_network(network_config.nodes.clone().into_iter())
            .into_iter()
            .zip(network_config.nodes.clone())
            .map(|((network, inbox), id)| Node {
                state_machine: StateMachine::new(&configuration(id.int()), network_config.clone())
                    .unwrap(),
                processor: Processor::new(network, MemLog::new(), CounterApp::new()),
                inbox,
                queues: BTreeMap::new(),
                results: Vec::new(),
            })
            .collect();

        for node in &mut nodes {
            let actions = node
                .state_machine
                .activate_epoch(epoch_config.clone())
                .unwrap();
            node.execute(actions);
        }

        Cluster {
            nodes,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Submit `request_data` to every replica, as a client would.
    pub(crate) fn propose(&mut self, request_data: RequestData) {
        for node in &mut self.nodes {
            let actions = node.state_machine.propose(request_data.clone());
            node.execute(actions);
        }
    }

    /// Apply inputs until no replica has any left, ticking every replica whenever the cluster goes
    /// quiet. Returns once ticking produces no more work.
    pub(crate) fn run(&mut self) {
        let mut steps = 0;
        loop {
            let busy: Vec<usize> = (0..self.nodes.len())
                .filter(|index| self.nodes[*index].has_work())
                .collect();

            if busy.is_empty() {
                for node in &mut self.nodes {
                    let actions = node.state_machine.tick();
                    node.execute(actions);
                }
                if !self.nodes.iter_mut().any(|node| node.has_work()) {
                    return;
                }
                continue;
            }

            let index = busy[self.rng.gen_range(0, busy.len())];
            self.nodes[index].apply_random_input(&mut self.rng);

            steps += 1;
            assert!(steps < 1_000_000, "cluster did not go quiet");
        }
    }
}
