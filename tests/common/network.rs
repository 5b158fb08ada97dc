use std::sync::mpsc::{self, Receiver, Sender};

use bucket_bft::{messages::Msg, processor::Link, types::data_types::NodeID};

/// A mock network stub which passes messages to the inboxes of every replica using channels.
pub(crate) struct NetworkStub {
    me: NodeID,
    all_peers: Vec<Sender<(NodeID, Msg)>>,
}

impl Link for NetworkStub {
    fn broadcast(&mut self, msg: Msg) {
        for peer in &self.all_peers {
            let _ = peer.send((self.me, msg.clone()));
        }
    }
}

/// Create a network stub and an inbox for each of `peers`.
pub(crate) fn mock_network(
    peers: impl Iterator<Item = NodeID>,
) -> Vec<(NetworkStub, Receiver<(NodeID, Msg)>)> {
    let peer_and_inboxes: Vec<(NodeID, Sender<(NodeID, Msg)>, Receiver<(NodeID, Msg)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            (peer, sender, receiver)
        })
        .collect();
    let all_peers: Vec<Sender<(NodeID, Msg)>> = peer_and_inboxes
        .iter()
        .map(|(_, sender, _)| sender.clone())
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(me, _, inbox)| {
            (
                NetworkStub {
                    me,
                    all_peers: all_peers.clone(),
                },
                inbox,
            )
        })
        .collect()
}
