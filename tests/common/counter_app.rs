use bucket_bft::{
    actions::Commit,
    processor::App,
    types::{
        data_types::{Digest, SeqNo},
        requests::RequestData,
    },
};
use sha2::{Digest as _, Sha256};

/// An application that records every request delivered to it, and whose state digest is a hash
/// chain over them.
pub(crate) struct CounterApp {
    pub(crate) delivered: Vec<(SeqNo, RequestData)>,
    pub(crate) batches: u64,
    state: Vec<u8>,
}

impl CounterApp {
    pub(crate) fn new() -> CounterApp {
        CounterApp {
            delivered: Vec::new(),
            batches: 0,
            state: Vec::new(),
        }
    }
}

impl App for CounterApp {
    fn deliver(&mut self, commit: &Commit, requests: &[RequestData]) {
        let mut hasher = Sha256::new();
        hasher.update(&self.state);
        hasher.update(commit.q_entry.digest.bytes());
        self.state = hasher.finalize().to_vec();

        self.batches += 1;
        for request in requests {
            self.delivered.push((commit.q_entry.seq_no, request.clone()));
        }
    }

    fn snapshot(&mut self, _: SeqNo) -> Digest {
        Digest::new(self.state.clone())
    }
}
