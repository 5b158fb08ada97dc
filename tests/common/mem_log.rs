use bucket_bft::{
    actions::{PEntry, QEntry},
    processor::Log,
};

/// A log that keeps its entries in memory.
#[derive(Default)]
pub(crate) struct MemLog {
    pub(crate) q_entries: Vec<QEntry>,
    pub(crate) p_entries: Vec<PEntry>,
}

impl MemLog {
    pub(crate) fn new() -> MemLog {
        Self::default()
    }
}

impl Log for MemLog {
    fn persist_q_entry(&mut self, q_entry: &QEntry) {
        self.q_entries.push(q_entry.clone())
    }

    fn persist_p_entry(&mut self, p_entry: &PEntry) {
        self.p_entries.push(p_entry.clone())
    }
}
