//! Proposal collection per announced order
//!
//! Holds the set of orders this node is listening to as a customer and
//! the proposals received for each. The agent is plain data; the
//! controller's mutex provides synchronization.

use std::collections::{HashMap, HashSet};

use crate::crypto::Hash256;
use crate::protocol::StorageProposal;

#[derive(Debug, Default)]
pub struct ProposalsAgent {
    listening: HashSet<Hash256>,
    proposals: HashMap<Hash256, Vec<StorageProposal>>,
}

impl ProposalsAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting proposals for an order
    pub fn listen_proposals(&mut self, order_hash: Hash256) {
        self.listening.insert(order_hash);
    }

    /// Stop accepting proposals; already collected ones are kept
    pub fn stop_listen_proposals(&mut self, order_hash: &Hash256) {
        self.listening.remove(order_hash);
    }

    pub fn is_listening(&self, order_hash: &Hash256) -> bool {
        self.listening.contains(order_hash)
    }

    pub fn get_listen_proposals(&self) -> Vec<Hash256> {
        self.listening.iter().copied().collect()
    }

    /// Record a proposal. Ignored unless the order is being listened to;
    /// duplicates (by proposal hash) are dropped.
    pub fn add_proposal(&mut self, proposal: StorageProposal) {
        if !self.listening.contains(&proposal.order_hash) {
            return;
        }
        let entry = self.proposals.entry(proposal.order_hash).or_default();
        let hash = proposal.hash();
        if entry.iter().any(|p| p.hash() == hash) {
            return;
        }
        entry.push(proposal);
    }

    pub fn get_proposals(&self, order_hash: &Hash256) -> Vec<StorageProposal> {
        self.proposals.get(order_hash).cloned().unwrap_or_default()
    }

    /// Proposals in ascending rate order; ties broken by earliest time,
    /// then lexicographic proposal hash.
    pub fn get_sorted_proposals(&self, order_hash: &Hash256) -> Vec<StorageProposal> {
        let mut proposals = self.get_proposals(order_hash);
        proposals.sort_by(|a, b| {
            a.rate
                .cmp(&b.rate)
                .then(a.time.cmp(&b.time))
                .then(a.hash().cmp(&b.hash()))
        });
        proposals
    }

    pub fn get_proposal(
        &self,
        order_hash: &Hash256,
        proposal_hash: &Hash256,
    ) -> Option<StorageProposal> {
        self.proposals
            .get(order_hash)?
            .iter()
            .find(|p| p.hash() == *proposal_hash)
            .cloned()
    }

    /// Drop every proposal collected for an order
    pub fn erase_order_proposals(&mut self, order_hash: &Hash256) {
        self.proposals.remove(order_hash);
    }
}
