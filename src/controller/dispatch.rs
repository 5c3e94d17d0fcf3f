//! Inbound message dispatch
//!
//! One handler per storage command. Protocol violations (unknown orders,
//! malformed payloads, wrong sizes, Merkle mismatches) are logged and
//! silently discarded; the counterparty learns nothing and times out.

use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use super::{ProposalJob, StorageController};
use crate::crypto::Hash256;
use crate::heap::HeapError;
use crate::network::{try_connect_node, MessageSink, PeerHandle};
use crate::protocol::{
    unix_time, ReplicaStream, StorageHandshake, StorageMessage, StorageOrder, StorageProposal,
    STORAGE_PEER_LIMIT,
};
use crate::replica::{crypto_replica_size, merkle};

impl StorageController {
    /// Dispatch one incoming message. Returns true when the command
    /// belongs to the storage overlay, whether or not the payload was
    /// usable.
    pub async fn process_storage_message(
        &self,
        from: &PeerHandle,
        command: &str,
        payload: &[u8],
    ) -> bool {
        let message = match StorageMessage::decode(command, payload) {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(e) => {
                // the command matched; only the payload is bad
                debug!(command, from = %from.address, error = %e, "malformed payload discarded");
                return true;
            }
        };

        match message {
            StorageMessage::Announce(order) => self.on_announce(order).await,
            StorageMessage::Proposal(proposal) => self.on_proposal(proposal).await,
            StorageMessage::Handshake(handshake) => self.on_handshake(handshake).await,
            StorageMessage::ReadyToReceive(handshake) => self.on_ready(handshake),
            StorageMessage::Send(stream) => self.on_send(stream).await,
            StorageMessage::Reserved(order_hash) => self.on_reserved(order_hash),
            StorageMessage::Ping => self.on_ping(from).await,
            StorageMessage::Pong(address) => self.on_pong(address),
        }
        true
    }

    /// `dfsannounce`: remember the order, relay it, and bid on it when
    /// this node has room and the terms are acceptable.
    async fn on_announce(&self, order: StorageOrder) {
        let hash = order.hash();
        let (is_new, can_keep, self_address) = {
            let mut state = self.lock_state();
            let is_new = !state.announcements.contains_key(&hash);
            if is_new {
                state.announcements.insert(hash, order.clone());
            }
            let can_keep = state.heap.max_allocate_size() > order.file_size
                && state.temp_heap.max_allocate_size() > order.file_size
                && order.max_rate >= self.config.rate
                && order.max_gap >= self.config.max_gap;
            (is_new, can_keep, state.address)
        };
        if !is_new {
            return;
        }
        debug!(order = %hash, size = order.file_size, "order received");
        self.network
            .broadcast_inventory(vec![crate::protocol::Inventory::order(hash)])
            .await;

        if !can_keep {
            return;
        }
        let Some(address) = self_address else {
            debug!(order = %hash, "own address unknown, not bidding");
            return;
        };
        let proposal = StorageProposal {
            time: unix_time(),
            order_hash: hash,
            rate: self.config.rate,
            address,
        };
        match try_connect_node(
            self.network.as_ref(),
            order.address,
            self.config.connect_attempts,
        )
        .await
        {
            Ok(peer) => {
                if let Err(e) = self
                    .network
                    .push_message(&peer, StorageMessage::Proposal(proposal))
                    .await
                {
                    warn!(order = %hash, error = %e, "proposal send failed");
                }
            }
            Err(e) => warn!(order = %hash, error = %e, "customer unreachable"),
        }
    }

    /// `dfsproposal`: collect a keeper's bid for an order this node is
    /// listening to as customer.
    async fn on_proposal(&self, proposal: StorageProposal) {
        {
            let mut state = self.lock_state();
            let acceptable = match state.announcements.get(&proposal.order_hash) {
                Some(order) => {
                    state.proposals.is_listening(&proposal.order_hash)
                        && order.max_rate > proposal.rate
                }
                None => false,
            };
            if acceptable {
                debug!(order = %proposal.order_hash, rate = proposal.rate, keeper = %proposal.address, "proposal collected");
                state.proposals.add_proposal(proposal.clone());
            }
        }
        // capacity management: keepers reconnect for the handshake
        if self.network.connected_peers().len() > STORAGE_PEER_LIMIT {
            self.network.disconnect(proposal.address).await;
        }
    }

    /// `dfshandshake` (keeper side): the customer picked our proposal.
    /// Re-check capacity, start tracking the transfer, answer `dfsrr`.
    async fn on_handshake(&self, handshake: StorageHandshake) {
        let order = {
            let state = self.lock_state();
            match state.announcements.get(&handshake.order_hash) {
                Some(order)
                    if state.heap.max_allocate_size() > order.file_size
                        && state.temp_heap.max_allocate_size() > order.file_size =>
                {
                    Some(order.clone())
                }
                _ => None,
            }
        };
        let Some(order) = order else {
            debug!(order = %handshake.order_hash, "handshake for unknown or unfittable order");
            return;
        };

        self.handshakes.add(handshake.clone());
        let ready = StorageHandshake {
            time: unix_time(),
            order_hash: handshake.order_hash,
            proposal_hash: handshake.proposal_hash,
            port: self.config.dfs_port,
        };
        match try_connect_node(
            self.network.as_ref(),
            order.address,
            self.config.connect_attempts,
        )
        .await
        {
            Ok(peer) => {
                if let Err(e) = self
                    .network
                    .push_message(&peer, StorageMessage::ReadyToReceive(ready))
                    .await
                {
                    warn!(order = %handshake.order_hash, error = %e, "dfsrr send failed");
                }
            }
            Err(e) => warn!(order = %handshake.order_hash, error = %e, "customer unreachable"),
        }
    }

    /// `dfsrr` (customer side): the keeper is ready; stop the timer and
    /// hand the handshake to the worker.
    fn on_ready(&self, handshake: StorageHandshake) {
        if !self.handshakes.resolve(handshake.clone()) {
            debug!(order = %handshake.order_hash, "dfsrr without pending handshake");
        }
    }

    /// `dfssend` (keeper side): receive the replica, verify size and
    /// Merkle root, move it into the durable heap, confirm with
    /// `dfsresv`. Any failure unlinks the scratch file and stays silent.
    async fn on_send(&self, stream: ReplicaStream) {
        let order = {
            let state = self.lock_state();
            state.announcements.get(&stream.order_hash).cloned()
        };
        let Some(order) = order else {
            debug!(order = %stream.order_hash, "replica for unknown order");
            return;
        };
        if self.handshakes.find(&stream.order_hash).is_none() {
            debug!(order = %stream.order_hash, "unsolicited replica");
            return;
        }

        let expected = crypto_replica_size(order.file_size);
        if stream.payload.len() as u64 != expected {
            debug!(
                order = %stream.order_hash,
                got = stream.payload.len(),
                expected,
                "replica size mismatch"
            );
            return;
        }

        let allocated = self
            .lock_state()
            .temp_heap
            .allocate_file(Hash256::ZERO, expected);
        let scratch = match allocated {
            Ok(file) => file,
            Err(e) => {
                warn!(order = %stream.order_hash, error = %e, "no scratch space for replica");
                return;
            }
        };
        if let Err(e) = std::fs::write(&scratch.fullpath, &stream.payload) {
            warn!(order = %stream.order_hash, error = %e, "replica write failed");
            let _ = self.lock_state().temp_heap.free_file_at(&scratch.fullpath);
            return;
        }

        match self.verify_replica_root(&scratch.fullpath, expected) {
            Ok(root) if root == stream.merkle_root => {}
            Ok(root) => {
                debug!(order = %stream.order_hash, got = %root, want = %stream.merkle_root, "merkle root mismatch");
                let _ = self.lock_state().temp_heap.free_file_at(&scratch.fullpath);
                return;
            }
            Err(e) => {
                warn!(order = %stream.order_hash, error = %e, "merkle verification failed");
                let _ = self.lock_state().temp_heap.free_file_at(&scratch.fullpath);
                return;
            }
        }

        // verified: move into the durable heap and attach the keys
        let allocated = self.lock_state().heap.allocate_file(order.file_uri, expected);
        let durable = match allocated {
            Ok(file) => file,
            Err(e) => {
                warn!(order = %stream.order_hash, error = %e, "durable allocation failed");
                let _ = self.lock_state().temp_heap.free_file_at(&scratch.fullpath);
                return;
            }
        };
        if let Err(e) = std::fs::copy(&scratch.fullpath, &durable.fullpath) {
            warn!(order = %stream.order_hash, error = %e, "replica move failed");
            let mut state = self.lock_state();
            let _ = state.heap.free_file(&order.file_uri);
            let _ = state.temp_heap.free_file_at(&scratch.fullpath);
            return;
        }
        {
            let mut state = self.lock_state();
            let _ = state.temp_heap.free_file_at(&scratch.fullpath);
            if let Err(e) = state.heap.set_decryption_keys(&order.file_uri, stream.keys.clone()) {
                warn!(order = %stream.order_hash, error = %e, "storing decryption keys failed");
            }
        }
        self.handshakes.cancel_wait(&stream.order_hash);
        self.create_proof_transaction(&stream.order_hash, &stream.merkle_root);
        info!(order = %stream.order_hash, bytes = expected, "replica stored");

        match try_connect_node(
            self.network.as_ref(),
            order.address,
            self.config.connect_attempts,
        )
        .await
        {
            Ok(peer) => {
                if let Err(e) = self
                    .network
                    .push_message(&peer, StorageMessage::Reserved(stream.order_hash))
                    .await
                {
                    warn!(order = %stream.order_hash, error = %e, "dfsresv send failed");
                }
            }
            Err(e) => warn!(order = %stream.order_hash, error = %e, "customer unreachable"),
        }
    }

    /// Recompute the Merkle root of a received replica, using (and
    /// always releasing) a scratch tree file in the temp heap.
    fn verify_replica_root(
        &self,
        replica: &std::path::Path,
        replica_size: u64,
    ) -> Result<Hash256, HeapError> {
        let tree = self
            .lock_state()
            .temp_heap
            .allocate_file(Hash256::ZERO, merkle::tree_size(replica_size))?;
        let root = merkle::build_tree(replica, &tree.fullpath);
        let _ = self.lock_state().temp_heap.free_file_at(&tree.fullpath);
        Ok(root?)
    }

    /// `dfsresv` (customer side): the keeper confirmed storage. Stop the
    /// transfer wait, drain queued proposals for this order only, then
    /// advance the pipeline.
    fn on_reserved(&self, order_hash: Hash256) {
        self.handshakes.cancel_wait(&order_hash);
        {
            let mut state = self.lock_state();
            state.pending_proposals.retain(|p| p.order_hash != order_hash);
        }
        info!(order = %order_hash, "replica transfer confirmed");
        self.notify(ProposalJob::AcceptProposal);
    }

    /// `dfsping`: tell the sender how we see it
    async fn on_ping(&self, from: &PeerHandle) {
        if let Err(e) = self
            .network
            .push_message(from, StorageMessage::Pong(from.address))
            .await
        {
            debug!(peer = %from.address, error = %e, "pong failed");
        }
    }

    /// `dfspong`: adopt the observed address, with our own listen port
    fn on_pong(&self, observed: SocketAddr) {
        let address = SocketAddr::new(observed.ip(), self.network.listen_port());
        debug!(%address, "external address discovered");
        self.lock_state().address = Some(address);
    }
}

#[async_trait]
impl MessageSink for StorageController {
    async fn deliver(&self, from: &PeerHandle, command: &str, payload: &[u8]) {
        self.process_storage_message(from, command, payload).await;
    }
}
