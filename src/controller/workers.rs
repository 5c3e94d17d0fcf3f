//! Background workers
//!
//! Three long-running loops: external-address discovery, the proposal
//! pipeline, and the handshake pipeline. Every loop observes the
//! shutdown flag and exits cleanly when it flips.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ControllerError, ProposalJob, StorageController};
use crate::agents::HandshakeEvent;
use crate::crypto::{AesKey, Hash256, ReplicaKeyPair};
use crate::network::try_connect_node;
use crate::protocol::{
    unix_time, ReplicaStream, StorageHandshake, StorageMessage, StorageProposal,
    STORAGE_PEER_LIMIT,
};
use crate::replica::{self, crypto_replica_size, merkle};

/// Probe peers for our externally visible address: once per second,
/// whenever the address is unknown or the refresh interval elapsed.
pub(crate) async fn found_my_ip(
    controller: Arc<StorageController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_probe: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let have_address = controller.lock_state().address.is_some();
        let refresh_due =
            last_probe.map_or(true, |at| at.elapsed() >= controller.config.ip_refresh);
        if have_address && !refresh_due {
            continue;
        }
        for peer in controller.network.connected_peers() {
            if let Err(e) = controller
                .network
                .push_message(&peer, StorageMessage::Ping)
                .await
            {
                debug!(peer = %peer.address, error = %e, "ping failed");
            }
        }
        last_probe = Some(Instant::now());
    }
    debug!("ip discovery loop stopped");
}

/// Drive the proposal pipeline: react to collection windows closing and
/// to transfer outcomes, always keeping at most one handshake in flight.
pub(crate) async fn process_proposals(
    controller: Arc<StorageController>,
    mut jobs: mpsc::UnboundedReceiver<ProposalJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut get_next = false;
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match job {
            ProposalJob::CheckProposals => {
                let now = unix_time();
                let window = controller.config.order_timeout.as_secs();
                let listened = controller.lock_state().proposals.get_listen_proposals();
                for order_hash in listened {
                    let mut state = controller.lock_state();
                    let Some(order) = state.announcements.get(&order_hash) else {
                        state.proposals.stop_listen_proposals(&order_hash);
                        continue;
                    };
                    // only orders whose collection window elapsed
                    if now < order.time + window {
                        continue;
                    }
                    if state
                        .pending_proposals
                        .iter()
                        .any(|p| p.order_hash == order_hash)
                    {
                        continue;
                    }
                    let sorted = state.proposals.get_sorted_proposals(&order_hash);
                    if sorted.is_empty() {
                        debug!(order = %order_hash, "no proposals arrived, closing window");
                        state.proposals.stop_listen_proposals(&order_hash);
                    } else {
                        debug!(order = %order_hash, count = sorted.len(), "queueing proposals");
                        state.pending_proposals.extend(sorted);
                        get_next = true;
                    }
                }
            }
            ProposalJob::AcceptProposal | ProposalJob::FailHandshake => get_next = true,
        }

        if get_next {
            let next = controller.lock_state().pending_proposals.pop_front();
            if let Some(proposal) = next {
                get_next = false;
                controller.accept_proposal(proposal).await;
            }
        }
    }
    debug!("proposal loop stopped");
}

/// Consume handshake outcomes: successes build and send the replica,
/// failures advance the pipeline to the next-best proposal.
pub(crate) async fn process_handshakes(
    controller: Arc<StorageController>,
    mut events: mpsc::UnboundedReceiver<HandshakeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        if event.success {
            if let Err(e) = controller.send_replica(&event.handshake).await {
                warn!(order = %event.handshake.order_hash, error = %e, "replica transfer failed");
                controller.notify(ProposalJob::FailHandshake);
            }
        } else {
            let proposal = controller.lock_state().proposals.get_proposal(
                &event.handshake.order_hash,
                &event.handshake.proposal_hash,
            );
            if controller.network.connected_peers().len() > STORAGE_PEER_LIMIT {
                if let Some(proposal) = proposal {
                    controller.network.disconnect(proposal.address).await;
                }
            }
            controller.notify(ProposalJob::FailHandshake);
        }
    }
    debug!("handshake loop stopped");
}

impl StorageController {
    /// Open a handshake with the keeper behind the next queued proposal.
    /// Failures surface as `FailHandshake` so the pipeline moves on.
    pub(crate) async fn accept_proposal(&self, proposal: StorageProposal) {
        debug!(order = %proposal.order_hash, keeper = %proposal.address, rate = proposal.rate, "accepting proposal");
        match try_connect_node(
            self.network.as_ref(),
            proposal.address,
            self.config.connect_attempts,
        )
        .await
        {
            Ok(peer) => {
                if let Err(e) = self
                    .handshakes
                    .start_handshake(self.network.as_ref(), &proposal, &peer, self.config.dfs_port)
                    .await
                {
                    warn!(order = %proposal.order_hash, error = %e, "handshake send failed");
                    self.notify(ProposalJob::FailHandshake);
                }
            }
            Err(e) => {
                warn!(order = %proposal.order_hash, keeper = %proposal.address, error = %e, "keeper unreachable");
                self.notify(ProposalJob::FailHandshake);
            }
        }
    }

    /// Build the encrypted replica for a ready keeper and stream it out.
    /// Fresh RSA and AES keys are generated per replica; the temp-heap
    /// replica and the scratch Merkle tree are freed on every path.
    pub(crate) async fn send_replica(
        &self,
        handshake: &StorageHandshake,
    ) -> Result<(), ControllerError> {
        let (order, proposal, source) = {
            let state = self.lock_state();
            let order = state
                .announcements
                .get(&handshake.order_hash)
                .cloned()
                .ok_or(ControllerError::UnknownOrder(handshake.order_hash))?;
            let proposal = state
                .proposals
                .get_proposal(&handshake.order_hash, &handshake.proposal_hash)
                .ok_or(ControllerError::UnknownProposal(handshake.proposal_hash))?;
            let source = state
                .local_files
                .get(&handshake.order_hash)
                .cloned()
                .ok_or(ControllerError::MissingLocalFile(handshake.order_hash))?;
            (order, proposal, source)
        };

        let rsa = ReplicaKeyPair::generate()?;
        let keys = rsa.decryption_keys(AesKey::generate())?;
        let replica_size = crypto_replica_size(order.file_size);

        let temp = self
            .lock_state()
            .temp_heap
            .allocate_file(order.file_uri, replica_size)?;

        let result = async {
            replica::encrypt_replica(&source, &temp.fullpath, order.file_size, &keys, &rsa)?;
            self.lock_state()
                .temp_heap
                .set_decryption_keys(&order.file_uri, keys.clone())?;

            let tree = self
                .lock_state()
                .temp_heap
                .allocate_file(Hash256::ZERO, merkle::tree_size(replica_size))?;
            let root = merkle::build_tree(&temp.fullpath, &tree.fullpath);
            let _ = self.lock_state().temp_heap.free_file_at(&tree.fullpath);
            let root = root?;

            let payload = std::fs::read(&temp.fullpath)?;
            let stream = ReplicaStream {
                order_hash: handshake.order_hash,
                merkle_root: root,
                keys: keys.clone(),
                payload,
            };
            let peer = try_connect_node(
                self.network.as_ref(),
                proposal.address,
                self.config.connect_attempts,
            )
            .await?;
            self.network
                .push_message(&peer, StorageMessage::Send(stream))
                .await?;
            info!(order = %handshake.order_hash, keeper = %proposal.address, bytes = replica_size, "replica sent");
            Ok(())
        }
        .await;

        let _ = self.lock_state().temp_heap.free_file_at(&temp.fullpath);
        result
    }
}
