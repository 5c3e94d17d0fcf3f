//! Storage controller
//!
//! The long-lived coordinator of the overlay: owns the announcement and
//! local-file maps, both storage heaps, the proposal and handshake
//! agents, and the three background workers. One mutex guards all shared
//! indices; it is never held across network sends or bulk disk IO.

pub mod dispatch;
pub mod workers;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agents::{HandshakeAgent, HandshakeEvent, ProposalsAgent};
use crate::crypto::{CryptoError, Hash256};
use crate::heap::{HeapError, StorageChunk, StorageHeap};
use crate::network::{Network, NetworkError};
use crate::protocol::{
    Inventory, StorageOrder, StorageProposal, DEFAULT_DFS_PORT, DEFAULT_STORAGE_SIZE,
    HANDSHAKE_TIMEOUT, IP_REFRESH, ORDER_TIMEOUT, STORAGE_MIN_RATE,
};
use crate::replica::{self, ReplicaError};
use crate::timer::CancellableTimer;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("unknown order {0}")]
    UnknownOrder(Hash256),
    #[error("unknown proposal {0}")]
    UnknownProposal(Hash256),
    #[error("no local file for order {0}")]
    MissingLocalFile(Hash256),
    #[error("no decryption keys stored for {0}")]
    MissingKeys(Hash256),
    #[error("replica for order {0} is not stored locally")]
    ReplicaNotStored(Hash256),
    #[error("backing file is {actual} bytes, order says {expected}")]
    OrderFileMismatch { expected: u64, actual: u64 },
}

/// Jobs consumed by the proposal worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalJob {
    /// An order's collection window elapsed; look at what arrived
    CheckProposals,
    /// A transfer concluded; drive the next queued proposal
    AcceptProposal,
    /// A handshake or transfer failed; drive the next queued proposal
    FailHandshake,
}

/// Tunables of one controller instance
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Durable heap directory
    pub data_dir: PathBuf,
    /// Temp heap directory (replica building, scratch files)
    pub temp_dir: PathBuf,
    /// Capacity of each heap's default chunk
    pub capacity: u64,
    /// Rate this node bids when acting as keeper
    pub rate: u64,
    /// Smallest freshness bound this node accepts as keeper
    pub max_gap: u64,
    /// Port advertised in handshakes
    pub dfs_port: u16,
    /// Proposal collection window per announced order
    pub order_timeout: Duration,
    /// Window for the counterparty of a handshake to answer
    pub handshake_timeout: Duration,
    /// How often the externally visible address is re-probed
    pub ip_refresh: Duration,
    /// Dial retries when a counterparty is not yet connected
    pub connect_attempts: u32,
}

impl ControllerConfig {
    pub fn new(data_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            temp_dir: temp_dir.into(),
            capacity: DEFAULT_STORAGE_SIZE,
            rate: STORAGE_MIN_RATE,
            max_gap: 0,
            dfs_port: DEFAULT_DFS_PORT,
            order_timeout: ORDER_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            ip_refresh: IP_REFRESH,
            connect_attempts: 1,
        }
    }
}

/// Shared indices behind the controller mutex
pub(crate) struct ControllerState {
    pub announcements: HashMap<Hash256, StorageOrder>,
    pub local_files: HashMap<Hash256, PathBuf>,
    pub order_timers: HashMap<Hash256, CancellableTimer>,
    pub heap: StorageHeap,
    pub temp_heap: StorageHeap,
    pub proposals: ProposalsAgent,
    /// Accepted proposals still to be driven through handshake, FIFO
    pub pending_proposals: VecDeque<StorageProposal>,
    /// Externally visible address, once discovered
    pub address: Option<SocketAddr>,
}

pub struct StorageController {
    pub(crate) config: ControllerConfig,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) state: Mutex<ControllerState>,
    pub(crate) handshakes: HandshakeAgent,
    jobs_tx: mpsc::UnboundedSender<ProposalJob>,
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<ProposalJob>>>,
    handshake_rx: Mutex<Option<mpsc::UnboundedReceiver<HandshakeEvent>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageController {
    /// Create a controller, initializing both storage heaps under the
    /// configured directories.
    pub fn new(
        network: Arc<dyn Network>,
        config: ControllerConfig,
    ) -> Result<Arc<Self>, ControllerError> {
        let (heap, temp_heap) =
            Self::init_storages(&config.data_dir, &config.temp_dir, config.capacity)?;
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            handshakes: HandshakeAgent::new(handshake_tx, config.handshake_timeout),
            config,
            network,
            state: Mutex::new(ControllerState {
                announcements: HashMap::new(),
                local_files: HashMap::new(),
                order_timers: HashMap::new(),
                heap,
                temp_heap,
                proposals: ProposalsAgent::new(),
                pending_proposals: VecDeque::new(),
                address: None,
            }),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            handshake_rx: Mutex::new(Some(handshake_rx)),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Open (or create) the durable and temp heaps with one default
    /// chunk each.
    fn init_storages(
        data_dir: &Path,
        temp_dir: &Path,
        capacity: u64,
    ) -> Result<(StorageHeap, StorageHeap), ControllerError> {
        let mut heap = StorageHeap::new();
        heap.add_chunk(data_dir, capacity)?;
        let mut temp_heap = StorageHeap::new();
        temp_heap.add_chunk(temp_dir, capacity)?;
        Ok((heap, temp_heap))
    }

    /// Spawn the three background workers. Idempotent; only the first
    /// call starts them.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.workers.lock().unwrap();
        if let Some(jobs_rx) = self.jobs_rx.lock().unwrap().take() {
            handles.push(tokio::spawn(workers::found_my_ip(
                Arc::clone(self),
                self.shutdown.subscribe(),
            )));
            handles.push(tokio::spawn(workers::process_proposals(
                Arc::clone(self),
                jobs_rx,
                self.shutdown.subscribe(),
            )));
        }
        if let Some(handshake_rx) = self.handshake_rx.lock().unwrap().take() {
            handles.push(tokio::spawn(workers::process_handshakes(
                Arc::clone(self),
                handshake_rx,
                self.shutdown.subscribe(),
            )));
        }
    }

    /// Cooperative shutdown: raise the flag, wake every worker, join all
    /// of them before returning.
    pub async fn stop_threads(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("storage workers stopped");
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn notify(&self, job: ProposalJob) {
        let _ = self.jobs_tx.send(job);
    }

    /// Publish an order to the overlay. Idempotent on the announcement
    /// map; the inventory is relayed on every call.
    pub async fn announce_order(&self, order: StorageOrder) -> Result<(), ControllerError> {
        let hash = order.hash();
        {
            let mut state = self.lock_state();
            state.announcements.entry(hash).or_insert_with(|| {
                debug!(order = %hash, "order announced");
                order.clone()
            });
        }
        self.create_order_transaction(&order);
        self.network
            .broadcast_inventory(vec![Inventory::order(hash)])
            .await;
        Ok(())
    }

    /// Publish an order backed by a local plaintext file and start
    /// collecting proposals for it. The collection window is driven by a
    /// per-order timer.
    pub async fn announce_order_with_file(
        &self,
        order: StorageOrder,
        path: impl Into<PathBuf>,
    ) -> Result<(), ControllerError> {
        let path = path.into();
        let actual = std::fs::metadata(&path)?.len();
        if actual != order.file_size {
            return Err(ControllerError::OrderFileMismatch {
                expected: order.file_size,
                actual,
            });
        }

        let hash = order.hash();
        self.announce_order(order).await?;

        let jobs = self.jobs_tx.clone();
        let timer = CancellableTimer::spawn(self.config.order_timeout, move || {
            let _ = jobs.send(ProposalJob::CheckProposals);
        });

        let mut state = self.lock_state();
        state.local_files.insert(hash, path);
        state.proposals.listen_proposals(hash);
        state.order_timers.insert(hash, timer);
        Ok(())
    }

    /// Withdraw an order together with its proposals, local-file binding
    /// and listen flag. Returns false when the order was not announced.
    pub fn cancel_order(&self, order_hash: &Hash256) -> bool {
        let mut state = self.lock_state();
        if state.announcements.remove(order_hash).is_none() {
            return false;
        }
        Self::purge_order(&mut state, order_hash);
        debug!(order = %order_hash, "order cancelled");
        true
    }

    /// Drop every announcement older than `threshold` (seconds since
    /// epoch) with all attached state.
    pub fn clear_old_announcements(&self, threshold: u64) {
        let mut state = self.lock_state();
        let stale: Vec<Hash256> = state
            .announcements
            .iter()
            .filter(|(_, order)| order.time < threshold)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            state.announcements.remove(&hash);
            Self::purge_order(&mut state, &hash);
            debug!(order = %hash, "stale announcement cleared");
        }
    }

    fn purge_order(state: &mut ControllerState, order_hash: &Hash256) {
        state.local_files.remove(order_hash);
        state.order_timers.remove(order_hash);
        state.proposals.stop_listen_proposals(order_hash);
        state.proposals.erase_order_proposals(order_hash);
        state.pending_proposals.retain(|p| p.order_hash != *order_hash);
    }

    /// Decrypt a stored replica back to plaintext at `dest`. Works
    /// wherever the replica and its keys live (durable heap first).
    pub fn decrypt_replica(
        &self,
        order_hash: &Hash256,
        dest: &Path,
    ) -> Result<(), ControllerError> {
        let (file, file_size) = {
            let state = self.lock_state();
            let order = state
                .announcements
                .get(order_hash)
                .ok_or(ControllerError::UnknownOrder(*order_hash))?;
            let file = state
                .heap
                .get_file(&order.file_uri)
                .or_else(|| state.temp_heap.get_file(&order.file_uri))
                .ok_or(ControllerError::ReplicaNotStored(*order_hash))?;
            (file, order.file_size)
        };
        let keys = file
            .keys
            .as_ref()
            .ok_or(ControllerError::MissingKeys(*order_hash))?;
        replica::decrypt_replica(&file.fullpath, dest, file_size, keys)?;
        Ok(())
    }

    /// Externally visible address, once `dfspong` discovery succeeded
    pub fn external_address(&self) -> Option<SocketAddr> {
        self.lock_state().address
    }

    pub fn get_announcements(&self) -> Vec<StorageOrder> {
        self.lock_state().announcements.values().cloned().collect()
    }

    pub fn get_announce(&self, order_hash: &Hash256) -> Option<StorageOrder> {
        self.lock_state().announcements.get(order_hash).cloned()
    }

    /// Snapshot of the chunks of one heap
    pub fn get_chunks(&self, temp: bool) -> Vec<StorageChunk> {
        let state = self.lock_state();
        let heap = if temp { &state.temp_heap } else { &state.heap };
        heap.chunks().to_vec()
    }

    /// Relocate a chunk of one heap to a new directory
    pub fn move_chunk(
        &self,
        index: usize,
        new_path: impl Into<PathBuf>,
        temp: bool,
    ) -> Result<(), ControllerError> {
        let mut state = self.lock_state();
        let heap = if temp {
            &mut state.temp_heap
        } else {
            &mut state.heap
        };
        heap.move_chunk(index, new_path)?;
        Ok(())
    }

    pub fn get_proposals(&self, order_hash: &Hash256) -> Vec<StorageProposal> {
        self.lock_state().proposals.get_proposals(order_hash)
    }

    pub fn get_proposal(
        &self,
        order_hash: &Hash256,
        proposal_hash: &Hash256,
    ) -> Option<StorageProposal> {
        self.lock_state()
            .proposals
            .get_proposal(order_hash, proposal_hash)
    }

    /// Chain integration point: record the announced order on chain.
    /// Intentionally a no-op until a chain collaborator exists.
    pub fn create_order_transaction(&self, _order: &StorageOrder) {}

    /// Chain integration point: record proof of storage for a verified
    /// replica. Intentionally a no-op until a chain collaborator exists.
    pub fn create_proof_transaction(&self, _order_hash: &Hash256, _merkle_root: &Hash256) {}
}
