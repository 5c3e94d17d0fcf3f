//! The peer-to-peer substrate as consumed by the storage overlay
//!
//! The overlay does not implement messaging; it rides on the host node's
//! gossip network through the [`Network`] capability: directed sends by
//! peer address, inventory broadcast, connection management, and an
//! inbound dispatch hook ([`MessageSink`]) invoked per incoming message.

pub mod memory;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{Inventory, StorageMessage};

pub use memory::{MemoryHub, MemoryNetwork};

/// Spacing between connection attempts in [`try_connect_node`]
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("peer {0} unreachable")]
    PeerUnreachable(SocketAddr),
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
    #[error("send to {0} failed: {1}")]
    SendFailed(SocketAddr, String),
}

/// A live peer as seen by the substrate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHandle {
    pub address: SocketAddr,
    /// Peer's advertised protocol version
    pub version: u32,
}

/// Messaging capability provided by the host node
#[async_trait]
pub trait Network: Send + Sync {
    /// Look up a connected peer by address
    fn find_node(&self, address: SocketAddr) -> Option<PeerHandle>;

    /// Ask the substrate to dial an address; completion is observed via
    /// a later [`Network::find_node`]
    async fn open_connection(&self, address: SocketAddr);

    /// Send one command to a connected peer
    async fn push_message(
        &self,
        peer: &PeerHandle,
        message: StorageMessage,
    ) -> Result<(), NetworkError>;

    /// Snapshot of currently connected peers
    fn connected_peers(&self) -> Vec<PeerHandle>;

    /// Relay inventory to every peer at or above the active protocol
    async fn broadcast_inventory(&self, inventory: Vec<Inventory>);

    /// Drop the connection to a peer
    async fn disconnect(&self, address: SocketAddr);

    /// Local listening port
    fn listen_port(&self) -> u16;

    /// Minimum protocol version for relay
    fn active_protocol(&self) -> u32;
}

/// Inbound dispatch hook: the substrate hands every incoming message to
/// the overlay through this trait.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, from: &PeerHandle, command: &str, payload: &[u8]);
}

/// Find a peer, dialing up to `attempts` times with a bounded delay
/// between tries.
pub async fn try_connect_node(
    network: &dyn Network,
    address: SocketAddr,
    attempts: u32,
) -> Result<PeerHandle, NetworkError> {
    if let Some(peer) = network.find_node(address) {
        return Ok(peer);
    }
    for _ in 0..attempts {
        network.open_connection(address).await;
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        if let Some(peer) = network.find_node(address) {
            return Ok(peer);
        }
    }
    Err(NetworkError::PeerUnreachable(address))
}
