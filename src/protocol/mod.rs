//! Wire protocol for the storage overlay
//!
//! Seven commands ride on the host gossip network:
//! - `dfsannounce` — customer publishes a storage order
//! - `dfsproposal` — keeper bids on an order
//! - `dfshandshake` — customer tells a winning keeper to accept a replica
//! - `dfsrr` — keeper signals it is ready to receive
//! - `dfssend` — customer streams the encrypted replica
//! - `dfsresv` — keeper confirms the replica is stored
//! - `dfsping` / `dfspong` — observed-address self discovery
//!
//! Payloads use the canonical little-endian encoding in [`codec`]; the
//! same bytes are the SHA-256d preimage for order and proposal hashes.

pub mod codec;
pub mod messages;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use messages::{
    Inventory, ReplicaStream, StorageHandshake, StorageMessage, StorageOrder, StorageProposal,
};

/// RSA modulus size in bytes; one ciphertext block on disk and on the wire
pub const RSA_BLOCK_SIZE: usize = 128;

/// Default capacity of each storage heap in bytes
pub const DEFAULT_STORAGE_SIZE: u64 = 100 * 1024 * 1024;

/// Default port advertised in handshakes for replica transfer
pub const DEFAULT_DFS_PORT: u16 = 1507;

/// Lowest rate a keeper will bid
pub const STORAGE_MIN_RATE: u64 = 1;

/// Inventory type tag for storage order announcements
pub const MSG_STORAGE_ORDER_ANNOUNCE: u32 = 20;

/// How long a customer collects proposals before selecting keepers
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(60);

/// How long either side waits for the counterparty of a handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a node re-probes its externally visible address
pub const IP_REFRESH: Duration = Duration::from_secs(3600);

/// Soft cap on connections kept open to storage counterparties
pub const STORAGE_PEER_LIMIT: usize = 5;

/// Replica payload is framed in var-bytes chunks of at most this size
pub const REPLICA_CHUNK_SIZE: usize = 4096;

pub const CMD_ANNOUNCE: &str = "dfsannounce";
pub const CMD_PROPOSAL: &str = "dfsproposal";
pub const CMD_HANDSHAKE: &str = "dfshandshake";
pub const CMD_READY: &str = "dfsrr";
pub const CMD_SEND: &str = "dfssend";
pub const CMD_RESERVED: &str = "dfsresv";
pub const CMD_PING: &str = "dfsping";
pub const CMD_PONG: &str = "dfspong";

/// Seconds since the Unix epoch
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
