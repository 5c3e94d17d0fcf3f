//! Distributed file storage overlay
//!
//! A storage market riding on an existing gossip network of nodes:
//! - A *customer* announces an order for keeping a file
//! - *Keepers* with room bid on the order; bids are collected per order
//! - The customer picks the cheapest bids, handshakes with each winner,
//!   encrypts the file under fresh per-replica keys and streams it over
//! - The keeper verifies the replica against its Merkle root, stores it
//!   with the decryption keys, and confirms
//!
//! The controller owns the protocol state machine, the background
//! workers driving it, the encrypted-replica builder, and the local
//! storage heap that accounts every byte against a fixed quota. The
//! messaging substrate is consumed through the [`network::Network`]
//! capability and never implemented here.

pub mod agents;
pub mod controller;
pub mod crypto;
pub mod heap;
pub mod network;
pub mod protocol;
pub mod replica;
pub mod timer;

// Re-export commonly used types
pub use controller::{ControllerConfig, ControllerError, ProposalJob, StorageController};
pub use crypto::{AesKey, DecryptionKeys, Hash256, ReplicaKeyPair};
pub use heap::{AllocatedFile, HeapError, StorageChunk, StorageHeap};
pub use network::{MemoryHub, MemoryNetwork, MessageSink, Network, NetworkError, PeerHandle};
pub use protocol::{
    Inventory, ReplicaStream, StorageHandshake, StorageMessage, StorageOrder, StorageProposal,
};
pub use replica::crypto_replica_size;
pub use timer::CancellableTimer;
