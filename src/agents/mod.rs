//! Concurrent agents driving the storage protocol

pub mod handshakes;
pub mod proposals;

pub use handshakes::{HandshakeAgent, HandshakeEvent};
pub use proposals::ProposalsAgent;
