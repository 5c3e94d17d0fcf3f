//! In-process network substrate
//!
//! Wires several controllers together through a shared hub with explicit
//! connection tracking. Messages are encoded and decoded through the
//! canonical codec on every hop, so tests exercise the same bytes that
//! would travel between real peers.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{MessageSink, Network, NetworkError, PeerHandle};
use crate::protocol::{Inventory, StorageMessage};

struct HubNode {
    sink: Arc<dyn MessageSink>,
    version: u32,
}

/// Shared registry of nodes and links
#[derive(Default)]
pub struct MemoryHub {
    nodes: Mutex<HashMap<SocketAddr, HubNode>>,
    links: Mutex<HashSet<(SocketAddr, SocketAddr)>>,
}

fn link_key(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, address: SocketAddr, sink: Arc<dyn MessageSink>, version: u32) {
        self.nodes
            .lock()
            .unwrap()
            .insert(address, HubNode { sink, version });
    }

    fn connect(&self, a: SocketAddr, b: SocketAddr) {
        let nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&a) && nodes.contains_key(&b) {
            self.links.lock().unwrap().insert(link_key(a, b));
        }
    }

    fn disconnect(&self, a: SocketAddr, b: SocketAddr) {
        self.links.lock().unwrap().remove(&link_key(a, b));
    }

    fn connected(&self, a: SocketAddr, b: SocketAddr) -> bool {
        self.links.lock().unwrap().contains(&link_key(a, b))
    }

    fn peer_handle(&self, address: SocketAddr) -> Option<PeerHandle> {
        self.nodes.lock().unwrap().get(&address).map(|n| PeerHandle {
            address,
            version: n.version,
        })
    }

    fn peers_of(&self, local: SocketAddr) -> Vec<PeerHandle> {
        let links = self.links.lock().unwrap();
        let nodes = self.nodes.lock().unwrap();
        links
            .iter()
            .filter_map(|(a, b)| {
                let remote = if *a == local {
                    *b
                } else if *b == local {
                    *a
                } else {
                    return None;
                };
                nodes.get(&remote).map(|n| PeerHandle {
                    address: remote,
                    version: n.version,
                })
            })
            .collect()
    }

    fn sink_of(&self, address: SocketAddr) -> Option<Arc<dyn MessageSink>> {
        self.nodes
            .lock()
            .unwrap()
            .get(&address)
            .map(|n| Arc::clone(&n.sink))
    }
}

/// One node's view of the hub
pub struct MemoryNetwork {
    hub: Arc<MemoryHub>,
    local: SocketAddr,
    version: u32,
    broadcasts: Mutex<Vec<Inventory>>,
}

impl MemoryNetwork {
    pub fn new(hub: &Arc<MemoryHub>, local: SocketAddr, version: u32) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::clone(hub),
            local,
            version,
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    /// Attach the inbound dispatch hook for this node
    pub fn register_sink(&self, sink: Arc<dyn MessageSink>) {
        self.hub.register(self.local, sink, self.version);
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    /// Inventory recorded by [`Network::broadcast_inventory`]
    pub fn broadcasts(&self) -> Vec<Inventory> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    fn find_node(&self, address: SocketAddr) -> Option<PeerHandle> {
        if !self.hub.connected(self.local, address) {
            return None;
        }
        self.hub.peer_handle(address)
    }

    async fn open_connection(&self, address: SocketAddr) {
        self.hub.connect(self.local, address);
    }

    async fn push_message(
        &self,
        peer: &PeerHandle,
        message: StorageMessage,
    ) -> Result<(), NetworkError> {
        if !self.hub.connected(self.local, peer.address) {
            return Err(NetworkError::NotConnected(peer.address));
        }
        let sink = self
            .hub
            .sink_of(peer.address)
            .ok_or(NetworkError::PeerUnreachable(peer.address))?;
        let command = message.command();
        let payload = message.encode_payload();
        debug!(to = %peer.address, command, "delivering message");
        let from = PeerHandle {
            address: self.local,
            version: self.version,
        };
        sink.deliver(&from, command, &payload).await;
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerHandle> {
        self.hub.peers_of(self.local)
    }

    async fn broadcast_inventory(&self, inventory: Vec<Inventory>) {
        self.broadcasts.lock().unwrap().extend(inventory);
    }

    async fn disconnect(&self, address: SocketAddr) {
        self.hub.disconnect(self.local, address);
    }

    fn listen_port(&self) -> u16 {
        self.local.port()
    }

    fn active_protocol(&self) -> u32 {
        self.version
    }
}
