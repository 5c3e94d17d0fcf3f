//! End-to-end controller scenarios over the in-process network

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use dfs_storage::crypto::AesKey;
use dfs_storage::protocol::unix_time;
use dfs_storage::replica::merkle;
use dfs_storage::{
    crypto_replica_size, ControllerConfig, ControllerError, DecryptionKeys, Hash256, MemoryHub,
    MemoryNetwork, MessageSink, Network, PeerHandle, ReplicaStream, StorageController,
    StorageHandshake, StorageMessage, StorageOrder, StorageProposal,
};

struct Node {
    controller: Arc<StorageController>,
    network: Arc<MemoryNetwork>,
    address: SocketAddr,
    _dirs: TempDir,
}

fn node(hub: &Arc<MemoryHub>, address: &str, tune: impl FnOnce(&mut ControllerConfig)) -> Node {
    let address: SocketAddr = address.parse().unwrap();
    let dirs = tempdir().unwrap();
    let mut config = ControllerConfig::new(dirs.path().join("dfs"), dirs.path().join("dfstemp"));
    tune(&mut config);
    let network = MemoryNetwork::new(hub, address, 1);
    let controller = StorageController::new(network.clone(), config).unwrap();
    network.register_sink(controller.clone());
    Node {
        controller,
        network,
        address,
        _dirs: dirs,
    }
}

/// Sink that records every delivered command, for nodes the test plays
/// by hand.
struct RecordingSink {
    received: Mutex<Vec<(SocketAddr, String)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, from: &PeerHandle, command: &str, _payload: &[u8]) {
        self.received
            .lock()
            .unwrap()
            .push((from.address, command.to_string()));
    }
}

fn order_for(customer: SocketAddr, tag: &[u8], file_size: u64) -> StorageOrder {
    StorageOrder {
        time: unix_time(),
        file_uri: Hash256::from_data(tag),
        filename: String::from_utf8_lossy(tag).into_owned(),
        file_size,
        max_rate: 10,
        max_gap: 5,
        address: customer,
    }
}

async fn deliver(to: &Node, from: SocketAddr, message: StorageMessage) {
    let handle = PeerHandle {
        address: from,
        version: 1,
    };
    to.controller
        .process_storage_message(&handle, message.command(), &message.encode_payload())
        .await;
}

/// Give a node its externally visible address without waiting for the
/// discovery loop.
async fn assign_address(keeper: &Node, from: SocketAddr) {
    deliver(keeper, from, StorageMessage::Pong(keeper.address)).await;
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

fn dummy_keys() -> DecryptionKeys {
    DecryptionKeys {
        rsa_public_key: b"not a real key".to_vec(),
        aes_key: AesKey::from_bytes([1u8; 16]),
    }
}

/// Build a valid replica payload of the right crypto size together with
/// its Merkle root.
fn payload_with_root(file_size: u64) -> (Vec<u8>, Hash256) {
    let size = crypto_replica_size(file_size) as usize;
    let payload: Vec<u8> = (0..size).map(|i| (i * 13 % 251) as u8).collect();
    let dir = tempdir().unwrap();
    let replica = dir.path().join("replica");
    let tree = dir.path().join("tree");
    std::fs::write(&replica, &payload).unwrap();
    let root = merkle::build_tree(&replica, &tree).unwrap();
    (payload, root)
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_replica_placement() {
    let hub = MemoryHub::new();
    let customer = node(&hub, "10.0.0.1:7001", |c| {
        c.order_timeout = Duration::from_secs(2);
    });
    let keeper = node(&hub, "10.0.0.2:7002", |c| {
        c.rate = 7;
    });
    customer.controller.start();
    keeper.controller.start();
    assign_address(&keeper, customer.address).await;
    keeper.network.open_connection(customer.address).await;

    // the customer announces a 1000-byte file
    let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let source = customer._dirs.path().join("a.bin");
    std::fs::write(&source, &plain).unwrap();
    let order = order_for(customer.address, b"a.bin", 1000);
    let order_hash = order.hash();
    customer
        .controller
        .announce_order_with_file(order.clone(), &source)
        .await
        .unwrap();

    // gossip relays the announcement to the keeper, which bids
    deliver(&keeper, customer.address, StorageMessage::Announce(order.clone())).await;
    assert_eq!(customer.controller.get_proposals(&order_hash).len(), 1);

    // collection window closes, handshake runs, the replica transfers
    let stored = wait_until(Duration::from_secs(60), || {
        let chunks = keeper.controller.get_chunks(false);
        chunks[0]
            .files()
            .iter()
            .any(|f| f.uri == order.file_uri && f.size == 1024 && f.keys.is_some())
    })
    .await;
    assert!(stored, "keeper never stored the replica");

    // the keeper can reproduce the plaintext from what it holds
    let restored = keeper._dirs.path().join("restored.bin");
    keeper
        .controller
        .decrypt_replica(&order_hash, &restored)
        .unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), plain);

    // the customer released its temp replica
    let temp_free = wait_until(Duration::from_secs(10), || {
        let chunks = customer.controller.get_chunks(true);
        chunks[0].free_space() == chunks[0].capacity()
    })
    .await;
    assert!(temp_free, "customer temp heap still holds the replica");

    customer.controller.stop_threads().await;
    keeper.controller.stop_threads().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn keeper_rejects_wrong_merkle_root() {
    let hub = MemoryHub::new();
    let keeper = node(&hub, "10.0.0.2:7002", |_| {});
    let customer: SocketAddr = "10.0.0.9:7009".parse().unwrap();

    let order = order_for(customer, b"bad.bin", 500);
    deliver(&keeper, customer, StorageMessage::Announce(order.clone())).await;
    deliver(
        &keeper,
        customer,
        StorageMessage::Handshake(StorageHandshake {
            time: unix_time(),
            order_hash: order.hash(),
            proposal_hash: Hash256::from_data(b"p"),
            port: 1507,
        }),
    )
    .await;

    let (payload, _root) = payload_with_root(500);
    deliver(
        &keeper,
        customer,
        StorageMessage::Send(ReplicaStream {
            order_hash: order.hash(),
            merkle_root: Hash256::from_data(b"flipped"),
            keys: dummy_keys(),
            payload,
        }),
    )
    .await;

    // nothing stored, scratch space reclaimed
    let durable = keeper.controller.get_chunks(false);
    assert!(durable[0].files().is_empty());
    let temp = keeper.controller.get_chunks(true);
    assert_eq!(temp[0].free_space(), temp[0].capacity());
}

#[tokio::test(flavor = "multi_thread")]
async fn keeper_stores_replica_with_correct_root() {
    let hub = MemoryHub::new();
    let keeper = node(&hub, "10.0.0.2:7002", |_| {});
    let customer: SocketAddr = "10.0.0.9:7009".parse().unwrap();

    let order = order_for(customer, b"good.bin", 500);
    deliver(&keeper, customer, StorageMessage::Announce(order.clone())).await;
    deliver(
        &keeper,
        customer,
        StorageMessage::Handshake(StorageHandshake {
            time: unix_time(),
            order_hash: order.hash(),
            proposal_hash: Hash256::from_data(b"p"),
            port: 1507,
        }),
    )
    .await;

    let (payload, root) = payload_with_root(500);
    let keys = dummy_keys();

    // undersized payload is discarded before verification
    deliver(
        &keeper,
        customer,
        StorageMessage::Send(ReplicaStream {
            order_hash: order.hash(),
            merkle_root: root,
            keys: keys.clone(),
            payload: payload[..payload.len() - 1].to_vec(),
        }),
    )
    .await;
    assert!(keeper.controller.get_chunks(false)[0].files().is_empty());

    deliver(
        &keeper,
        customer,
        StorageMessage::Send(ReplicaStream {
            order_hash: order.hash(),
            merkle_root: root,
            keys: keys.clone(),
            payload,
        }),
    )
    .await;

    let durable = keeper.controller.get_chunks(false);
    assert_eq!(durable[0].files().len(), 1);
    let stored = &durable[0].files()[0];
    assert_eq!(stored.uri, order.file_uri);
    assert_eq!(stored.size, crypto_replica_size(500));
    assert_eq!(stored.keys.as_ref(), Some(&keys));
    let temp = keeper.controller.get_chunks(true);
    assert_eq!(temp[0].free_space(), temp[0].capacity());
}

#[tokio::test(flavor = "multi_thread")]
async fn undersubscribed_order_stops_listening() {
    let hub = MemoryHub::new();
    let customer = node(&hub, "10.0.0.1:7001", |c| {
        c.order_timeout = Duration::from_millis(200);
    });
    customer.controller.start();

    let source = customer._dirs.path().join("lonely.bin");
    std::fs::write(&source, vec![0u8; 64]).unwrap();
    let order = order_for(customer.address, b"lonely.bin", 64);
    let order_hash = order.hash();
    customer
        .controller
        .announce_order_with_file(order, &source)
        .await
        .unwrap();

    // window elapses with zero proposals
    tokio::time::sleep(Duration::from_millis(600)).await;

    // the order stays announced until explicitly cleared
    assert!(customer.controller.get_announce(&order_hash).is_some());

    // but the window is closed: a late proposal is not collected
    let late = StorageProposal {
        time: unix_time(),
        order_hash,
        rate: 2,
        address: "10.0.0.3:7003".parse().unwrap(),
    };
    deliver(
        &customer,
        late.address,
        StorageMessage::Proposal(late.clone()),
    )
    .await;
    assert!(customer.controller.get_proposals(&order_hash).is_empty());

    customer.controller.stop_threads().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_recheck_at_handshake_time() {
    let hub = MemoryHub::new();
    // room for one small replica only
    let keeper = node(&hub, "10.0.0.2:7002", |c| {
        c.capacity = 700;
    });
    let customer_addr: SocketAddr = "10.0.0.1:7001".parse().unwrap();
    let customer_net = MemoryNetwork::new(&hub, customer_addr, 1);
    let customer_sink = RecordingSink::new();
    customer_net.register_sink(customer_sink.clone());

    assign_address(&keeper, customer_addr).await;

    // two orders, both fitting at announce time
    let order_a = order_for(customer_addr, b"a", 400);
    let order_b = order_for(customer_addr, b"b", 300);
    deliver(&keeper, customer_addr, StorageMessage::Announce(order_a.clone())).await;
    deliver(&keeper, customer_addr, StorageMessage::Announce(order_b.clone())).await;
    assert_eq!(
        customer_sink
            .commands()
            .iter()
            .filter(|c| *c == "dfsproposal")
            .count(),
        2
    );

    // order B transfers first and eats most of the space
    deliver(
        &keeper,
        customer_addr,
        StorageMessage::Handshake(StorageHandshake {
            time: unix_time(),
            order_hash: order_b.hash(),
            proposal_hash: Hash256::from_data(b"pb"),
            port: 1507,
        }),
    )
    .await;
    let (payload, root) = payload_with_root(300);
    deliver(
        &keeper,
        customer_addr,
        StorageMessage::Send(ReplicaStream {
            order_hash: order_b.hash(),
            merkle_root: root,
            keys: dummy_keys(),
            payload,
        }),
    )
    .await;
    assert_eq!(keeper.controller.get_chunks(false)[0].files().len(), 1);
    let ready_count = customer_sink
        .commands()
        .iter()
        .filter(|c| *c == "dfsrr")
        .count();
    assert_eq!(ready_count, 1);

    // the recheck for order A fails now: the keeper stays silent
    deliver(
        &keeper,
        customer_addr,
        StorageMessage::Handshake(StorageHandshake {
            time: unix_time(),
            order_hash: order_a.hash(),
            proposal_hash: Hash256::from_data(b"pa"),
            port: 1507,
        }),
    )
    .await;
    let ready_after = customer_sink
        .commands()
        .iter()
        .filter(|c| *c == "dfsrr")
        .count();
    assert_eq!(ready_after, 1, "keeper must not acknowledge without room");
}

#[tokio::test(flavor = "multi_thread")]
async fn ip_discovery_round() {
    let hub = MemoryHub::new();
    let a = node(&hub, "10.0.0.1:7001", |_| {});
    let b = node(&hub, "10.0.0.2:7002", |_| {});
    a.controller.start();
    b.controller.start();
    a.network.open_connection(b.address).await;

    let discovered = wait_until(Duration::from_secs(10), || {
        a.controller.external_address().is_some() && b.controller.external_address().is_some()
    })
    .await;
    assert!(discovered, "address discovery never completed");
    assert_eq!(a.controller.external_address(), Some(a.address));
    assert_eq!(b.controller.external_address(), Some(b.address));

    a.controller.stop_threads().await;
    b.controller.stop_threads().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_is_idempotent_and_cancel_is_complete() {
    let hub = MemoryHub::new();
    let customer = node(&hub, "10.0.0.1:7001", |_| {});

    let source = customer._dirs.path().join("c.bin");
    std::fs::write(&source, vec![7u8; 128]).unwrap();
    let order = order_for(customer.address, b"c.bin", 128);
    let order_hash = order.hash();

    customer
        .controller
        .announce_order_with_file(order.clone(), &source)
        .await
        .unwrap();
    customer.controller.announce_order(order.clone()).await.unwrap();
    assert_eq!(customer.controller.get_announcements().len(), 1);
    assert_eq!(customer.controller.get_announce(&order_hash), Some(order));

    // a collected proposal disappears with the order
    let proposal = StorageProposal {
        time: unix_time(),
        order_hash,
        rate: 3,
        address: "10.0.0.5:7005".parse().unwrap(),
    };
    deliver(
        &customer,
        proposal.address,
        StorageMessage::Proposal(proposal),
    )
    .await;
    assert_eq!(customer.controller.get_proposals(&order_hash).len(), 1);

    assert!(customer.controller.cancel_order(&order_hash));
    assert!(!customer.controller.cancel_order(&order_hash));
    assert!(customer.controller.get_announce(&order_hash).is_none());
    assert!(customer.controller.get_proposals(&order_hash).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_old_announcements_drops_stale_orders() {
    let hub = MemoryHub::new();
    let customer = node(&hub, "10.0.0.1:7001", |_| {});

    let mut old_order = order_for(customer.address, b"old", 10);
    old_order.time = 100;
    let mut fresh_order = order_for(customer.address, b"fresh", 10);
    fresh_order.time = 200;

    customer.controller.announce_order(old_order.clone()).await.unwrap();
    customer
        .controller
        .announce_order(fresh_order.clone())
        .await
        .unwrap();

    customer.controller.clear_old_announcements(150);
    assert!(customer.controller.get_announce(&old_order.hash()).is_none());
    assert!(customer
        .controller
        .get_announce(&fresh_order.hash())
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_with_wrong_file_size_is_rejected() {
    let hub = MemoryHub::new();
    let customer = node(&hub, "10.0.0.1:7001", |_| {});

    let source = customer._dirs.path().join("short.bin");
    std::fs::write(&source, vec![0u8; 10]).unwrap();
    let order = order_for(customer.address, b"short.bin", 999);

    let err = customer
        .controller
        .announce_order_with_file(order, &source)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::OrderFileMismatch {
            expected: 999,
            actual: 10
        }
    ));
}
