//! Outstanding-handshake tracking
//!
//! Each pending handshake carries a cancellable timer. If the
//! counterparty answers in time the dispatcher cancels the wait and the
//! handshake resolves to success; otherwise the timer removes the entry
//! and pushes a failure event into the handshake queue. Entry removal
//! happens before any event is sent, so a racing cancel and a firing
//! timer can never both act on the same handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::crypto::Hash256;
use crate::network::{Network, NetworkError, PeerHandle};
use crate::protocol::{unix_time, StorageHandshake, StorageMessage, StorageProposal};
use crate::timer::CancellableTimer;

/// Outcome of a pending handshake, consumed by the handshake worker
#[derive(Debug)]
pub struct HandshakeEvent {
    pub success: bool,
    pub handshake: StorageHandshake,
}

struct PendingHandshake {
    handshake: StorageHandshake,
    _timer: CancellableTimer,
}

pub struct HandshakeAgent {
    pending: Arc<Mutex<HashMap<Hash256, PendingHandshake>>>,
    events: mpsc::UnboundedSender<HandshakeEvent>,
    timeout: Duration,
}

impl HandshakeAgent {
    pub fn new(events: mpsc::UnboundedSender<HandshakeEvent>, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
            timeout,
        }
    }

    /// Track a handshake and start its expiry timer
    pub fn add(&self, handshake: StorageHandshake) {
        let order_hash = handshake.order_hash;
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let timer = CancellableTimer::spawn(self.timeout, move || {
            let removed = pending
                .lock().unwrap().remove(&order_hash);
            if let Some(entry) = removed {
                debug!(order = %order_hash, "handshake timed out");
                let _ = events.send(HandshakeEvent {
                    success: false,
                    handshake: entry.handshake,
                });
            }
        });
        self.pending.lock().unwrap().insert(
            order_hash,
            PendingHandshake {
                handshake,
                _timer: timer,
            },
        );
    }

    pub fn find(&self, order_hash: &Hash256) -> Option<StorageHandshake> {
        self.pending
            .lock()
            .unwrap()
            .get(order_hash)
            .map(|e| e.handshake.clone())
    }

    /// Stop waiting for an order's handshake. Returns the tracked
    /// handshake if one was still pending; its timer will not fire.
    pub fn cancel_wait(&self, order_hash: &Hash256) -> Option<StorageHandshake> {
        self.pending
            .lock()
            .unwrap()
            .remove(order_hash)
            .map(|e| e.handshake)
    }

    /// The counterparty answered in time: cancel the wait, re-register
    /// the answered handshake (arming a fresh timer that bounds the wait
    /// for the transfer to conclude), and signal success. Returns false
    /// when nothing was pending (a late or unsolicited answer).
    pub fn resolve(&self, handshake: StorageHandshake) -> bool {
        if self.cancel_wait(&handshake.order_hash).is_none() {
            return false;
        }
        self.add(handshake.clone());
        let _ = self.events.send(HandshakeEvent {
            success: true,
            handshake,
        });
        true
    }

    /// Open the handshake with a keeper whose proposal won: send
    /// `dfshandshake` and start the expiry timer.
    pub async fn start_handshake(
        &self,
        network: &dyn Network,
        proposal: &StorageProposal,
        peer: &PeerHandle,
        port: u16,
    ) -> Result<(), NetworkError> {
        let handshake = StorageHandshake {
            time: unix_time(),
            order_hash: proposal.order_hash,
            proposal_hash: proposal.hash(),
            port,
        };
        network
            .push_message(peer, StorageMessage::Handshake(handshake.clone()))
            .await?;
        self.add(handshake);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(tag: &[u8]) -> StorageHandshake {
        StorageHandshake {
            time: 1,
            order_hash: Hash256::from_data(tag),
            proposal_hash: Hash256::from_data(b"p"),
            port: 1507,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_emits_single_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = HandshakeAgent::new(tx, Duration::from_secs(30));
        let h = handshake(b"o1");
        agent.add(h.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let event = rx.recv().await.unwrap();
        assert!(!event.success);
        assert_eq!(event.handshake, h);
        assert!(agent.find(&h.order_hash).is_none());

        // nothing further
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wait_stops_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = HandshakeAgent::new(tx, Duration::from_secs(30));
        let h = handshake(b"o1");
        agent.add(h.clone());

        assert_eq!(agent.cancel_wait(&h.order_hash), Some(h.clone()));
        assert_eq!(agent.cancel_wait(&h.order_hash), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_signals_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = HandshakeAgent::new(tx, Duration::from_secs(30));
        let h = handshake(b"o1");
        agent.add(h.clone());

        assert!(agent.resolve(h.clone()));
        let event = rx.recv().await.unwrap();
        assert!(event.success);
        assert_eq!(event.handshake, h);

        // re-registered with a fresh timer bounding the transfer
        assert_eq!(agent.find(&h.order_hash), Some(h.clone()));
        tokio::time::sleep(Duration::from_secs(31)).await;
        let event = rx.recv().await.unwrap();
        assert!(!event.success);
        assert_eq!(event.handshake, h);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_wait_can_be_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = HandshakeAgent::new(tx, Duration::from_secs(30));
        let h = handshake(b"o1");
        agent.add(h.clone());
        assert!(agent.resolve(h.clone()));
        let _ = rx.recv().await.unwrap();

        // transfer confirmed before the timer fired
        assert_eq!(agent.cancel_wait(&h.order_hash), Some(h));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_without_pending_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = HandshakeAgent::new(tx, Duration::from_secs(30));

        assert!(!agent.resolve(handshake(b"o1")));
        assert!(rx.try_recv().is_err());
    }
}
