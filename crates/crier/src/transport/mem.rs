//! In-process transport: a hub routing messages between registered
//! participants over their inbound queues. This is what the integration
//! tests run on; it can partition pairs, drop whole servers, and inject
//! synthetic tuples, while honoring the per-pair FIFO contract.

use super::Transport;
use crate::message::{Message, ServerId};
use crate::queue::QueueSender;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HubInner {
    peers: HashMap<ServerId, QueueSender>,
    /// Unordered pairs which cannot currently reach each other.
    cut: HashSet<(ServerId, ServerId)>,
}

fn pair(a: &ServerId, b: &ServerId) -> (ServerId, ServerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// The shared routing fabric. Clone-cheap.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub::default()
    }

    /// Attach a participant's inbound queue under `id`, replacing any
    /// prior registration (a restarted server re-registers).
    pub fn register(&self, id: ServerId, queue: QueueSender) {
        self.inner.lock().unwrap().peers.insert(id, queue);
    }

    /// Detach `id`, as a crash would: peers discover it on their next send.
    pub fn deregister(&self, id: &ServerId) {
        self.inner.lock().unwrap().peers.remove(id);
    }

    /// Sever the pair (a, b) in both directions.
    pub fn partition(&self, a: &ServerId, b: &ServerId) {
        self.inner.lock().unwrap().cut.insert(pair(a, b));
    }

    pub fn heal(&self, a: &ServerId, b: &ServerId) {
        self.inner.lock().unwrap().cut.remove(&pair(a, b));
    }

    /// Deliver a synthetic go-back to `id`, as the oracle would.
    pub async fn inject_go_back(&self, id: &ServerId) {
        let queue = self.inner.lock().unwrap().peers.get(id).cloned();
        if let Some(queue) = queue {
            queue.go_back().await;
        }
    }

    /// A [`Transport`] endpoint which sends on behalf of `id`.
    pub fn endpoint(&self, id: ServerId) -> MemTransport {
        MemTransport {
            id,
            inner: self.inner.clone(),
        }
    }
}

pub struct MemTransport {
    id: ServerId,
    inner: Arc<Mutex<HubInner>>,
}

#[async_trait::async_trait]
impl Transport for MemTransport {
    async fn send(&self, to: &ServerId, message: Message) {
        let (target, echo) = {
            let inner = self.inner.lock().unwrap();
            if inner.cut.contains(&pair(&self.id, to)) {
                (None, inner.peers.get(&self.id).cloned())
            } else {
                match inner.peers.get(to) {
                    Some(queue) => (Some(queue.clone()), None),
                    None => (None, inner.peers.get(&self.id).cloned()),
                }
            }
        };

        match target {
            Some(queue) => queue.message(self.id.clone(), message).await,
            None => {
                tracing::trace!(from = %self.id, to = %to, kind = message.kind(), "dropping unroutable message");
                // The connection is down: surface it to the sender the way
                // a broken socket would.
                if let Some(echo) = echo {
                    echo.disconnected(to.clone()).await;
                }
            }
        }
    }

    async fn clear(&self, peer: &ServerId) {
        // No connection state to tear down; the hub routes per send.
        tracing::trace!(from = %self.id, peer = %peer, "cleared peer");
    }
}
