//! In-process transport connecting any number of nodes.
//!
//! Every node gets an unbounded FIFO inbox, so broadcasts keep send order
//! per receiver. Nodes can be partitioned to simulate failures and the
//! network counts every delivered message.

use async_trait::async_trait;
use dashmap::DashMap;
use replistate_common::{NodeId, Role};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BroadcastChannel, Channels, Inbound, Peer, RpcChannel, TransportError};

struct PeerSlot {
    role: Role,
    inbox: mpsc::UnboundedSender<Inbound>,
    reachable: AtomicBool,
}

#[derive(Default)]
struct NetworkInner {
    peers: DashMap<NodeId, PeerSlot>,
    delivered: AtomicU64,
}

/// Shared in-memory network hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and return its channels
    pub fn join(&self, role: Role, node_id: NodeId) -> Channels {
        let (inbox, inbound) = mpsc::unbounded_channel();
        self.inner.peers.insert(
            node_id,
            PeerSlot {
                role,
                inbox,
                reachable: AtomicBool::new(true),
            },
        );
        debug!(node_id = %node_id, role = %role, "Node joined memory network");

        let endpoint = Arc::new(MemoryEndpoint {
            network: self.clone(),
            node_id,
        });
        Channels {
            rpc: endpoint.clone(),
            broadcast: endpoint,
            inbound,
        }
    }

    /// Stop delivering to and from a node
    pub fn partition(&self, node_id: NodeId) {
        if let Some(slot) = self.inner.peers.get(&node_id) {
            slot.reachable.store(false, Ordering::SeqCst);
        }
    }

    pub fn heal(&self, node_id: NodeId) {
        if let Some(slot) = self.inner.peers.get(&node_id) {
            slot.reachable.store(true, Ordering::SeqCst);
        }
    }

    /// Total messages delivered so far (requests and broadcast copies)
    pub fn traffic(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.inner
            .peers
            .get(node_id)
            .map(|slot| slot.reachable.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn resolve(&self, peer: Peer) -> Option<mpsc::UnboundedSender<Inbound>> {
        let id = match peer {
            Peer::Node(id) => id,
            Peer::Authority => {
                let authority = self
                    .inner
                    .peers
                    .iter()
                    .find(|entry| entry.role == Role::Authority)
                    .map(|entry| *entry.key());
                authority?
            }
        };
        let slot = self.inner.peers.get(&id)?;
        if !slot.reachable.load(Ordering::SeqCst) {
            return None;
        }
        Some(slot.inbox.clone())
    }
}

/// One node's view of the network
struct MemoryEndpoint {
    network: MemoryNetwork,
    node_id: NodeId,
}

#[async_trait]
impl RpcChannel for MemoryEndpoint {
    async fn request(&self, to: Peer, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if !self.network.is_reachable(&self.node_id) {
            return Err(TransportError::Unreachable(to));
        }
        let inbox = self
            .network
            .resolve(to)
            .ok_or(TransportError::Unreachable(to))?;

        let (inbound, reply) = Inbound::request(payload);
        inbox
            .send(inbound)
            .map_err(|_| TransportError::Unreachable(to))?;
        self.network.inner.delivered.fetch_add(1, Ordering::SeqCst);

        reply.await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl BroadcastChannel for MemoryEndpoint {
    async fn broadcast(&self, to: Role, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.network.is_reachable(&self.node_id) {
            return Ok(());
        }
        for entry in self.network.inner.peers.iter() {
            if *entry.key() == self.node_id
                || entry.role != to
                || !entry.reachable.load(Ordering::SeqCst)
            {
                continue;
            }
            if entry.inbox.send(Inbound::broadcast(payload.clone())).is_ok() {
                self.network.inner.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
