// Transport collaborators
//
// The node only needs two network primitives:
// - a unicast request/response channel (RPC)
// - a fire-and-forget channel addressed to every process of a role
// Inbound traffic of both kinds arrives on a single ordered queue that the
// dispatcher drains.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use replistate_common::{NodeId, Role};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use memory::MemoryNetwork;
pub use nats::NatsTransport;

/// Errors raised by transport implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Target peer is not connected
    #[error("peer unreachable: {0}")]
    Unreachable(Peer),

    /// The other side went away before replying
    #[error("channel closed before reply")]
    Closed,

    /// Request failed on the wire
    #[error("request failed: {0}")]
    Request(String),

    /// Publish failed on the wire
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Address of an RPC target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// Whichever process currently holds the authority role
    Authority,
    /// A specific node
    Node(NodeId),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Authority => f.write_str("authority"),
            Peer::Node(id) => write!(f, "node {}", id),
        }
    }
}

/// A message delivered to this process
pub struct Inbound {
    /// Encoded envelope
    pub payload: Vec<u8>,
    /// Present for RPC requests, absent for broadcasts
    pub responder: Option<oneshot::Sender<Vec<u8>>>,
}

impl Inbound {
    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self {
            payload,
            responder: None,
        }
    }

    pub fn request(payload: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                responder: Some(tx),
            },
            rx,
        )
    }
}

/// Unicast request/response channel
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send an encoded request and wait for the encoded reply
    async fn request(&self, to: Peer, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// One-to-many fire-and-forget channel
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Deliver to every other process holding `to`. Must not wait for receivers.
    async fn broadcast(&self, to: Role, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Everything a node needs from its transport
pub struct Channels {
    pub rpc: Arc<dyn RpcChannel>,
    pub broadcast: Arc<dyn BroadcastChannel>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}
