use anyhow::{Context, Result};
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use replistate_common::{NodeId, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{BroadcastChannel, Channels, Inbound, Peer, RpcChannel, TransportError};
use crate::config::NatsConfig;

/// Subject layout for one deployment
#[derive(Debug, Clone)]
struct Subjects {
    prefix: String,
}

impl Subjects {
    fn rpc(&self, peer: Peer) -> String {
        match peer {
            Peer::Authority => format!("{}.rpc.authority", self.prefix),
            Peer::Node(id) => format!("{}.rpc.node.{}", self.prefix, id),
        }
    }

    fn broadcast(&self, role: Role) -> String {
        format!("{}.broadcast.{}", self.prefix, role.as_str())
    }
}

/// NATS-backed RPC and broadcast channels
///
/// RPC maps onto NATS request/reply, broadcasts onto plain publish. Every
/// process listens on its own RPC subject and on the broadcast subject of
/// its role.
#[derive(Clone)]
pub struct NatsTransport {
    client: Client,
    subjects: Subjects,
}

impl NatsTransport {
    /// Connect and start forwarding inbound traffic for this node
    pub async fn connect(config: &NatsConfig, role: Role, node_id: NodeId) -> Result<Channels> {
        info!(nats_url = %config.server_url, node_id = %node_id, role = %role, "Connecting to NATS server");

        let options = ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|attempts| {
                if attempts < 10 {
                    Duration::from_millis(200 * attempts as u64)
                } else {
                    Duration::from_secs(10)
                }
            });

        let client = async_nats::connect_with_options(config.server_url.as_str(), options)
            .await
            .context("Failed to connect to NATS server")?;

        info!("Successfully connected to NATS server");

        let transport = Self {
            client,
            subjects: Subjects {
                prefix: config.subject_prefix.clone(),
            },
        };

        let rpc_subject = match role {
            Role::Authority => transport.subjects.rpc(Peer::Authority),
            Role::Replica => transport.subjects.rpc(Peer::Node(node_id)),
        };
        let broadcast_subject = transport.subjects.broadcast(role);

        let (tx, inbound) = mpsc::unbounded_channel();
        for subject in [rpc_subject, broadcast_subject] {
            let subscriber = transport
                .client
                .subscribe(subject.clone())
                .await
                .with_context(|| format!("Failed to subscribe to {}", subject))?;
            info!(subject = %subject, "Listening for replication traffic");
            transport.spawn_forwarder(subscriber, tx.clone());
        }

        let transport = Arc::new(transport);
        Ok(Channels {
            rpc: transport.clone(),
            broadcast: transport,
            inbound,
        })
    }

    /// Push every message of a subscription into the inbound queue and
    /// publish the dispatcher's answer to the reply subject.
    fn spawn_forwarder(&self, mut subscriber: Subscriber, tx: mpsc::UnboundedSender<Inbound>) {
        let client = self.client.clone();

        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let payload = message.payload.to_vec();

                let Some(reply_subject) = message.reply.clone() else {
                    if tx.send(Inbound::broadcast(payload)).is_err() {
                        break;
                    }
                    continue;
                };

                let (inbound, reply) = Inbound::request(payload);
                if tx.send(inbound).is_err() {
                    break;
                }

                let client = client.clone();
                tokio::spawn(async move {
                    match reply.await {
                        Ok(bytes) => {
                            if let Err(e) = client.publish(reply_subject, bytes.into()).await {
                                warn!(error = %e, "Failed to publish RPC reply");
                            }
                        }
                        Err(_) => debug!("Dispatcher dropped RPC without replying"),
                    }
                });
            }
            debug!("NATS subscription closed");
        });
    }
}

#[async_trait]
impl RpcChannel for NatsTransport {
    async fn request(&self, to: Peer, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let message = self
            .client
            .request(self.subjects.rpc(to), payload.into())
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(message.payload.to_vec())
    }
}

#[async_trait]
impl BroadcastChannel for NatsTransport {
    async fn broadcast(&self, to: Role, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(self.subjects.broadcast(to), payload.into())
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}
