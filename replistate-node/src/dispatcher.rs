//! # Action Dispatcher
//!
//! Drains the node's inbound queue once the initialization barrier opens.
//! Each message is decoded, run past the access policies, and routed to
//! the registry. RPC requests always get a reply, including a failure reply
//! for actions this node does not know.

use replistate_common::{
    encode_reply, Action, Envelope, RemoteError, ReplyBody, Role, RpcResult, StateProperties,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::access::{default_policies, AccessPolicy};
use crate::error::{Result, SyncError};
use crate::registry::Registry;
use crate::transport::Inbound;

pub struct ActionDispatcher {
    registry: Registry,
    policies: Vec<Box<dyn AccessPolicy>>,
}

impl ActionDispatcher {
    pub fn new(registry: Registry) -> Self {
        Self::with_policies(registry, default_policies())
    }

    pub fn with_policies(registry: Registry, policies: Vec<Box<dyn AccessPolicy>>) -> Self {
        Self { registry, policies }
    }

    /// Run the dispatch loop on its own task
    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    /// Process inbound messages in arrival order until every sender is gone
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        self.registry.barrier().wait().await;
        info!(role = %self.registry.role(), "Action dispatcher started");

        while let Some(message) = inbound.recv().await {
            let result = self.dispatch(&message.payload).await;

            match message.responder {
                Some(responder) => {
                    let bytes = match encode_reply(&result) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode reply");
                            continue;
                        }
                    };
                    if responder.send(bytes).is_err() {
                        debug!("Requester went away before the reply");
                    }
                }
                None => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to apply broadcast");
                    }
                }
            }
        }

        info!("Action dispatcher stopped");
    }

    /// Handle one encoded envelope
    #[instrument(skip(self, payload), fields(role = %self.registry.role()))]
    pub async fn dispatch(&self, payload: &[u8]) -> RpcResult {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.registry.core.stats.record_rejected();
                warn!(error = %e, "Rejected inbound message");
                return Err(RemoteError::from(e));
            }
        };

        let kind = envelope.action.kind();
        let target: Option<StateProperties> = envelope
            .action
            .state_id()
            .and_then(|id| self.registry.entry(id))
            .map(|entry| entry.properties.clone());

        let sender = self.sender_role(&envelope);
        for policy in &self.policies {
            if let Err(e) = policy.authorize(
                self.registry.role(),
                sender,
                &envelope.action,
                target.as_ref(),
            ) {
                self.registry.core.stats.record_rejected();
                warn!(
                    policy = policy.name(),
                    action = %kind,
                    from = %envelope.from,
                    error = %e,
                    "Action denied"
                );
                return Err(e.to_remote());
            }
        }

        self.registry.core.stats.record_dispatch(kind);
        debug!(action = %kind, from = %envelope.from, "Dispatching action");
        self.handle(envelope.action).await.map_err(|e| e.to_remote())
    }

    /// Role used for access decisions.
    ///
    /// The authority never sends to itself, so everything it receives comes
    /// from a replica whatever the envelope claims.
    fn sender_role(&self, envelope: &Envelope) -> Role {
        match self.registry.role() {
            Role::Authority => {
                if envelope.role != Role::Replica {
                    warn!(from = %envelope.from, claimed = %envelope.role, "Sender claims the authority role");
                }
                Role::Replica
            }
            Role::Replica => envelope.role,
        }
    }

    async fn handle(&self, action: Action) -> Result<ReplyBody> {
        let role = self.registry.role();
        match action {
            Action::StateCreate(snapshot) => match role {
                Role::Authority => {
                    if !snapshot.properties.replicated {
                        return Err(SyncError::Protocol(format!(
                            "state '{}' is not replicated",
                            snapshot.properties.id
                        )));
                    }
                    let (_, revision) = self
                        .registry
                        .authority_create(snapshot.properties, snapshot.variables)
                        .await;
                    Ok(ReplyBody::Created { revision })
                }
                Role::Replica => {
                    self.registry.mirror_create(snapshot);
                    Ok(ReplyBody::Ack)
                }
            },
            Action::StateSet(request) => match role {
                Role::Authority => {
                    let entry = self
                        .registry
                        .entry(&request.id)
                        .ok_or_else(|| SyncError::NotFound(request.id.clone()))?;
                    let (value, revision) = self
                        .registry
                        .authority_set(&entry, request.key, request.value)
                        .await;
                    Ok(ReplyBody::Value { value, revision })
                }
                Role::Replica => {
                    self.registry.mirror_set(request).await?;
                    Ok(ReplyBody::Ack)
                }
            },
            Action::GetCurrentReplicated => Ok(ReplyBody::Snapshot {
                states: self.registry.export_replicated_snapshot().await,
            }),
            Action::AddGlobalListener(request) => Ok(ReplyBody::ListenerAdded {
                listener: self.registry.add_global_listener(request)?,
            }),
            Action::RemoveGlobalListener(request) => Ok(ReplyBody::ListenerRemoved {
                removed: self.registry.remove_global_listener(request)?,
            }),
            Action::Changed(event) => {
                let delivered = self.registry.deliver_remote_change(&event);
                debug!(state_id = %event.id, delivered, "Remote change delivered");
                Ok(ReplyBody::Ack)
            }
        }
    }
}
