//! Node lifecycle: wire a registry to its transport, bootstrap, open.

use replistate_common::{NodeId, Role};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bootstrap::bootstrap;
use crate::config::SyncConfig;
use crate::dispatcher::ActionDispatcher;
use crate::error::{Result, SyncError};
use crate::registry::Registry;
use crate::transport::{Channels, Inbound};

/// One authority or replica process
pub struct StateNode {
    registry: Registry,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl StateNode {
    pub fn new(role: Role, node_id: NodeId, settings: SyncConfig, channels: Channels) -> Self {
        let registry = Registry::new(role, node_id, settings, channels.rpc, channels.broadcast);
        Self {
            registry,
            inbound: Some(channels.inbound),
            dispatcher: None,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn role(&self) -> Role {
        self.registry.role()
    }

    pub fn node_id(&self) -> NodeId {
        self.registry.node_id()
    }

    /// Bootstrap (replicas), start dispatching, then open the barrier.
    ///
    /// Inbound traffic queued before this point is kept and handled in order
    /// once the dispatcher runs.
    pub async fn start(&mut self) -> Result<()> {
        let inbound = self
            .inbound
            .take()
            .ok_or_else(|| SyncError::Other("node already started".to_string()))?;

        info!(
            role = %self.registry.role(),
            node_id = %self.registry.node_id(),
            "Starting state node"
        );

        if let Err(e) = bootstrap(&self.registry).await {
            self.inbound = Some(inbound);
            return Err(e);
        }

        let dispatcher = ActionDispatcher::new(self.registry.clone());
        self.dispatcher = Some(dispatcher.spawn(inbound));
        self.registry.barrier().open();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop dispatching inbound traffic
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
            info!(node_id = %self.registry.node_id(), "State node stopped");
        }
    }
}

impl Drop for StateNode {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}
