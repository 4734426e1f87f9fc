//! # Change Notifier
//!
//! Every mutation is announced by the process that owns the state's
//! notifications: the authority for authority-owned states, every replica
//! for replica-owned states, and always the local process for non-replicated
//! states. Listeners in the owning process are reached on the local bus;
//! listeners registered from the other role are reached with one
//! `__Changed__` broadcast. No listeners means no traffic at all.

use replistate_common::{
    Action, AddListenerRequest, ChangeEvent, GlobalListenerId, ListenerRef, RemoveListenerRequest,
    ReplyBody, Role, StateProperties,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::ChangeCallback;
use crate::error::{Result, SyncError};
use crate::registry::Registry;
use crate::replication::unexpected_reply;
use crate::state::StateEntry;
use crate::transport::Peer;

/// Channels a single mutation must be announced on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Route {
    pub local: bool,
    pub global: bool,
}

impl Route {
    pub fn is_silent(&self) -> bool {
        !self.local && !self.global
    }
}

pub struct ChangeNotifier;

impl ChangeNotifier {
    /// Decide how a mutation observed by `role` is announced
    pub fn route(
        properties: &StateProperties,
        role: Role,
        local_listeners: usize,
        global_listeners: usize,
    ) -> Route {
        let owner_side = !properties.replicated || properties.owner == role;
        if !owner_side {
            return Route::default();
        }
        Route {
            local: local_listeners > 0,
            global: properties.replicated && global_listeners > 0,
        }
    }

    /// Where listeners of the other role register for a state
    pub fn owner_peer(properties: &StateProperties) -> Peer {
        match properties.owner {
            Role::Authority => Peer::Authority,
            Role::Replica => Peer::Node(properties.origin),
        }
    }
}

struct RemoteRegistration {
    owner: Peer,
    handle: GlobalListenerId,
}

/// Handle returned by `State::changed`
pub struct Subscription {
    registry: Registry,
    state_id: String,
    token: replistate_common::ListenerToken,
    remote: Option<RemoteRegistration>,
    connected: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("state_id", &self.state_id)
            .field("token", &self.token)
            .field("global", &self.remote.is_some())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Subscription {
    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the callback is reached over the network
    pub fn is_global(&self) -> bool {
        self.remote.is_some()
    }

    /// Stop receiving changes. Calling this more than once is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.registry
            .core
            .bus
            .unsubscribe(&self.state_id, self.token);

        let Some(remote) = &self.remote else {
            if let Some(entry) = self.registry.entry(&self.state_id) {
                entry.local_listeners.remove(&self.token);
            }
            debug!(state_id = %self.state_id, token = self.token, "Local listener removed");
            return Ok(());
        };

        let request = Action::RemoveGlobalListener(RemoveListenerRequest {
            id: self.state_id.clone(),
            listener: remote.handle,
        });
        match self.registry.request(remote.owner, request).await? {
            ReplyBody::ListenerRemoved { removed } => {
                if !removed {
                    warn!(state_id = %self.state_id, handle = %remote.handle, "Owner had no such global listener");
                }
                debug!(state_id = %self.state_id, handle = %remote.handle, "Global listener removed");
                Ok(())
            }
            other => Err(unexpected_reply("removeGlobalListenerAsync", &other)),
        }
    }
}

impl Registry {
    /// Announce a mutation that has just been applied to `entry`
    pub(crate) async fn notify(&self, entry: &StateEntry, event: ChangeEvent) {
        let route = ChangeNotifier::route(
            &entry.properties,
            self.core.role,
            entry.local_listeners.len(),
            entry.global_listeners.len(),
        );
        if route.is_silent() {
            return;
        }

        if route.local {
            self.core.bus.publish(&event.id, &event);
            self.core.stats.record_local_fire();
        }
        if route.global {
            self.core.stats.record_global_fire();
            self.broadcast(entry.properties.owner.opposite(), Action::Changed(event))
                .await;
        }
    }

    /// Register a change callback on this process, and with the owner when
    /// this process is not the one announcing changes
    pub(crate) async fn subscribe(
        &self,
        entry: &Arc<StateEntry>,
        callback: ChangeCallback,
    ) -> Result<Subscription> {
        let id = entry.properties.id.clone();
        let token = self.core.bus.subscribe(&id, callback);

        if entry.is_owner_side(self.core.role) {
            entry.local_listeners.insert(token);
            return Ok(Subscription {
                registry: self.clone(),
                state_id: id,
                token,
                remote: None,
                connected: AtomicBool::new(true),
            });
        }

        let owner = ChangeNotifier::owner_peer(&entry.properties);
        let request = Action::AddGlobalListener(AddListenerRequest {
            id: id.clone(),
            listener: ListenerRef {
                node: self.core.node_id,
                token,
            },
        });

        let handle = match self.request(owner, request).await {
            Ok(ReplyBody::ListenerAdded { listener }) => listener,
            Ok(other) => {
                self.core.bus.unsubscribe(&id, token);
                return Err(unexpected_reply("addGlobalListenerAsync", &other));
            }
            Err(e) => {
                self.core.bus.unsubscribe(&id, token);
                return Err(e);
            }
        };

        info!(state_id = %id, owner = %owner, handle = %handle, "Global listener registered");
        Ok(Subscription {
            registry: self.clone(),
            state_id: id,
            token,
            remote: Some(RemoteRegistration { owner, handle }),
            connected: AtomicBool::new(true),
        })
    }

    /// Owner side of `addGlobalListenerAsync`
    pub(crate) fn add_global_listener(&self, request: AddListenerRequest) -> Result<GlobalListenerId> {
        let entry = self
            .entry(&request.id)
            .ok_or_else(|| SyncError::NotFound(request.id.clone()))?;

        let handle = GlobalListenerId::new();
        entry.global_listeners.insert(handle, request.listener);
        debug!(
            state_id = %request.id,
            node = %request.listener.node,
            handle = %handle,
            "Global listener added"
        );
        Ok(handle)
    }

    /// Owner side of `removeGlobalListenerAsync`
    pub(crate) fn remove_global_listener(&self, request: RemoveListenerRequest) -> Result<bool> {
        let entry = self
            .entry(&request.id)
            .ok_or_else(|| SyncError::NotFound(request.id.clone()))?;
        Ok(entry.global_listeners.remove(&request.listener).is_some())
    }

    /// Hand a `__Changed__` event from the owner to this process's listeners
    pub(crate) fn deliver_remote_change(&self, event: &ChangeEvent) -> usize {
        self.core.bus.publish(&event.id, event)
    }
}
