//! State registry
//!
//! One [`Registry`] exists per node. It owns every [`State`] the process
//! knows about, the transport handles used to mirror replicated operations,
//! the local bus, and the initialization barrier that gates public calls.

use dashmap::DashMap;
use replistate_common::{
    decode_reply, Action, Envelope, NodeId, ReplyBody, Role, StateProperties, StateSnapshot,
    Variables,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::barrier::InitBarrier;
use crate::bus::LocalBus;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::state::{State, StateEntry};
use crate::stats::{SyncStats, SyncStatsSnapshot};
use crate::transport::{BroadcastChannel, Peer, RpcChannel};

pub(crate) struct Core {
    pub(crate) role: Role,
    pub(crate) node_id: NodeId,
    pub(crate) settings: SyncConfig,
    pub(crate) states: DashMap<String, Arc<StateEntry>>,
    pub(crate) rpc: Arc<dyn RpcChannel>,
    pub(crate) broadcast: Arc<dyn BroadcastChannel>,
    pub(crate) bus: LocalBus,
    pub(crate) barrier: InitBarrier,
    pub(crate) stats: SyncStats,
    /// Last revision handed out (authority)
    revision: AtomicU64,
    /// Serializes replicated creation so broadcast order equals insert order
    pub(crate) create_gate: Mutex<()>,
    /// Highest revision mirrored so far (replica); wakes waiters
    applied: watch::Sender<u64>,
}

/// Process-local mapping from state id to state
#[derive(Clone)]
pub struct Registry {
    pub(crate) core: Arc<Core>,
}

impl Registry {
    pub fn new(
        role: Role,
        node_id: NodeId,
        settings: SyncConfig,
        rpc: Arc<dyn RpcChannel>,
        broadcast: Arc<dyn BroadcastChannel>,
    ) -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            core: Arc::new(Core {
                role,
                node_id,
                settings,
                states: DashMap::new(),
                rpc,
                broadcast,
                bus: LocalBus::new(),
                barrier: InitBarrier::new(),
                stats: SyncStats::default(),
                revision: AtomicU64::new(0),
                create_gate: Mutex::new(()),
                applied,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    pub fn barrier(&self) -> &InitBarrier {
        &self.core.barrier
    }

    pub fn is_ready(&self) -> bool {
        self.core.barrier.is_open()
    }

    pub fn len(&self) -> usize {
        self.core.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.states.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.core.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.core.stats.snapshot(self.core.states.len())
    }

    /// Create (or overwrite) a state.
    ///
    /// `owner` and `origin` are stamped from this process. Replicated states
    /// are created on the authority first; on a replica the call returns once
    /// the creation broadcast has been mirrored locally.
    pub async fn create(&self, mut properties: StateProperties, variables: Variables) -> Result<State> {
        self.core.barrier.wait().await;
        properties.owner = self.core.role;
        properties.origin = self.core.node_id;

        if !properties.replicated {
            debug!(state_id = %properties.id, "Creating local state");
            let entry = self.insert_entry(StateSnapshot {
                properties,
                variables,
                revision: 0,
            });
            return Ok(State::new(self.clone(), entry));
        }

        match self.core.role {
            Role::Authority => {
                let (entry, _) = self.authority_create(properties, variables).await;
                Ok(State::new(self.clone(), entry))
            }
            Role::Replica => self.replica_create(properties, variables).await,
        }
    }

    /// Look up a state.
    ///
    /// On a replica, an id that has not mirrored yet is retried until the
    /// configured wait budget runs out; `None` means it never showed up.
    pub async fn get(&self, id: &str) -> Option<State> {
        self.core.barrier.wait().await;
        if let Some(entry) = self.entry(id) {
            return Some(State::new(self.clone(), entry));
        }
        if self.core.role == Role::Authority {
            return None;
        }

        let poll = self.core.settings.poll_interval();
        let deadline = Instant::now() + self.core.settings.get_wait_budget();
        let mut applied = self.core.applied.subscribe();

        loop {
            if let Some(entry) = self.entry(id) {
                return Some(State::new(self.clone(), entry));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(state_id = %id, "State did not appear within wait budget");
                return None;
            }
            // Next mirrored mutation or next poll, whichever comes first
            let _ = tokio::time::timeout(poll.min(deadline - now), applied.changed()).await;
        }
    }

    /// Every replicated state with its current variables.
    ///
    /// Not gated: the dispatcher serves bootstrap requests with it.
    pub async fn export_replicated_snapshot(&self) -> Vec<StateSnapshot> {
        let entries: Vec<Arc<StateEntry>> = self
            .core
            .states
            .iter()
            .filter(|item| item.properties.replicated)
            .map(|item| item.value().clone())
            .collect();

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            let _gate = entry.write_gate.lock().await;
            snapshots.push(entry.snapshot());
        }
        snapshots
    }

    pub(crate) fn entry(&self, id: &str) -> Option<Arc<StateEntry>> {
        self.core.states.get(id).map(|entry| entry.value().clone())
    }

    /// Register an entry, silently replacing any previous one with the same id
    pub(crate) fn insert_entry(&self, snapshot: StateSnapshot) -> Arc<StateEntry> {
        let id = snapshot.properties.id.clone();
        let entry = Arc::new(StateEntry::from_snapshot(snapshot));
        if let Some(previous) = self.entry(&id) {
            entry.adopt_listeners(&previous);
            debug!(state_id = %id, "Overwriting existing state");
        }
        self.core.states.insert(id, entry.clone());
        entry
    }

    pub(crate) fn next_revision(&self) -> u64 {
        self.core.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn mark_applied(&self, revision: u64) {
        self.core
            .applied
            .send_modify(|latest| *latest = (*latest).max(revision));
    }

    /// Wait until the local mirror of `id` holds at least `revision`
    pub(crate) async fn wait_for_revision(&self, id: &str, revision: u64) -> Result<()> {
        let mut applied = self.core.applied.subscribe();
        let caught_up = async {
            loop {
                if self.entry(id).map_or(false, |e| e.revision() >= revision) {
                    return;
                }
                if applied.changed().await.is_err() {
                    return;
                }
            }
        };

        match self.core.settings.rpc_timeout() {
            Some(limit) => tokio::time::timeout(limit, caught_up).await.map_err(|_| {
                SyncError::Timeout(format!(
                    "mirror of '{}' did not reach revision {}",
                    id, revision
                ))
            }),
            None => {
                caught_up.await;
                Ok(())
            }
        }
    }

    /// RPC with the configured timeout
    pub(crate) async fn request(&self, to: Peer, action: Action) -> Result<ReplyBody> {
        self.request_with_timeout(to, action, self.core.settings.rpc_timeout())
            .await
    }

    pub(crate) async fn request_with_timeout(
        &self,
        to: Peer,
        action: Action,
        limit: Option<Duration>,
    ) -> Result<ReplyBody> {
        let kind = action.kind();
        let payload = Envelope::new(self.core.node_id, self.core.role, action).encode()?;
        self.core.stats.record_rpc(kind);

        let call = self.core.rpc.request(to, payload);
        let outcome = match limit {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(format!("{} to {}", kind, to))),
            },
            None => call.await.map_err(SyncError::from),
        };

        let reply = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                self.core.stats.record_rpc_failure(kind);
                return Err(e);
            }
        };
        Ok(decode_reply(&reply)??)
    }

    /// Fire-and-forget send to every process of `to`
    pub(crate) async fn broadcast(&self, to: Role, action: Action) {
        let kind = action.kind();
        let payload = match Envelope::new(self.core.node_id, self.core.role, action).encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, action = %kind, "Failed to encode broadcast");
                return;
            }
        };

        match self.core.broadcast.broadcast(to, payload).await {
            Ok(()) => self.core.stats.record_broadcast(kind),
            Err(e) => {
                self.core.stats.record_broadcast_failure(kind);
                warn!(error = %e, action = %kind, to = %to, "Broadcast failed");
            }
        }
    }
}
