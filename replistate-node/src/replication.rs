// Replication / mutation protocol
//
// Authority side: apply, broadcast to replicas, notify, all under the
// per-state write gate so replicas see mutations in apply order.
// Replica side: forward to the authority, then wait for the broadcast to
// land in the local mirror. Mirrors only move forward in revision.

use replistate_common::{
    Action, ChangeEvent, ReplyBody, Role, SetRequest, StateProperties, StateSnapshot, Variables,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::AccessControl;
use crate::error::{Result, SyncError};
use crate::registry::Registry;
use crate::state::{State, StateEntry};
use crate::transport::Peer;

pub(crate) fn unexpected_reply(action: &str, reply: &ReplyBody) -> SyncError {
    SyncError::Protocol(format!("unexpected reply to {}: {:?}", action, reply))
}

impl Registry {
    /// Write to a non-replicated state
    pub(crate) async fn apply_local(&self, entry: &StateEntry, key: String, value: Value) -> Value {
        let _gate = entry.write_gate.lock().await;
        let previous = entry.apply(&key, value.clone(), 0);
        self.core.stats.record_local_set();

        self.notify(
            entry,
            ChangeEvent {
                id: entry.properties.id.clone(),
                key,
                previous,
                new: value.clone(),
            },
        )
        .await;
        value
    }

    /// Create the canonical copy and announce it to every replica
    pub(crate) async fn authority_create(
        &self,
        properties: StateProperties,
        variables: Variables,
    ) -> (Arc<StateEntry>, u64) {
        let _gate = self.core.create_gate.lock().await;

        // Writes already holding the replaced entry finish (and broadcast)
        // before the new entry takes over.
        let replaced = self.entry(&properties.id);
        let _replaced_gate = match &replaced {
            Some(previous) => Some(previous.write_gate.lock().await),
            None => None,
        };

        let revision = self.next_revision();
        let snapshot = StateSnapshot {
            properties,
            variables,
            revision,
        };

        let entry = self.insert_entry(snapshot.clone());
        info!(
            state_id = %entry.properties.id,
            owner = %entry.properties.owner,
            revision,
            "Replicated state created"
        );

        self.broadcast(Role::Replica, Action::StateCreate(snapshot))
            .await;
        (entry, revision)
    }

    /// Apply an accepted write on the authority
    pub(crate) async fn authority_set(
        &self,
        entry: &Arc<StateEntry>,
        key: String,
        value: Value,
    ) -> (Value, u64) {
        let mut entry = entry.clone();
        loop {
            let gate = entry.write_gate.lock().await;
            match self.entry(&entry.properties.id) {
                Some(current) if !Arc::ptr_eq(&current, &entry) => {
                    // Overwritten while we waited for the gate.
                    drop(gate);
                    entry = current;
                }
                _ => {
                    let result = self.authority_apply(&entry, key, value).await;
                    drop(gate);
                    return result;
                }
            }
        }
    }

    /// Apply, broadcast and notify; the caller holds the entry's write gate
    async fn authority_apply(&self, entry: &StateEntry, key: String, value: Value) -> (Value, u64) {
        let revision = self.next_revision();
        let previous = entry.apply(&key, value.clone(), revision);
        self.core.stats.record_authority_set();

        // Replicas get the new value before any `__Changed__` for it, so a
        // non-owner listener never observes a stale mirror.
        self.broadcast(
            Role::Replica,
            Action::StateSet(SetRequest {
                id: entry.properties.id.clone(),
                key: key.clone(),
                value: value.clone(),
                revision,
            }),
        )
        .await;

        self.notify(
            entry,
            ChangeEvent {
                id: entry.properties.id.clone(),
                key,
                previous,
                new: value.clone(),
            },
        )
        .await;

        (value, revision)
    }

    /// Ask the authority to create a replicated state
    pub(crate) async fn replica_create(
        &self,
        properties: StateProperties,
        variables: Variables,
    ) -> Result<State> {
        let id = properties.id.clone();
        let request = Action::StateCreate(StateSnapshot {
            properties,
            variables,
            revision: 0,
        });

        let revision = match self.request(Peer::Authority, request).await? {
            ReplyBody::Created { revision } => revision,
            other => return Err(unexpected_reply("_stateCreateAsync", &other)),
        };

        self.wait_for_revision(&id, revision).await?;
        self.entry(&id)
            .map(|entry| State::new(self.clone(), entry))
            .ok_or(SyncError::NotFound(id))
    }

    /// Ask the authority to accept a write
    pub(crate) async fn replica_set(
        &self,
        entry: &StateEntry,
        key: String,
        value: Value,
    ) -> Result<Value> {
        // Fail fast; the authority checks again.
        AccessControl::check_write(&entry.properties, Role::Replica)?;

        let id = entry.properties.id.clone();
        let request = Action::StateSet(SetRequest {
            id: id.clone(),
            key,
            value,
            revision: 0,
        });

        let reply = self.request(Peer::Authority, request).await.map_err(|e| {
            if matches!(e, SyncError::Transport(_) | SyncError::Timeout(_)) {
                warn!(state_id = %id, error = %e, "Replicated set failed");
            }
            e
        })?;

        match reply {
            ReplyBody::Value { value, revision } => {
                self.wait_for_revision(&id, revision).await?;
                Ok(value)
            }
            other => Err(unexpected_reply("_stateSetAsync", &other)),
        }
    }

    /// Mirror a created state received from the authority (broadcast or bootstrap)
    pub(crate) fn mirror_create(&self, snapshot: StateSnapshot) -> bool {
        if let Some(existing) = self.entry(&snapshot.properties.id) {
            if existing.properties.replicated && existing.revision() >= snapshot.revision {
                debug!(state_id = %snapshot.properties.id, revision = snapshot.revision, "Ignoring stale create");
                self.core.stats.record_stale();
                return false;
            }
        }

        let revision = snapshot.revision;
        let entry = self.insert_entry(snapshot);
        debug!(state_id = %entry.properties.id, revision, "Mirrored state");
        self.core.stats.record_mirrored();
        self.mark_applied(revision);
        true
    }

    /// Mirror a write accepted by the authority
    pub(crate) async fn mirror_set(&self, request: SetRequest) -> Result<bool> {
        let entry = self
            .entry(&request.id)
            .ok_or_else(|| SyncError::NotFound(request.id.clone()))?;

        {
            let _gate = entry.write_gate.lock().await;
            if request.revision <= entry.revision() {
                debug!(state_id = %request.id, revision = request.revision, "Ignoring stale set");
                self.core.stats.record_stale();
                return Ok(false);
            }

            let previous = entry.apply(&request.key, request.value.clone(), request.revision);
            self.core.stats.record_mirrored();

            self.notify(
                &entry,
                ChangeEvent {
                    id: request.id,
                    key: request.key,
                    previous,
                    new: request.value,
                },
            )
            .await;
        }

        self.mark_applied(request.revision);
        Ok(true)
    }
}
