// A single named store of variables
//
// `StateEntry` is the registry-owned data. `State` is the cheap handle given
// to callers; it always resolves to the newest entry registered under its id.

use dashmap::{DashMap, DashSet};
use replistate_common::{
    GlobalListenerId, ListenerRef, ListenerToken, Role, StateProperties, StateSnapshot, Variables,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::notifier::Subscription;
use crate::registry::Registry;

pub(crate) struct StateEntry {
    pub(crate) properties: StateProperties,
    variables: DashMap<String, Value>,
    /// Authority revision of the last applied mutation (0 for local states)
    revision: AtomicU64,
    /// Serializes apply, notify and broadcast for this state
    pub(crate) write_gate: Mutex<()>,
    pub(crate) local_listeners: DashSet<ListenerToken>,
    pub(crate) global_listeners: DashMap<GlobalListenerId, ListenerRef>,
}

impl StateEntry {
    pub(crate) fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            properties: snapshot.properties,
            variables: snapshot.variables.into_iter().collect(),
            revision: AtomicU64::new(snapshot.revision),
            write_gate: Mutex::new(()),
            local_listeners: DashSet::new(),
            global_listeners: DashMap::new(),
        }
    }

    /// Carry listener registrations over from an entry being replaced
    pub(crate) fn adopt_listeners(&self, previous: &StateEntry) {
        for token in previous.local_listeners.iter() {
            self.local_listeners.insert(*token);
        }
        for listener in previous.global_listeners.iter() {
            self.global_listeners.insert(*listener.key(), *listener.value());
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.variables.get(key).map(|value| value.clone())
    }

    /// Write one variable and return the previous value
    pub(crate) fn apply(&self, key: &str, value: Value, revision: u64) -> Option<Value> {
        let previous = self.variables.insert(key.to_string(), value);
        if revision > 0 {
            self.revision.store(revision, Ordering::SeqCst);
        }
        previous
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub(crate) fn variables(&self) -> Variables {
        self.variables
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            properties: self.properties.clone(),
            variables: self.variables(),
            revision: self.revision(),
        }
    }

    /// Whether this process computes notifications for the state
    pub(crate) fn is_owner_side(&self, role: Role) -> bool {
        !self.properties.replicated || self.properties.owner == role
    }
}

/// Handle to a registered state
#[derive(Clone)]
pub struct State {
    registry: Registry,
    id: String,
    entry: Arc<StateEntry>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("revision", &self.revision())
            .finish()
    }
}

impl State {
    pub(crate) fn new(registry: Registry, entry: Arc<StateEntry>) -> Self {
        Self {
            registry,
            id: entry.properties.id.clone(),
            entry,
        }
    }

    fn entry(&self) -> Arc<StateEntry> {
        self.registry
            .entry(&self.id)
            .unwrap_or_else(|| self.entry.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> StateProperties {
        self.entry().properties.clone()
    }

    /// Local read; never touches the network
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entry().get(key)
    }

    /// Typed local read
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Copy of every variable
    pub fn variables(&self) -> Variables {
        self.entry().variables()
    }

    pub fn revision(&self) -> u64 {
        self.entry().revision()
    }

    pub fn local_listener_count(&self) -> usize {
        self.entry().local_listeners.len()
    }

    pub fn global_listener_count(&self) -> usize {
        self.entry().global_listeners.len()
    }

    /// Write a variable.
    ///
    /// Local states are written in place. Replicated states go through the
    /// authority; on a replica this returns once the local mirror reflects
    /// the accepted write.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Value> {
        self.registry.barrier().wait().await;
        let (key, value) = (key.into(), value.into());
        let entry = self.entry();

        if !entry.properties.replicated {
            return Ok(self.registry.apply_local(&entry, key, value).await);
        }

        match self.registry.role() {
            Role::Authority => {
                let (value, _) = self.registry.authority_set(&entry, key, value).await;
                Ok(value)
            }
            Role::Replica => self.registry.replica_set(&entry, key, value).await,
        }
    }

    /// Typed write
    pub async fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<Value> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }

    /// Subscribe to every mutation of this state
    pub async fn changed<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&replistate_common::ChangeEvent) + Send + Sync + 'static,
    {
        self.registry.barrier().wait().await;
        self.registry
            .subscribe(&self.entry(), Arc::new(callback))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(replicated: bool, owner: Role) -> StateEntry {
        let mut properties = StateProperties::new("Score").replicated(replicated);
        properties.owner = owner;
        let mut variables = Variables::new();
        variables.insert("points".into(), json!(0));
        StateEntry::from_snapshot(StateSnapshot {
            properties,
            variables,
            revision: 4,
        })
    }

    #[test]
    fn test_apply_returns_previous_and_tracks_revision() {
        let entry = entry(true, Role::Authority);

        assert_eq!(entry.apply("points", json!(10), 5), Some(json!(0)));
        assert_eq!(entry.apply("lives", json!(3), 6), None);
        assert_eq!(entry.get("points"), Some(json!(10)));
        assert_eq!(entry.revision(), 6);

        // Local writes leave the revision alone.
        entry.apply("points", json!(11), 0);
        assert_eq!(entry.revision(), 6);
    }

    #[test]
    fn test_owner_side() {
        assert!(entry(true, Role::Authority).is_owner_side(Role::Authority));
        assert!(!entry(true, Role::Authority).is_owner_side(Role::Replica));
        assert!(entry(false, Role::Authority).is_owner_side(Role::Replica));
    }

    #[test]
    fn test_adopt_listeners_on_overwrite() {
        let old = entry(true, Role::Authority);
        old.local_listeners.insert(1);
        old.global_listeners.insert(
            GlobalListenerId::new(),
            ListenerRef {
                node: uuid::Uuid::new_v4(),
                token: 9,
            },
        );

        let replacement = entry(true, Role::Authority);
        replacement.adopt_listeners(&old);
        assert_eq!(replacement.local_listeners.len(), 1);
        assert_eq!(replacement.global_listeners.len(), 1);
    }

    #[test]
    fn test_snapshot_copies_variables() {
        let entry = entry(true, Role::Authority);
        let snapshot = entry.snapshot();
        entry.apply("points", json!(99), 7);

        assert_eq!(snapshot.variables["points"], json!(0));
        assert_eq!(snapshot.revision, 4);
    }
}
