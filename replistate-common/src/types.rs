// Core data model shared by every process taking part in replication.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a single process on the transport
pub type NodeId = Uuid;

/// Variables stored in a state, keyed by name
pub type Variables = HashMap<String, serde_json::Value>;

/// Role a process plays in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Holds the canonical copy of every replicated state
    #[serde(alias = "authority")]
    Authority,
    /// Mirrors authority state and forwards mutation requests
    #[serde(alias = "replica")]
    Replica,
}

impl Role {
    /// The role on the other side of the wire
    pub fn opposite(self) -> Self {
        match self {
            Role::Authority => Role::Replica,
            Role::Replica => Role::Authority,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Authority => "authority",
            Role::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a state, fixed when it is first created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProperties {
    /// Unique state identifier
    pub id: String,
    /// Whether the state is visible to the other role
    pub replicated: bool,
    /// Replicas may not mutate this state
    pub client_read_only: bool,
    /// Role that first created the state
    pub owner: Role,
    /// Node that first created the state
    pub origin: NodeId,
}

impl StateProperties {
    /// Local, writable state. Owner and origin are stamped by the registry on create.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            replicated: false,
            client_read_only: false,
            owner: Role::Authority,
            origin: Uuid::nil(),
        }
    }

    pub fn replicated(mut self, replicated: bool) -> Self {
        self.replicated = replicated;
        self
    }

    pub fn client_read_only(mut self, read_only: bool) -> Self {
        self.client_read_only = read_only;
        self
    }
}

/// A state's properties together with its variables, as exchanged on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub properties: StateProperties,
    pub variables: Variables,
    /// Authority revision of the last accepted mutation (0 on requests)
    #[serde(default)]
    pub revision: u64,
}

/// Payload of `_stateSetAsync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub id: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub revision: u64,
}

/// A single variable mutation as seen by listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub key: String,
    /// `None` when the key did not exist before
    pub previous: Option<serde_json::Value>,
    pub new: serde_json::Value,
}

/// Process-local slot of a callback on the local bus
pub type ListenerToken = u64;

/// Stable handle the owner assigns to a global listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalListenerId(pub Uuid);

impl GlobalListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GlobalListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GlobalListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Network reference to a callback living on a non-owner process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRef {
    pub node: NodeId,
    pub token: ListenerToken,
}

/// Payload of `addGlobalListenerAsync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddListenerRequest {
    pub id: String,
    pub listener: ListenerRef,
}

/// Payload of `removeGlobalListenerAsync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveListenerRequest {
    pub id: String,
    pub listener: GlobalListenerId,
}
