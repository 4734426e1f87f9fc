//! Message vocabulary exchanged between authority and replicas.
//!
//! Every message is a JSON [`Envelope`]. The action set is closed: a name
//! that does not map to an [`ActionKind`] is rejected with
//! [`ProtocolError::UnknownAction`] before any payload is interpreted.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{
    AddListenerRequest, ChangeEvent, GlobalListenerId, NodeId, RemoveListenerRequest, Role,
    SetRequest, StateSnapshot,
};

/// Errors raised while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Name-only view of [`Action`], matched exhaustively by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    StateCreate,
    StateSet,
    GetCurrentReplicated,
    AddGlobalListener,
    RemoveGlobalListener,
    Changed,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::StateCreate,
        ActionKind::StateSet,
        ActionKind::GetCurrentReplicated,
        ActionKind::AddGlobalListener,
        ActionKind::RemoveGlobalListener,
        ActionKind::Changed,
    ];

    /// Protocol identifier used on the wire
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::StateCreate => "_stateCreateAsync",
            ActionKind::StateSet => "_stateSetAsync",
            ActionKind::GetCurrentReplicated => "_getCurrentReplicated",
            ActionKind::AddGlobalListener => "addGlobalListenerAsync",
            ActionKind::RemoveGlobalListener => "removeGlobalListenerAsync",
            ActionKind::Changed => "__Changed__",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A protocol action with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum Action {
    #[serde(rename = "_stateCreateAsync")]
    StateCreate(StateSnapshot),
    #[serde(rename = "_stateSetAsync")]
    StateSet(SetRequest),
    #[serde(rename = "_getCurrentReplicated")]
    GetCurrentReplicated,
    #[serde(rename = "addGlobalListenerAsync")]
    AddGlobalListener(AddListenerRequest),
    #[serde(rename = "removeGlobalListenerAsync")]
    RemoveGlobalListener(RemoveListenerRequest),
    #[serde(rename = "__Changed__")]
    Changed(ChangeEvent),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::StateCreate(_) => ActionKind::StateCreate,
            Action::StateSet(_) => ActionKind::StateSet,
            Action::GetCurrentReplicated => ActionKind::GetCurrentReplicated,
            Action::AddGlobalListener(_) => ActionKind::AddGlobalListener,
            Action::RemoveGlobalListener(_) => ActionKind::RemoveGlobalListener,
            Action::Changed(_) => ActionKind::Changed,
        }
    }

    /// Id of the state this action addresses, if any
    pub fn state_id(&self) -> Option<&str> {
        match self {
            Action::StateCreate(snapshot) => Some(&snapshot.properties.id),
            Action::StateSet(request) => Some(&request.id),
            Action::GetCurrentReplicated => None,
            Action::AddGlobalListener(request) => Some(&request.id),
            Action::RemoveGlobalListener(request) => Some(&request.id),
            Action::Changed(event) => Some(&event.id),
        }
    }
}

/// Wire envelope carrying sender identity and the action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub role: Role,
    pub action: Action,
}

impl Envelope {
    pub fn new(from: NodeId, role: Role, action: Action) -> Self {
        Self { from, role, action }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope, separating unknown actions from malformed payloads
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;

        let name = raw
            .get("action")
            .and_then(|action| action.get("name"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing action name".to_string()))?;

        if ActionKind::from_name(name).is_none() {
            return Err(ProtocolError::UnknownAction(name.to_string()));
        }

        serde_json::from_value(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Successful RPC reply bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Created { revision: u64 },
    Value { value: serde_json::Value, revision: u64 },
    Snapshot { states: Vec<StateSnapshot> },
    ListenerAdded { listener: GlobalListenerId },
    ListenerRemoved { removed: bool },
    Ack,
}

/// Failure classes reported back to an RPC caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    UnknownAction,
    NotFound,
    Malformed,
    Internal,
}

/// Error carried in a failure reply
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for RemoteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownAction(name) => RemoteError::new(ErrorKind::UnknownAction, name),
            other => RemoteError::new(ErrorKind::Malformed, other.to_string()),
        }
    }
}

/// Reply to any RPC request
pub type RpcResult = Result<ReplyBody, RemoteError>;

pub fn encode_reply(reply: &RpcResult) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(reply)?)
}

pub fn decode_reply(bytes: &[u8]) -> Result<RpcResult, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}
