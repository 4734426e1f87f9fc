// replistate common - wire types shared between authority and replica nodes
//
// Kept free of any runtime dependency so that transports, tools and nodes
// can all speak the same protocol.

pub mod protocol;
pub mod types;

pub use protocol::{
    decode_reply, encode_reply, Action, ActionKind, Envelope, ErrorKind, ProtocolError,
    RemoteError, ReplyBody, RpcResult,
};
pub use types::{
    AddListenerRequest, ChangeEvent, GlobalListenerId, ListenerRef, ListenerToken, NodeId,
    RemoveListenerRequest, Role, SetRequest, StateProperties, StateSnapshot, Variables,
};
