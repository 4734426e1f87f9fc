//! Replistate Node Library
//!
//! Named key/value states kept consistent between one authority process and
//! any number of replicas, with process-local states for single-process use
//! and change notifications routed over the local bus or the network.

pub mod access;
pub mod barrier;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod node;
pub mod notifier;
pub mod registry;
mod replication;
pub mod state;
pub mod stats;
pub mod transport;

// Re-export commonly used types
pub use access::{AccessControl, AccessPolicy};
pub use barrier::InitBarrier;
pub use config::{NodeConfig, SyncConfig};
pub use dispatcher::ActionDispatcher;
pub use error::{Result, SyncError};
pub use node::StateNode;
pub use notifier::{ChangeNotifier, Route, Subscription};
pub use registry::Registry;
pub use state::State;
pub use stats::SyncStatsSnapshot;
pub use transport::{Channels, MemoryNetwork, NatsTransport, Peer};

pub use replistate_common::{ChangeEvent, Role, StateProperties, Variables};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let _ = std::any::type_name::<Registry>();
        let _ = std::any::type_name::<StateNode>();
        let _ = std::any::type_name::<Subscription>();
        let _ = std::any::type_name::<ActionDispatcher>();
    }
}
