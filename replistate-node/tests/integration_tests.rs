//! Integration tests for the replistate node
//!
//! Every scenario runs a real authority and real replicas wired through the
//! in-memory network:
//! - local states stay off the network
//! - replicated creation, mutation and bootstrap
//! - read-only enforcement on both sides
//! - local and cross-role change notification

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use replistate_common::{
    decode_reply, Action, ChangeEvent, Envelope, ErrorKind, Role, SetRequest, StateProperties,
    Variables,
};
use replistate_node::config::SyncConfig;
use replistate_node::transport::{MemoryNetwork, Peer};
use replistate_node::{StateNode, SyncError};

fn test_settings() -> SyncConfig {
    SyncConfig {
        get_wait_budget_ms: 300,
        get_poll_interval_ms: 20,
        bootstrap_timeout_ms: 500,
        rpc_timeout_ms: Some(1_000),
    }
}

fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn node(network: &MemoryNetwork, role: Role) -> StateNode {
    let id = Uuid::new_v4();
    StateNode::new(role, id, test_settings(), network.join(role, id))
}

async fn started(network: &MemoryNetwork, role: Role) -> StateNode {
    let mut node = node(network, role);
    node.start().await.unwrap();
    node
}

/// Poll until `check` holds or a second passes
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

type Seen = Arc<Mutex<Vec<ChangeEvent>>>;

fn recorder() -> (Seen, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &ChangeEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}

fn count(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

#[cfg(test)]
mod local_state_tests {
    use super::*;

    #[tokio::test]
    async fn test_local_set_get_produces_no_traffic() {
        let network = MemoryNetwork::new();
        let _authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;
        let before = network.traffic();

        let registry = replica.registry();
        let state = registry
            .create(StateProperties::new("Hud"), vars(&[("visible", json!(true))]))
            .await
            .unwrap();
        let (seen, callback) = recorder();
        let subscription = state.changed(callback).await.unwrap();

        assert_eq!(state.set("visible", false).await.unwrap(), json!(false));
        assert_eq!(state.get("visible"), Some(json!(false)));
        assert_eq!(
            registry.get("Hud").await.unwrap().get("visible"),
            Some(json!(false))
        );
        assert_eq!(count(&seen), 1);

        subscription.disconnect().await.unwrap();
        assert_eq!(network.traffic(), before);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let state = authority
            .registry()
            .create(StateProperties::new("Hud"), Variables::new())
            .await
            .unwrap();

        assert_eq!(state.get("nothing"), None);
        assert_eq!(state.get_as::<i64>("nothing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_typed_access() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let state = authority
            .registry()
            .create(StateProperties::new("Hud"), Variables::new())
            .await
            .unwrap();

        state.set_as("scores", &vec![3u32, 5, 8]).await.unwrap();
        assert_eq!(
            state.get_as::<Vec<u32>>("scores").unwrap(),
            Some(vec![3, 5, 8])
        );
        assert!(matches!(
            state.get_as::<String>("scores"),
            Err(SyncError::Serialization(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_local_state_matches_last_write(
            writes in proptest::collection::vec((0usize..4, proptest::num::i64::ANY), 1..40)
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let network = MemoryNetwork::new();
                let authority = started(&network, Role::Authority).await;
                let state = authority
                    .registry()
                    .create(StateProperties::new("Scratch"), Variables::new())
                    .await
                    .unwrap();

                let mut model = std::collections::HashMap::new();
                for (key, value) in &writes {
                    let key = format!("k{}", key);
                    state.set(key.clone(), *value).await.unwrap();
                    model.insert(key, json!(value));
                }

                assert_eq!(state.variables(), model);
                assert_eq!(network.traffic(), 0);
            });
        }
    }
}

#[cfg(test)]
mod replication_tests {
    use super::*;

    #[tokio::test]
    async fn test_score_roundtrip_across_replicas() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica_a = started(&network, Role::Replica).await;
        let replica_b = started(&network, Role::Replica).await;

        let score = authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        let (authority_seen, callback) = recorder();
        let _on_authority = score.changed(callback).await.unwrap();

        let on_a = replica_a.registry().get("Score").await.unwrap();
        let on_b = replica_b.registry().get("Score").await.unwrap();
        let (b_seen, callback) = recorder();
        let b_subscription = on_b.changed(callback).await.unwrap();
        assert!(b_subscription.is_global());
        assert_eq!(score.global_listener_count(), 1);

        assert_eq!(on_a.set("points", 10).await.unwrap(), json!(10));

        // The writer reads its own write without waiting.
        assert_eq!(on_a.get("points"), Some(json!(10)));
        assert_eq!(score.get("points"), Some(json!(10)));
        assert!(eventually(|| on_b.get("points") == Some(json!(10))).await);
        assert!(eventually(|| count(&b_seen) == 1).await);

        let event = b_seen.lock().unwrap()[0].clone();
        assert_eq!(event.id, "Score");
        assert_eq!(event.key, "points");
        assert_eq!(event.previous, Some(json!(0)));
        assert_eq!(event.new, json!(10));
        assert_eq!(count(&authority_seen), 1);
    }

    #[tokio::test]
    async fn test_replica_create_goes_through_authority() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let creator = started(&network, Role::Replica).await;
        let other = started(&network, Role::Replica).await;

        let state = creator
            .registry()
            .create(
                StateProperties::new("Lobby").replicated(true),
                vars(&[("players", json!(1))]),
            )
            .await
            .unwrap();

        let properties = state.properties();
        assert_eq!(properties.owner, Role::Replica);
        assert_eq!(properties.origin, creator.node_id());

        let canonical = authority.registry().get("Lobby").await.unwrap();
        assert_eq!(canonical.get("players"), Some(json!(1)));
        assert_eq!(canonical.properties().owner, Role::Replica);

        let mirrored = other.registry().get("Lobby").await.unwrap();
        assert_eq!(mirrored.get("players"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_replica_writes_converge() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replicas = vec![
            started(&network, Role::Replica).await,
            started(&network, Role::Replica).await,
            started(&network, Role::Replica).await,
        ];

        authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();

        let mut writers = Vec::new();
        for (i, replica) in replicas.iter().enumerate() {
            let registry = replica.registry();
            writers.push(tokio::spawn(async move {
                let state = registry.get("Score").await.unwrap();
                for n in 0..10 {
                    state.set("points", (i * 100 + n) as i64).await.unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let last = authority.registry().get("Score").await.unwrap();
        let canonical = last.get("points");
        for replica in &replicas {
            let mirror = replica.registry().get("Score").await.unwrap();
            assert!(eventually(|| mirror.get("points") == canonical).await);
            assert_eq!(mirror.revision(), last.revision());
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_overwrites_on_replicas() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;
        let registry = authority.registry();

        registry
            .create(
                StateProperties::new("Round").replicated(true),
                vars(&[("number", json!(1))]),
            )
            .await
            .unwrap();
        let mirror = replica.registry().get("Round").await.unwrap();
        assert_eq!(mirror.get("number"), Some(json!(1)));

        registry
            .create(
                StateProperties::new("Round").replicated(true),
                vars(&[("number", json!(2))]),
            )
            .await
            .unwrap();
        assert!(eventually(|| mirror.get("number") == Some(json!(2))).await);
    }

    #[tokio::test]
    async fn test_partitioned_replica_write_fails() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;

        authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        let mirror = replica.registry().get("Score").await.unwrap();

        network.partition(replica.node_id());
        assert!(matches!(
            mirror.set("points", 5).await,
            Err(SyncError::Transport(_))
        ));

        network.heal(replica.node_id());
        assert_eq!(mirror.set("points", 6).await.unwrap(), json!(6));
        assert_eq!(mirror.get("points"), Some(json!(6)));
    }
}

#[cfg(test)]
mod lookup_tests {
    use super::*;

    #[tokio::test]
    async fn test_late_get_succeeds() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;

        let lookup = {
            let registry = replica.registry();
            tokio::spawn(async move { registry.get("Late").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        authority
            .registry()
            .create(
                StateProperties::new("Late").replicated(true),
                vars(&[("ready", json!(true))]),
            )
            .await
            .unwrap();

        let state = lookup.await.unwrap().expect("state should mirror in time");
        assert_eq!(state.get("ready"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_missing_get_returns_none_after_budget() {
        let network = MemoryNetwork::new();
        let _authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;

        let started_at = Instant::now();
        assert!(replica.registry().get("Never").await.is_none());
        assert!(started_at.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_barrier_holds_calls_until_start() {
        let network = MemoryNetwork::new();
        let mut authority = node(&network, Role::Authority);
        let registry = authority.registry();

        let blocked = timeout(Duration::from_millis(50), registry.get("Any")).await;
        assert!(blocked.is_err());

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .create(StateProperties::new("Early"), Variables::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        authority.start().await.unwrap();
        pending.await.unwrap().unwrap();
        assert!(registry.get("Early").await.is_some());
    }
}

#[cfg(test)]
mod bootstrap_tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_mirrors_only_replicated_states() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let registry = authority.registry();

        registry
            .create(StateProperties::new("Local"), vars(&[("secret", json!(42))]))
            .await
            .unwrap();
        let shared = registry
            .create(
                StateProperties::new("Shared").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        shared.set("points", 7).await.unwrap();

        let late = started(&network, Role::Replica).await;
        let late_registry = late.registry();
        assert_eq!(late_registry.ids(), vec!["Shared".to_string()]);

        let mirror = late_registry.get("Shared").await.unwrap();
        assert_eq!(mirror.get("points"), Some(json!(7)));
        assert_eq!(mirror.revision(), shared.revision());
        assert!(late_registry.get("Local").await.is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_fails_without_authority() {
        let network = MemoryNetwork::new();
        let mut replica = node(&network, Role::Replica);

        let result = replica.start().await;
        assert!(matches!(result, Err(SyncError::Bootstrap(_))));
        assert!(!replica.registry().is_ready());
    }
}

#[cfg(test)]
mod access_control_tests {
    use super::*;

    async fn config_cluster(network: &MemoryNetwork) -> (StateNode, StateNode) {
        let authority = started(network, Role::Authority).await;
        let replica = started(network, Role::Replica).await;
        authority
            .registry()
            .create(
                StateProperties::new("Config")
                    .replicated(true)
                    .client_read_only(true),
                vars(&[("mode", json!("easy"))]),
            )
            .await
            .unwrap();
        (authority, replica)
    }

    #[tokio::test]
    async fn test_replica_write_to_read_only_state_is_denied() {
        let network = MemoryNetwork::new();
        let (authority, replica) = config_cluster(&network).await;

        let mirror = replica.registry().get("Config").await.unwrap();
        let result = mirror.set("mode", "hard").await;
        assert!(matches!(result, Err(SyncError::AccessDenied(id)) if id == "Config"));

        let canonical = authority.registry().get("Config").await.unwrap();
        assert_eq!(canonical.get("mode"), Some(json!("easy")));
        assert_eq!(mirror.get("mode"), Some(json!("easy")));
    }

    #[tokio::test]
    async fn test_authority_write_to_read_only_state_replicates() {
        let network = MemoryNetwork::new();
        let (authority, replica) = config_cluster(&network).await;

        let canonical = authority.registry().get("Config").await.unwrap();
        canonical.set("mode", "hard").await.unwrap();

        let mirror = replica.registry().get("Config").await.unwrap();
        assert!(eventually(|| mirror.get("mode") == Some(json!("hard"))).await);
    }

    #[tokio::test]
    async fn test_forged_write_is_rejected_by_authority() {
        let network = MemoryNetwork::new();
        let (authority, _replica) = config_cluster(&network).await;

        // Skips the replica-side check entirely, with either claimed role.
        let rogue_id = Uuid::new_v4();
        let rogue = network.join(Role::Replica, rogue_id);
        for claimed in [Role::Replica, Role::Authority] {
            let forged = Envelope::new(
                rogue_id,
                claimed,
                Action::StateSet(SetRequest {
                    id: "Config".into(),
                    key: "mode".into(),
                    value: json!("hard"),
                    revision: 0,
                }),
            )
            .encode()
            .unwrap();

            let reply = rogue.rpc.request(Peer::Authority, forged).await.unwrap();
            let error = decode_reply(&reply).unwrap().unwrap_err();
            assert_eq!(error.kind, ErrorKind::AccessDenied, "claimed {}", claimed);
        }

        let canonical = authority.registry().get("Config").await.unwrap();
        assert_eq!(canonical.get("mode"), Some(json!("easy")));
        assert_eq!(authority.registry().stats().actions_rejected, 2);
    }

    #[tokio::test]
    async fn test_unknown_action_is_refused() {
        let network = MemoryNetwork::new();
        let _authority = started(&network, Role::Authority).await;
        let client = network.join(Role::Replica, Uuid::new_v4());

        let payload = json!({
            "from": Uuid::new_v4(),
            "role": "Replica",
            "action": { "name": "_resetEverything", "payload": null }
        });
        let reply = client
            .rpc
            .request(Peer::Authority, serde_json::to_vec(&payload).unwrap())
            .await
            .unwrap();

        let error = decode_reply(&reply).unwrap().unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnknownAction);
        assert_eq!(error.message, "_resetEverything");
    }
}

#[cfg(test)]
mod notification_tests {
    use super::*;

    #[tokio::test]
    async fn test_owner_listener_fires_once_per_mutation() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let _replica = started(&network, Role::Replica).await;

        let state = authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        let (seen, callback) = recorder();
        let subscription = state.changed(callback).await.unwrap();
        assert!(!subscription.is_global());

        let before = network.traffic();
        for points in 1..=3 {
            state.set("points", points).await.unwrap();
        }
        assert_eq!(count(&seen), 3);
        // One state broadcast per write; no notification traffic.
        assert_eq!(network.traffic() - before, 3);

        subscription.disconnect().await.unwrap();
        subscription.disconnect().await.unwrap();
        state.set("points", 4).await.unwrap();
        assert_eq!(count(&seen), 3);
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_its_own_callback() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let state = authority
            .registry()
            .create(StateProperties::new("Hud"), Variables::new())
            .await
            .unwrap();

        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let first = state.changed(first).await.unwrap();
        let _second = state.changed(second).await.unwrap();

        first.disconnect().await.unwrap();
        state.set("visible", true).await.unwrap();

        assert_eq!(count(&first_seen), 0);
        assert_eq!(count(&second_seen), 1);
        assert_eq!(state.local_listener_count(), 1);
    }

    #[tokio::test]
    async fn test_global_listener_lifecycle_on_replica() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;

        let canonical = authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        let mirror = replica.registry().get("Score").await.unwrap();

        let (seen, callback) = recorder();
        let subscription = mirror.changed(callback).await.unwrap();
        assert_eq!(canonical.global_listener_count(), 1);

        canonical.set("points", 1).await.unwrap();
        assert!(eventually(|| count(&seen) == 1).await);

        subscription.disconnect().await.unwrap();
        subscription.disconnect().await.unwrap();
        assert_eq!(canonical.global_listener_count(), 0);

        let before = network.traffic();
        canonical.set("points", 2).await.unwrap();
        assert!(eventually(|| mirror.get("points") == Some(json!(2))).await);
        assert_eq!(network.traffic() - before, 1);
        assert_eq!(count(&seen), 1);
    }

    #[tokio::test]
    async fn test_remote_listener_sees_new_value_in_mirror() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let replica = started(&network, Role::Replica).await;

        let canonical = authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();
        let mirror = replica.registry().get("Score").await.unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let observed = observed.clone();
            let mirror = mirror.clone();
            move |event: &ChangeEvent| {
                observed
                    .lock()
                    .unwrap()
                    .push((event.new.clone(), mirror.get("points")));
            }
        };
        let _subscription = mirror.changed(callback).await.unwrap();

        for points in 1..=5 {
            canonical.set("points", points).await.unwrap();
        }
        assert!(eventually(|| observed.lock().unwrap().len() == 5).await);

        for (new, in_mirror) in observed.lock().unwrap().iter() {
            assert_eq!(Some(new.clone()), *in_mirror);
        }
    }

    #[tokio::test]
    async fn test_no_listeners_no_notification_traffic() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let _replica = started(&network, Role::Replica).await;

        let state = authority
            .registry()
            .create(
                StateProperties::new("Score").replicated(true),
                vars(&[("points", json!(0))]),
            )
            .await
            .unwrap();

        state.set("points", 1).await.unwrap();
        let stats = authority.registry().stats();
        assert_eq!(stats.local_fires, 0);
        assert_eq!(stats.global_fires, 0);
    }

    #[tokio::test]
    async fn test_replica_owned_state_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let owner = started(&network, Role::Replica).await;
        let peer = started(&network, Role::Replica).await;

        owner
            .registry()
            .create(
                StateProperties::new("Lobby").replicated(true),
                vars(&[("players", json!(1))]),
            )
            .await
            .unwrap();

        // The authority is on the other side of a replica-owned state.
        let canonical = authority.registry().get("Lobby").await.unwrap();
        let (authority_seen, callback) = recorder();
        let remote = canonical.changed(callback).await.unwrap();
        assert!(remote.is_global());
        let on_owner = owner.registry().get("Lobby").await.unwrap();
        assert_eq!(on_owner.global_listener_count(), 1);

        // Any replica sits on the owner side.
        let on_peer = peer.registry().get("Lobby").await.unwrap();
        let (peer_seen, callback) = recorder();
        let local = on_peer.changed(callback).await.unwrap();
        assert!(!local.is_global());

        on_peer.set("players", 2).await.unwrap();

        assert!(eventually(|| count(&authority_seen) == 1).await);
        assert!(eventually(|| count(&peer_seen) == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&authority_seen), 1);
        assert_eq!(count(&peer_seen), 1);

        remote.disconnect().await.unwrap();
        assert_eq!(on_owner.global_listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listeners_survive_overwrite() {
        let network = MemoryNetwork::new();
        let authority = started(&network, Role::Authority).await;
        let registry = authority.registry();

        let state = registry
            .create(StateProperties::new("Hud"), vars(&[("visible", json!(true))]))
            .await
            .unwrap();
        let (seen, callback) = recorder();
        let _subscription = state.changed(callback).await.unwrap();

        registry
            .create(StateProperties::new("Hud"), vars(&[("visible", json!(false))]))
            .await
            .unwrap();
        state.set("visible", true).await.unwrap();

        assert_eq!(count(&seen), 1);
        assert_eq!(seen.lock().unwrap()[0].previous, Some(json!(false)));
    }
}
