use metrics::{counter, describe_counter, describe_gauge, gauge};
use replistate_common::ActionKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!("replistate_sets_total", "State writes applied on this node");
    describe_counter!("replistate_mirrored_total", "Authority mutations mirrored by this replica");
    describe_counter!("replistate_stale_total", "Replayed or out-of-date mirror updates ignored");
    describe_counter!("replistate_broadcasts_total", "Broadcasts sent, by action");
    describe_counter!("replistate_broadcast_failures_total", "Broadcasts the transport rejected");
    describe_counter!("replistate_rpc_requests_total", "RPC requests sent, by action");
    describe_counter!("replistate_rpc_failures_total", "RPC requests that failed or timed out");
    describe_counter!("replistate_dispatched_total", "Inbound actions handled, by action");
    describe_counter!("replistate_rejected_total", "Inbound messages rejected before handling");
    describe_counter!("replistate_notifications_total", "Change notifications fired, by channel");
    describe_gauge!("replistate_states", "States registered on this node");
}

/// Counters kept by every node
#[derive(Default)]
pub(crate) struct SyncStats {
    local_sets: AtomicU64,
    authority_sets: AtomicU64,
    mirrored_updates: AtomicU64,
    stale_updates: AtomicU64,
    broadcasts_sent: AtomicU64,
    broadcast_failures: AtomicU64,
    rpc_requests: AtomicU64,
    rpc_failures: AtomicU64,
    actions_dispatched: AtomicU64,
    actions_rejected: AtomicU64,
    local_fires: AtomicU64,
    global_fires: AtomicU64,
}

/// Point-in-time copy of a node's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatsSnapshot {
    pub states: usize,
    pub local_sets: u64,
    pub authority_sets: u64,
    pub mirrored_updates: u64,
    pub stale_updates: u64,
    pub broadcasts_sent: u64,
    pub broadcast_failures: u64,
    pub rpc_requests: u64,
    pub rpc_failures: u64,
    pub actions_dispatched: u64,
    pub actions_rejected: u64,
    pub local_fires: u64,
    pub global_fires: u64,
}

impl SyncStats {
    pub(crate) fn record_local_set(&self) {
        self.local_sets.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_sets_total", 1, "kind" => "local");
    }

    pub(crate) fn record_authority_set(&self) {
        self.authority_sets.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_sets_total", 1, "kind" => "replicated");
    }

    pub(crate) fn record_mirrored(&self) {
        self.mirrored_updates.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_mirrored_total", 1);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_stale_total", 1);
    }

    pub(crate) fn record_broadcast(&self, kind: ActionKind) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_broadcasts_total", 1, "action" => kind.name());
    }

    pub(crate) fn record_broadcast_failure(&self, kind: ActionKind) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_broadcast_failures_total", 1, "action" => kind.name());
    }

    pub(crate) fn record_rpc(&self, kind: ActionKind) {
        self.rpc_requests.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_rpc_requests_total", 1, "action" => kind.name());
    }

    pub(crate) fn record_rpc_failure(&self, kind: ActionKind) {
        self.rpc_failures.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_rpc_failures_total", 1, "action" => kind.name());
    }

    pub(crate) fn record_dispatch(&self, kind: ActionKind) {
        self.actions_dispatched.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_dispatched_total", 1, "action" => kind.name());
    }

    pub(crate) fn record_rejected(&self) {
        self.actions_rejected.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_rejected_total", 1);
    }

    pub(crate) fn record_local_fire(&self) {
        self.local_fires.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_notifications_total", 1, "channel" => "local");
    }

    pub(crate) fn record_global_fire(&self) {
        self.global_fires.fetch_add(1, Ordering::Relaxed);
        counter!("replistate_notifications_total", 1, "channel" => "global");
    }

    pub(crate) fn snapshot(&self, states: usize) -> SyncStatsSnapshot {
        gauge!("replistate_states", states as f64);
        SyncStatsSnapshot {
            states,
            local_sets: self.local_sets.load(Ordering::Relaxed),
            authority_sets: self.authority_sets.load(Ordering::Relaxed),
            mirrored_updates: self.mirrored_updates.load(Ordering::Relaxed),
            stale_updates: self.stale_updates.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            rpc_requests: self.rpc_requests.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            actions_dispatched: self.actions_dispatched.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
            local_fires: self.local_fires.load(Ordering::Relaxed),
            global_fires: self.global_fires.load(Ordering::Relaxed),
        }
    }
}
