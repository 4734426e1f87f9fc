// Replica bootstrap
//
// A replica asks the authority for every replicated state before it opens
// for business. Mirrored entries fire no notifications: nobody can have
// subscribed yet because the barrier is still closed.

use replistate_common::{Action, ReplyBody, Role};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::registry::Registry;
use crate::replication::unexpected_reply;
use crate::transport::Peer;

/// Mirror the authority's replicated states. Returns how many were mirrored.
pub async fn bootstrap(registry: &Registry) -> Result<usize> {
    if registry.role() != Role::Replica {
        return Ok(0);
    }

    let timeout = registry.core.settings.bootstrap_timeout();
    info!(timeout_ms = timeout.as_millis() as u64, "Fetching replicated states from authority");

    let reply = registry
        .request_with_timeout(Peer::Authority, Action::GetCurrentReplicated, Some(timeout))
        .await
        .map_err(|e| {
            warn!(error = %e, "Bootstrap request failed");
            SyncError::Bootstrap(e.to_string())
        })?;

    let states = match reply {
        ReplyBody::Snapshot { states } => states,
        other => {
            return Err(SyncError::Bootstrap(
                unexpected_reply("_getCurrentReplicated", &other).to_string(),
            ))
        }
    };

    let received = states.len();
    let mut mirrored = 0;
    for snapshot in states {
        if !snapshot.properties.replicated {
            warn!(state_id = %snapshot.properties.id, "Authority sent a local state, skipping");
            continue;
        }
        if registry.mirror_create(snapshot) {
            mirrored += 1;
        }
    }

    info!(received, mirrored, "✓ Bootstrap complete");
    Ok(mirrored)
}
