// Access control
//
// The read-only rule is evaluated twice for a replica write: once on the
// replica before anything is sent, and again on the authority as dispatcher
// middleware. Only the authority-side check is trusted.

use replistate_common::{Action, Role, StateProperties};

use crate::error::{Result, SyncError};

/// Read-only policy for state mutation
pub struct AccessControl;

impl AccessControl {
    /// Whether `writer` may mutate a state with these properties
    pub fn can_write(properties: &StateProperties, writer: Role) -> bool {
        !(properties.replicated && properties.client_read_only && writer == Role::Replica)
    }

    pub fn check_write(properties: &StateProperties, writer: Role) -> Result<()> {
        if Self::can_write(properties, writer) {
            Ok(())
        } else {
            Err(SyncError::AccessDenied(properties.id.clone()))
        }
    }
}

/// Middleware consulted by the dispatcher before any handler runs
pub trait AccessPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `target` holds the properties of the addressed state when it exists locally
    fn authorize(
        &self,
        local_role: Role,
        sender: Role,
        action: &Action,
        target: Option<&StateProperties>,
    ) -> Result<()>;
}

/// Rejects replica writes to client read-only states
pub struct ReadOnlyPolicy;

impl AccessPolicy for ReadOnlyPolicy {
    fn name(&self) -> &'static str {
        "read_only"
    }

    fn authorize(
        &self,
        local_role: Role,
        sender: Role,
        action: &Action,
        target: Option<&StateProperties>,
    ) -> Result<()> {
        match (local_role, action, target) {
            (Role::Authority, Action::StateSet(_), Some(properties)) => {
                AccessControl::check_write(properties, sender)
            }
            _ => Ok(()),
        }
    }
}

/// Replicas only accept mirror updates that come from the authority
pub struct AuthorityMirrorPolicy;

impl AccessPolicy for AuthorityMirrorPolicy {
    fn name(&self) -> &'static str {
        "authority_mirror"
    }

    fn authorize(
        &self,
        local_role: Role,
        sender: Role,
        action: &Action,
        _target: Option<&StateProperties>,
    ) -> Result<()> {
        let is_mirror_update = matches!(action, Action::StateCreate(_) | Action::StateSet(_));
        if local_role == Role::Replica && is_mirror_update && sender != Role::Authority {
            return Err(SyncError::Other(format!(
                "{} from a replica rejected",
                action.kind()
            )));
        }
        Ok(())
    }
}

/// Policies installed on every dispatcher
pub fn default_policies() -> Vec<Box<dyn AccessPolicy>> {
    vec![Box::new(ReadOnlyPolicy), Box::new(AuthorityMirrorPolicy)]
}
