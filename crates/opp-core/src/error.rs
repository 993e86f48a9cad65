//! Shared error taxonomy
//!
//! Two families live here. Programmer-contract violations
//! (`NoEntitySpecified`, `AlreadyAdded`, `NoOppInstance`) indicate a bug in
//! a calling platform and must propagate. Runtime device failures
//! (`Update`, `Platform`) are contained at the entity boundary and logged
//! by the caller instead of crashing siblings.

use thiserror::Error;

use crate::EntityIdError;

/// Errors raised by the Open Peer Power core
#[derive(Debug, Error)]
pub enum OppError {
    /// State write attempted before an entity_id was assigned
    #[error("no entity_id specified for entity {entity}")]
    NoEntitySpecified { entity: String },

    /// Entity added to a platform while still registered from a prior add
    #[error("entity {entity_id} cannot be added a second time to an entity platform")]
    AlreadyAdded { entity_id: String },

    /// State write attempted before the opp handle was attached
    #[error("entity {entity} has no opp instance attached")]
    NoOppInstance { entity: String },

    /// Setup cannot complete yet; the config-entry manager should retry
    /// with backoff
    #[error("config entry not ready: {0}")]
    ConfigEntryNotReady(String),

    /// Invalid entity identifier
    #[error(transparent)]
    InvalidEntityId(#[from] EntityIdError),

    /// Platform-level failure (setup, duplicate entity, registry conflict)
    #[error("platform error: {0}")]
    Platform(String),

    /// A device refresh failed; the previous state stays authoritative
    #[error("update failed: {0}")]
    Update(String),
}
