//! Domain identity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(Uuid);

impl DomainId {
    /// Create a new random domain ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DomainId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Non-owning reference to a domain managed by a connection.
///
/// The backend resources behind a domain belong to the
/// [`HypervisorConnection`](crate::HypervisorConnection) that created it; a
/// handle only names them. Handles are cheap to clone and stay valid as
/// identifiers after the domain is gone, at which point operations using
/// them fail with [`HvError::DomainNotFound`](crate::HvError::DomainNotFound).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainHandle {
    id: DomainId,
    name: String,
    created_at: DateTime<Utc>,
}

impl DomainHandle {
    /// Create a handle for a freshly created domain.
    pub fn new(id: DomainId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }

    /// Domain ID.
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Domain name (the sandbox name it was created for).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the backend reported the domain as created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
