//! Identity Models
//! Mission: Tenant-scoped identities with ranked roles

use crate::errors::CoreError;
use serde::{Deserialize, Serialize};

/// Role rank: viewer < operator < admin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "viewer")]
    Viewer, // Read-only access
    #[serde(rename = "operator")]
    Operator, // Writes: commands, acks, statement generation
    #[serde(rename = "admin")]
    Admin, // Provisioning, window close, statement freeze/void/export
}

impl Role {
    pub fn rank(&self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Operator => 2,
            Role::Admin => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: String,
    pub role: Role,
    pub exp: usize,
}

/// The request identity handlers act as.
#[derive(Debug, Clone)]
pub struct Identity {
    pub tenant_id: String,
    pub role: Role,
    pub subject: String,
}

impl Identity {
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            tenant_id: claims.tenant_id.clone(),
            role: claims.role,
            subject: claims.sub.clone(),
        }
    }

    /// Role gate; rank comparison so admin passes operator checks.
    pub fn require_role(&self, required: Role) -> Result<(), CoreError> {
        if self.role.rank() >= required.rank() {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "requires {} role",
                required.as_str()
            )))
        }
    }

    /// Resource-tenant check; rejects cross-tenant access regardless of role.
    pub fn ensure_tenant(&self, resource_tenant: &str) -> Result<(), CoreError> {
        if self.tenant_id == resource_tenant {
            Ok(())
        } else {
            Err(CoreError::TenantMismatch {
                expected: resource_tenant.to_string(),
                got: self.tenant_id.clone(),
            })
        }
    }
}
