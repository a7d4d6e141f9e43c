//! Authentication and authorization contracts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A claim attached to a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub name: String,
    pub value: String,
}

impl Claim {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An authenticated identity with its claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub claims: Vec<Claim>,
}

impl Principal {
    pub fn has_claim(&self, name: &str, value: &str) -> bool {
        self.claims
            .iter()
            .any(|c| c.name == name && c.value == value)
    }
}

/// Credentials presented by a caller.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    UsernamePassword { username: String, password: String },
}

/// Turns credentials into a principal; `None` means authentication failed.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal>;
}

/// Token-to-principal map for embedded and test use.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    principals: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.principals.insert(token.into(), principal);
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        match credentials {
            Credentials::Token(token) => self.principals.get(token).cloned(),
            Credentials::UsernamePassword { .. } => None,
        }
    }
}

/// A denied authorization check, carrying what was required.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("principal '{principal_id}' lacks required permission '{required_permission}'")]
pub struct AuthorizationError {
    pub principal_id: String,
    pub required_permission: String,
}

/// Policy-based authorization check.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: &Principal, policy: &str) -> Result<(), AuthorizationError>;
}

/// Maps policy names to required `(claim, value)` pairs; the principal must
/// hold every pair. Unknown policies deny.
#[derive(Default)]
pub struct ClaimsAuthorizer {
    policies: HashMap<String, Vec<Claim>>,
}

impl ClaimsAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(
        mut self,
        policy: impl Into<String>,
        required: impl IntoIterator<Item = Claim>,
    ) -> Self {
        self.policies
            .insert(policy.into(), required.into_iter().collect());
        self
    }
}

impl Authorizer for ClaimsAuthorizer {
    fn authorize(&self, principal: &Principal, policy: &str) -> Result<(), AuthorizationError> {
        let denied = |permission: &str| AuthorizationError {
            principal_id: principal.id.clone(),
            required_permission: permission.to_string(),
        };

        let required = self.policies.get(policy).ok_or_else(|| denied(policy))?;
        for claim in required {
            if !principal.has_claim(&claim.name, &claim.value) {
                debug!(
                    principal = %principal.id,
                    policy = %policy,
                    claim = %claim.name,
                    "authorization denied"
                );
                return Err(denied(&format!("{policy}:{}", claim.name)));
            }
        }
        Ok(())
    }
}
