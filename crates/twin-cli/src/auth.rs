//! Static bearer token authorizer.

use std::collections::HashMap;

use async_trait::async_trait;
use twin_core::{Authorizer, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    user: String,
    role: String,
}

/// Authorizer backed by a fixed `token:user:role` table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    grants: HashMap<String, Grant>,
}

impl StaticTokenAuthorizer {
    /// Parse `token:user:role` entries separated by `;`. Blank entries are skipped.
    pub fn parse(tokens: &str) -> Result<Self> {
        let mut grants = HashMap::new();
        for entry in tokens.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':').map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(token), Some(user), Some(role))
                    if !token.is_empty() && !user.is_empty() && !role.is_empty() =>
                {
                    grants.insert(
                        token.to_string(),
                        Grant {
                            user: user.to_string(),
                            role: role.to_string(),
                        },
                    );
                }
                _ => {
                    return Err(Error::Config(format!(
                        "auth token entry must be token:user:role, got {:?}",
                        entry
                    )))
                }
            }
        }
        Ok(Self { grants })
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn check_token(&self, token: &str, allowed_roles: &[String]) -> Result<String> {
        let grant = self
            .grants
            .get(token)
            .ok_or_else(|| Error::Unauthorized("invalid token".to_string()))?;

        if allowed_roles.iter().any(|role| role == &grant.role) {
            Ok(grant.user.clone())
        } else {
            Err(Error::Unauthorized(format!(
                "user {} with role {} not allowed",
                grant.user, grant.role
            )))
        }
    }
}
