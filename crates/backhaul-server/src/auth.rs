//! Registration authorization
//!
//! Control-channel upgrades carry a bearer token. The decision is made
//! synchronously against the configured token table, before the WebSocket
//! handshake completes. An empty table means open registration, which is
//! the development default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("token not recognized")]
    UnknownToken,

    #[error("token not valid for domain {0}")]
    DomainForbidden(String),
}

/// One configured credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,

    /// Whether agents holding this token may attach additional control
    /// sockets to an already registered domain.
    #[serde(default)]
    pub allow_multiple: bool,

    /// Domains this token may register. Empty means any domain.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// What a successful authorization grants the registration.
#[derive(Debug, Clone, Copy)]
pub struct AuthGrant {
    pub allow_multiple: bool,
}

#[derive(Debug, Default)]
pub struct AuthManager {
    tokens: Vec<TokenEntry>,
}

impl AuthManager {
    pub fn new(tokens: Vec<TokenEntry>) -> Self {
        Self { tokens }
    }

    /// Decide whether `token` may register `domain`.
    pub fn authorize(&self, domain: &str, token: Option<&str>) -> Result<AuthGrant, AuthError> {
        if self.tokens.is_empty() {
            return Ok(AuthGrant {
                allow_multiple: false,
            });
        }

        let token = token.ok_or(AuthError::MissingToken)?;
        let entry = self
            .tokens
            .iter()
            .find(|entry| entry.token == token)
            .ok_or(AuthError::UnknownToken)?;

        if !entry.domains.is_empty() && !entry.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
        {
            return Err(AuthError::DomainForbidden(domain.to_string()));
        }

        Ok(AuthGrant {
            allow_multiple: entry.allow_multiple,
        })
    }
}
