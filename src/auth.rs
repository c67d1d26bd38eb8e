// src/auth.rs
//! Bearer-token checks for the peer API and the admin endpoints.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use sha2::{Digest, Sha256};

use crate::config::DirectoryConfig;
use crate::error::ConfigError;
use crate::registry::Credential;

/// Token from an `Authorization: Bearer <token>` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// Digests are compared instead of raw strings so the comparison length never
// depends on the presented value.
fn digest(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(s.as_bytes()));
    out
}

pub fn credential_matches(expected: &Credential, headers: &HeaderMap) -> bool {
    bearer_token(headers).is_some_and(|t| digest(t) == digest(expected.expose()))
}

/// The single administrator allowed to view the aggregated directory.
pub struct AdminAuth {
    username: String,
    token_digest: [u8; 32],
}

impl AdminAuth {
    pub fn new(username: impl Into<String>, token: &str) -> Self {
        Self {
            username: username.into(),
            token_digest: digest(token),
        }
    }

    /// No token, no admin: there is deliberately no built-in default.
    pub fn from_config(cfg: &DirectoryConfig) -> Result<Self, ConfigError> {
        let token = cfg
            .admin_token
            .as_deref()
            .ok_or(ConfigError::MissingAdminToken)?;
        Ok(Self::new(cfg.admin_username.clone(), token))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The admin's username when the request carries the admin token.
    pub fn verify(&self, headers: &HeaderMap) -> Option<&str> {
        let token = bearer_token(headers)?;
        (digest(token) == self.token_digest).then_some(self.username.as_str())
    }
}
