// src/registry.rs
//! Source registry: the ordered, immutable set of participating companies.
//!
//! Built once from [`DirectoryConfig`] and shared read-only (behind `Arc`)
//! across request handlers and concurrent fetches. A malformed entry is a
//! startup failure, never a per-request one.

use std::collections::{HashMap, HashSet};
use std::fmt;

use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::config::directory::{default_credential_env, LOCAL_ENDPOINT_MARKER};
use crate::config::DirectoryConfig;
use crate::error::ConfigError;

/// API key presented to (or expected from) a peer. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 prefix, safe for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut out = String::with_capacity(12);
        for b in digest.iter().take(6) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(sha256:{})", self.fingerprint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local,
    Remote(Url),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local => f.write_str(LOCAL_ENDPOINT_MARKER),
            Endpoint::Remote(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub endpoint: Endpoint,
    pub credential: Credential,
    pub is_local: bool,
}

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceDescriptor>,
    local_index: usize,
}

impl SourceRegistry {
    /// Validate every company entry and fix the iteration order.
    pub fn from_config(cfg: &DirectoryConfig) -> Result<Self, ConfigError> {
        if cfg.companies.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut seen = HashSet::new();
        let mut normalised: HashMap<String, &str> = HashMap::new();
        let mut sources = Vec::with_capacity(cfg.companies.len());
        for c in &cfg.companies {
            if c.id.is_empty() {
                return Err(ConfigError::BlankId);
            }
            if !seen.insert(c.id.clone()) {
                return Err(ConfigError::DuplicateSource(c.id.clone()));
            }
            // `a` and `A` would share DIRECTORY_API_KEY_A.
            let env_var = default_credential_env(&c.id);
            if let Some(other) = normalised.insert(env_var.clone(), c.id.as_str()) {
                return Err(ConfigError::CollidingIds {
                    id: c.id.clone(),
                    other: other.to_string(),
                    env_var,
                });
            }

            let is_local = c.id == cfg.current_company;
            let endpoint = match c.api_endpoint.as_deref() {
                None if is_local => Endpoint::Local,
                None => return Err(ConfigError::MissingEndpoint(c.id.clone())),
                Some(e) if e.eq_ignore_ascii_case(LOCAL_ENDPOINT_MARKER) => {
                    if !is_local {
                        return Err(ConfigError::MissingEndpoint(c.id.clone()));
                    }
                    Endpoint::Local
                }
                Some(e) => Endpoint::Remote(parse_endpoint(&c.id, e)?),
            };

            let credential = c
                .credential
                .clone()
                .map(Credential::new)
                .ok_or_else(|| ConfigError::MissingCredential {
                    id: c.id.clone(),
                    env_var: c.credential_env.clone(),
                })?;

            sources.push(SourceDescriptor {
                id: c.id.clone(),
                display_name: c.name.clone(),
                endpoint,
                credential,
                is_local,
            });
        }

        let local_index = sources
            .iter()
            .position(|s| s.is_local)
            .ok_or_else(|| ConfigError::UnknownCurrent(cfg.current_company.clone()))?;

        Ok(Self {
            sources,
            local_index,
        })
    }

    /// All sources, local included, in registry order.
    pub fn resolve_sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn local(&self) -> &SourceDescriptor {
        &self.sources[self.local_index]
    }

    pub fn get(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn parse_endpoint(id: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidEndpoint {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEndpoint {
            id: id.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}
