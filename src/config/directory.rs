// src/config/directory.rs
//! Process configuration: companies, the current company, peer API policy,
//! the local store location and the admin credential.
//!
//! Loaded once at startup from TOML (`config/directory.toml` or
//! `$DIRECTORY_CONFIG_PATH`) with environment overrides. Secrets never live in
//! the file: an `api_key` of `"ENV"` (or no key at all) is resolved from the
//! environment, and the admin token is read from `ADMIN_TOKEN` only.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::remote::RetryPolicy;

// --- env defaults & names ---
pub const DEFAULT_CONFIG_PATH: &str = "config/directory.toml";
pub const DEFAULT_STORE_PATH: &str = "data/users.json";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

pub const ENV_CONFIG_PATH: &str = "DIRECTORY_CONFIG_PATH";
pub const ENV_CURRENT_COMPANY: &str = "CURRENT_COMPANY";
pub const ENV_API_TIMEOUT: &str = "API_TIMEOUT";
pub const ENV_API_RETRY_ATTEMPTS: &str = "API_RETRY_ATTEMPTS";
pub const ENV_STORE_PATH: &str = "DIRECTORY_STORE_PATH";
pub const ENV_ADMIN_USERNAME: &str = "ADMIN_USERNAME";
pub const ENV_ADMIN_TOKEN: &str = "ADMIN_TOKEN";

/// Marker accepted for `api_endpoint` on the deployment's own company.
pub const LOCAL_ENDPOINT_MARKER: &str = "local";

/// Upper bound for `api.timeout_secs` (one hour).
pub const MAX_TIMEOUT_SECS: u64 = 3_600;
/// Upper bound for `api.aggregate_deadline_secs` (one day).
pub const MAX_AGGREGATE_DEADLINE_SECS: u64 = 86_400;

fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    2_000
}
fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}
fn default_true() -> bool {
    true
}

/* ----------------------------
File schema (TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
struct FileRoot {
    current_company: Option<String>,
    #[serde(default)]
    api: ApiSection,
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    admin: AdminSection,
    #[serde(default)]
    companies: Vec<CompanyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Overall budget for one aggregation; derived from the retry policy if absent.
    #[serde(default)]
    pub aggregate_deadline_secs: Option<u64>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            aggregate_deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Require peers to present the local company's credential on `/api/users`.
    #[serde(default = "default_true")]
    pub require_peer_auth: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            require_peer_auth: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AdminSection {
    username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompanyEntry {
    id: String,
    name: Option<String>,
    api_endpoint: Option<String>,
    api_key: Option<String>,
    api_key_env: Option<String>,
}

/* ----------------------------
Resolved configuration
---------------------------- */

/// A company entry with its credential resolved from file or environment.
/// Structural validation (endpoints, duplicates) happens in the registry.
#[derive(Debug, Clone)]
pub struct CompanyConfig {
    pub id: String,
    pub name: String,
    pub api_endpoint: Option<String>,
    pub credential: Option<String>,
    /// Environment variable consulted for the credential; reported on errors.
    pub credential_env: String,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub current_company: String,
    /// Registry iteration order is file order.
    pub companies: Vec<CompanyConfig>,
    pub api: ApiSection,
    pub store: StoreSection,
    pub server: ServerSection,
    pub admin_username: String,
    pub admin_token: Option<String>,
}

impl DirectoryConfig {
    /// Load using `$DIRECTORY_CONFIG_PATH` or `config/directory.toml`, resolving
    /// overrides and secrets from the process environment.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str_with_env(&content, |k| std::env::var(k).ok())
    }

    /// Parse TOML and resolve overrides/secrets through `env`.
    pub fn from_toml_str_with_env<F>(s: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root: FileRoot = toml::from_str(s)?;
        let mut api = root.api;
        let mut store = root.store;

        let current_company = env(ENV_CURRENT_COMPANY)
            .or(root.current_company)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "current_company",
                reason: "not set in file or CURRENT_COMPANY".into(),
            })?;

        if let Some(raw) = env(ENV_API_TIMEOUT) {
            api.timeout_secs = parse_positive(ENV_API_TIMEOUT, &raw)?;
        }
        if let Some(raw) = env(ENV_API_RETRY_ATTEMPTS) {
            let attempts = parse_positive(ENV_API_RETRY_ATTEMPTS, &raw)?;
            api.retry_attempts =
                u32::try_from(attempts).map_err(|_| ConfigError::InvalidValue {
                    field: ENV_API_RETRY_ATTEMPTS,
                    reason: format!("{attempts} is out of range"),
                })?;
        }
        if let Some(p) = env(ENV_STORE_PATH) {
            store.path = PathBuf::from(p);
        }
        if api.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if api.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                field: "api.timeout_secs",
                reason: format!("must be at most {MAX_TIMEOUT_SECS}"),
            });
        }
        match api.aggregate_deadline_secs {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    field: "api.aggregate_deadline_secs",
                    reason: "must be at least 1".into(),
                })
            }
            Some(secs) if secs > MAX_AGGREGATE_DEADLINE_SECS => {
                return Err(ConfigError::InvalidValue {
                    field: "api.aggregate_deadline_secs",
                    reason: format!("must be at most {MAX_AGGREGATE_DEADLINE_SECS}"),
                })
            }
            _ => {}
        }
        if api.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.retry_attempts",
                reason: "must be at least 1".into(),
            });
        }

        let companies = root
            .companies
            .into_iter()
            .map(|c| resolve_company(c, &env))
            .collect();

        let admin_username = env(ENV_ADMIN_USERNAME)
            .or(root.admin.username)
            .unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string());
        let admin_token = env(ENV_ADMIN_TOKEN).filter(|t| !t.trim().is_empty());

        Ok(Self {
            current_company,
            companies,
            api,
            store,
            server: root.server,
            admin_username,
            admin_token,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.api.timeout_secs),
            max_attempts: self.api.retry_attempts,
            backoff_base: Duration::from_millis(self.api.backoff_base_ms),
            backoff_max: Duration::from_millis(self.api.backoff_max_ms),
        }
    }

    pub fn aggregate_deadline(&self) -> Duration {
        match self.api.aggregate_deadline_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.retry_policy().worst_case(),
        }
    }
}

/// `DIRECTORY_API_KEY_<ID>` with the id upper-cased and non-alphanumerics mapped to `_`.
pub fn default_credential_env(id: &str) -> String {
    let suffix: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("DIRECTORY_API_KEY_{suffix}")
}

fn resolve_company<F>(c: CompanyEntry, env: &F) -> CompanyConfig
where
    F: Fn(&str) -> Option<String>,
{
    let id = c.id.trim().to_string();
    let credential_env = c
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_credential_env(&id));

    let credential = match c.api_key.as_deref().map(str::trim) {
        Some(k) if k.eq_ignore_ascii_case("env") => env(&credential_env),
        Some(k) if !k.is_empty() => Some(k.to_string()),
        _ => env(&credential_env),
    }
    .map(|k| k.trim().to_string())
    .filter(|k| !k.is_empty());

    CompanyConfig {
        name: c
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Company {id}")),
        api_endpoint: c
            .api_endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty()),
        credential,
        credential_env,
        id,
    }
}

fn parse_positive(field: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::InvalidValue {
            field,
            reason: format!("expected a positive integer, got '{raw}'"),
        }),
    }
}
