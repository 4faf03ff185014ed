//! Tenants and the API key registry used to authenticate write requests.
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Number of leading characters of an API key that may appear in logs
pub const DEFAULT_MASK_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantError {
    #[error("tenant name must not be empty")]
    EmptyName,

    #[error("api key for tenant {name} must not be empty")]
    EmptyKey { name: String },

    #[error("api key for tenant {name} is already assigned to tenant {existing}")]
    DuplicateKey { name: String, existing: String },
}

/// A customer of the router, identified by one or more API keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    name: Arc<str>,
}

impl Tenant {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tenant name in a form usable inside a statsd metric name
    pub fn metric_tag(&self) -> String {
        self.name.replace('-', "_")
    }
}

/// Read-only mapping from API key to [`Tenant`]
///
/// Built once at startup and shared by every request handler without locking.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    by_key: HashMap<String, Tenant>,
}

impl TenantRegistry {
    /// Build a registry from `(tenant name, api key)` pairs
    pub fn new<I, N, K>(entries: I) -> Result<Self, TenantError>
    where
        I: IntoIterator<Item = (N, K)>,
        N: Into<String>,
        K: Into<String>,
    {
        let mut by_key: HashMap<String, Tenant> = HashMap::new();
        for (name, key) in entries {
            let name = name.into();
            let key = key.into();
            if name.is_empty() {
                return Err(TenantError::EmptyName);
            }
            if key.is_empty() {
                return Err(TenantError::EmptyKey { name });
            }
            if let Some(existing) = by_key.get(&key) {
                return Err(TenantError::DuplicateKey {
                    name,
                    existing: existing.name().to_string(),
                });
            }
            by_key.insert(key, Tenant::new(name));
        }
        Ok(Self { by_key })
    }

    pub fn lookup(&self, api_key: &str) -> Option<&Tenant> {
        self.by_key.get(api_key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Distinct tenant names, sorted
    pub fn tenant_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.by_key.values().map(|t| t.name()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Redact an API key for logging, keeping only its first `visible` characters
///
/// Keys shorter than `visible` are redacted entirely.
pub fn mask(api_key: &str, visible: usize) -> String {
    let len = api_key.chars().count();
    if len < visible {
        return "*".repeat(len);
    }
    api_key
        .chars()
        .take(visible)
        .chain(std::iter::repeat_n('*', len - visible))
        .collect()
}
