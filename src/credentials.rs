//! Credential model and the storage interface.
//!
//! A credential is one backend session (browser cookie) owned by a user. The
//! rotation pool reads valid credentials from a `CredentialStore`; every outbound
//! attempt and every validation probe writes back through `apply_health`, which
//! stores apply atomically per record.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::HealthMutation;

/// Consecutive errors after which a credential is marked invalid.
pub const ERROR_THRESHOLD: u32 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    pub owner_id: u64,
    pub name: String,
    /// Primary secret; sent verbatim as the backend `cookie` header.
    pub api_key: String,
    #[serde(default)]
    pub session_key: String,
    pub is_valid: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub last_validated: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Credential {
    pub fn from_new(id: u64, owner_id: u64, new: NewCredential) -> Self {
        let now = now_epoch();
        Self {
            id,
            owner_id,
            name: new.name,
            api_key: new.api_key,
            session_key: new.session_key.unwrap_or_default(),
            is_valid: true,
            priority: new.priority.unwrap_or(0),
            usage_count: 0,
            error_count: 0,
            last_used: None,
            last_validated: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy with both secrets reduced to a short prefix, for API responses.
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        out.api_key = mask_secret(&self.api_key);
        out.session_key = mask_secret(&self.session_key);
        out
    }

    pub(crate) fn apply_patch(&mut self, patch: CredentialPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(api_key) = patch.api_key {
            self.api_key = api_key;
        }
        if let Some(session_key) = patch.session_key {
            self.session_key = session_key;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        self.updated_at = now_epoch();
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Descriptive fields an owner may edit. Validity and counters change only
/// through `HealthTracker`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStats {
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub total_usage: u64,
}

impl CredentialStats {
    pub fn from_credentials<'a>(creds: impl IntoIterator<Item = &'a Credential>) -> Self {
        let mut stats = Self::default();
        for c in creds {
            stats.total += 1;
            if c.is_valid {
                stats.valid += 1;
            }
            stats.total_usage += c.usage_count;
        }
        stats.invalid = stats.total - stats.valid;
        stats
    }
}

/// Order of `list_valid`: priority descending, then usage ascending, then id.
pub fn storage_order(a: &Credential, b: &Credential) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.usage_count.cmp(&b.usage_count))
        .then(a.id.cmp(&b.id))
}

/// Credential storage backend trait
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// All valid credentials, across owners, in `storage_order`.
    async fn list_valid(&self) -> Result<Vec<Credential>>;

    /// Every credential of one owner, by id.
    async fn list_for_owner(&self, owner_id: u64) -> Result<Vec<Credential>>;

    async fn get(&self, id: u64) -> Result<Credential>;

    async fn create(&self, owner_id: u64, new: NewCredential) -> Result<Credential>;

    /// Update a credential the owner holds; other owners' ids are `NotFound`.
    async fn update(&self, id: u64, owner_id: u64, patch: CredentialPatch) -> Result<Credential>;

    async fn delete(&self, id: u64, owner_id: u64) -> Result<()>;

    /// Apply a health transition atomically and return the updated record.
    async fn apply_health(&self, id: u64, mutation: HealthMutation) -> Result<Credential>;

    async fn stats(&self, owner_id: u64) -> Result<CredentialStats> {
        let creds = self.list_for_owner(owner_id).await?;
        Ok(CredentialStats::from_credentials(&creds))
    }

    /// Health check
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn not_found(id: u64) -> StoreError {
    StoreError::NotFound(format!("credential {}", id))
}

fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(8).collect();
    format!("{}…", prefix)
}
