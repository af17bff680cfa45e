//! In-memory credential storage backend
//!
//! Fast, simple storage for development and testing.
//! Data is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::credentials::{
    not_found, now_epoch, storage_order, Credential, CredentialPatch, CredentialStore,
    NewCredential, Result, StoreError,
};
use crate::health::HealthMutation;

/// In-memory storage backend
#[derive(Clone)]
pub struct MemoryCredentialStore {
    credentials: Arc<RwLock<BTreeMap<u64, Credential>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            credentials: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("Lock error: {}", e))
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn list_valid(&self) -> Result<Vec<Credential>> {
        let credentials = self.credentials.read().map_err(lock_error)?;
        let mut out: Vec<Credential> = credentials
            .values()
            .filter(|c| c.is_valid)
            .cloned()
            .collect();
        out.sort_by(storage_order);
        Ok(out)
    }

    async fn list_for_owner(&self, owner_id: u64) -> Result<Vec<Credential>> {
        let credentials = self.credentials.read().map_err(lock_error)?;
        Ok(credentials
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: u64) -> Result<Credential> {
        let credentials = self.credentials.read().map_err(lock_error)?;
        credentials.get(&id).cloned().ok_or_else(|| not_found(id))
    }

    async fn create(&self, owner_id: u64, new: NewCredential) -> Result<Credential> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cred = Credential::from_new(id, owner_id, new);
        let mut credentials = self.credentials.write().map_err(lock_error)?;
        credentials.insert(id, cred.clone());
        Ok(cred)
    }

    async fn update(&self, id: u64, owner_id: u64, patch: CredentialPatch) -> Result<Credential> {
        let mut credentials = self.credentials.write().map_err(lock_error)?;
        match credentials.get_mut(&id) {
            Some(cred) if cred.owner_id == owner_id => {
                cred.apply_patch(patch);
                Ok(cred.clone())
            }
            _ => Err(not_found(id)),
        }
    }

    async fn delete(&self, id: u64, owner_id: u64) -> Result<()> {
        let mut credentials = self.credentials.write().map_err(lock_error)?;
        match credentials.get(&id) {
            Some(cred) if cred.owner_id == owner_id => {
                credentials.remove(&id);
                Ok(())
            }
            _ => Err(not_found(id)),
        }
    }

    async fn apply_health(&self, id: u64, mutation: HealthMutation) -> Result<Credential> {
        let mut credentials = self.credentials.write().map_err(lock_error)?;
        let cred = credentials.get_mut(&id).ok_or_else(|| not_found(id))?;
        mutation.apply(cred, now_epoch());
        Ok(cred.clone())
    }
}
