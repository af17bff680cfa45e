//! sled-backed credential storage.
//!
//! Records are JSON values keyed by the big-endian id, so tree iteration is id
//! order. Every change to an existing record (patches and health mutations) goes
//! through `modify`, which runs inside `update_and_fetch`, sled's compare-and-swap
//! loop, so concurrent writers never overwrite each other's counters.

use std::path::PathBuf;

use crate::credentials::{
    not_found, now_epoch, storage_order, Credential, CredentialPatch, CredentialStore,
    NewCredential, Result, StoreError,
};
use crate::health::HealthMutation;

pub struct SledCredentialStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledCredentialStore {
    pub fn open_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = sled::open(path)?;
        let tree = db.open_tree("credentials")?;
        Ok(Self { db, tree })
    }

    fn put(&self, cred: &Credential) -> Result<()> {
        let val = serde_json::to_vec(cred)?;
        self.tree.insert(cred.id.to_be_bytes(), val)?;
        self.tree.flush()?;
        Ok(())
    }

    fn load(&self, id: u64) -> Result<Option<Credential>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
            None => Ok(None),
        }
    }

    fn all(&self) -> Result<Vec<Credential>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn owned(&self, id: u64, owner_id: u64) -> Result<Credential> {
        match self.load(id)? {
            Some(cred) if cred.owner_id == owner_id => Ok(cred),
            _ => Err(not_found(id)),
        }
    }

    /// Atomically rewrite one record. `f` may run more than once under contention.
    fn modify<F>(&self, id: u64, mut f: F) -> Result<Credential>
    where
        F: FnMut(&mut Credential) -> Result<()>,
    {
        let mut failure: Option<StoreError> = None;

        let updated = self.tree.update_and_fetch(id.to_be_bytes(), |old| {
            failure = None;
            let bytes = old?;
            let mut cred: Credential = match serde_json::from_slice(bytes) {
                Ok(c) => c,
                Err(e) => {
                    failure = Some(e.into());
                    return Some(bytes.to_vec());
                }
            };
            if let Err(e) = f(&mut cred) {
                failure = Some(e);
                return Some(bytes.to_vec());
            }
            match serde_json::to_vec(&cred) {
                Ok(v) => Some(v),
                Err(e) => {
                    failure = Some(e.into());
                    Some(bytes.to_vec())
                }
            }
        })?;

        if let Some(e) = failure {
            return Err(e);
        }
        self.tree.flush()?;
        match updated {
            Some(ivec) => Ok(serde_json::from_slice(&ivec)?),
            None => Err(not_found(id)),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for SledCredentialStore {
    async fn list_valid(&self) -> Result<Vec<Credential>> {
        let mut out: Vec<Credential> = self.all()?.into_iter().filter(|c| c.is_valid).collect();
        out.sort_by(storage_order);
        Ok(out)
    }

    async fn list_for_owner(&self, owner_id: u64) -> Result<Vec<Credential>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|c| c.owner_id == owner_id)
            .collect())
    }

    async fn get(&self, id: u64) -> Result<Credential> {
        self.load(id)?.ok_or_else(|| not_found(id))
    }

    async fn create(&self, owner_id: u64, new: NewCredential) -> Result<Credential> {
        // generate_id starts at 0; ids are 1-based everywhere else.
        let id = self.db.generate_id()? + 1;
        let cred = Credential::from_new(id, owner_id, new);
        self.put(&cred)?;
        Ok(cred)
    }

    async fn update(&self, id: u64, owner_id: u64, patch: CredentialPatch) -> Result<Credential> {
        self.modify(id, |cred| {
            if cred.owner_id != owner_id {
                return Err(not_found(id));
            }
            cred.apply_patch(patch.clone());
            Ok(())
        })
    }

    async fn delete(&self, id: u64, owner_id: u64) -> Result<()> {
        self.owned(id, owner_id)?;
        self.tree.remove(id.to_be_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    async fn apply_health(&self, id: u64, mutation: HealthMutation) -> Result<Credential> {
        let now = now_epoch();
        self.modify(id, |cred| {
            mutation.apply(cred, now);
            Ok(())
        })
    }

    async fn health(&self) -> Result<()> {
        self.tree
            .contains_key(0u64.to_be_bytes())
            .map(|_| ())
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_cred(name: &str, priority: i32) -> NewCredential {
        NewCredential {
            name: name.into(),
            api_key: format!("cookie-{}", name),
            session_key: None,
            priority: Some(priority),
        }
    }

    fn open(dir: &TempDir) -> SledCredentialStore {
        SledCredentialStore::open_path(dir.path().join("creds.db")).unwrap()
    }

    #[tokio::test]
    async fn test_crud_round() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let a = store.create(1, new_cred("a", 0)).await.unwrap();
        let b = store.create(1, new_cred("b", 3)).await.unwrap();
        assert_ne!(a.id, b.id);

        let patched = store
            .update(
                a.id,
                1,
                CredentialPatch {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.name, "renamed");
        assert_eq!(store.get(a.id).await.unwrap().name, "renamed");

        let valid: Vec<u64> = store
            .list_valid()
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(valid, vec![b.id, a.id]);

        store.delete(b.id, 1).await.unwrap();
        assert_eq!(store.list_for_owner(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_updates_apply_in_place() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let c = store.create(4, new_cred("a", 0)).await.unwrap();
        store.apply_health(c.id, HealthMutation::Used).await.unwrap();
        for _ in 0..crate::credentials::ERROR_THRESHOLD {
            store
                .apply_health(c.id, HealthMutation::Error)
                .await
                .unwrap();
        }

        let c = store.get(c.id).await.unwrap();
        assert_eq!(c.usage_count, 1);
        assert!(!c.is_valid);
        assert!(store.list_valid().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_patches_do_not_lose_concurrent_health_updates() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&dir));
        let c = store.create(1, new_cred("a", 0)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..100 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.apply_health(c.id, HealthMutation::Used).await.map(|_| ())
            }));
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                let patch = CredentialPatch {
                    name: Some(format!("name-{}", n)),
                    ..Default::default()
                };
                s.update(c.id, 1, patch).await.map(|_| ())
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let c = store.get(c.id).await.unwrap();
        assert_eq!(c.usage_count, 100);
        assert!(c.name.starts_with("name-"));
    }

    #[tokio::test]
    async fn test_update_checks_owner() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let c = store.create(1, new_cred("a", 0)).await.unwrap();
        let patch = CredentialPatch {
            name: Some("stolen".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update(c.id, 2, patch).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.get(c.id).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.apply_health(42, HealthMutation::Used).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
