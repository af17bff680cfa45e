//! Credential health tracking.
//!
//! Transitions are values (`HealthMutation`) handed to the store, which applies
//! them inside its own atomic section. Callers never read, modify and write a
//! credential themselves, so concurrent attempts cannot lose counter updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credentials::{Credential, CredentialStore, Result, ERROR_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMutation {
    /// Successful outbound use.
    Used,
    /// Failed outbound attempt.
    Error,
    /// Explicit revalidation passed.
    Valid,
    /// Explicitly marked invalid.
    Invalid,
    /// Validation probe failed.
    ProbeFailed,
}

impl HealthMutation {
    pub fn apply(self, cred: &mut Credential, now: u64) {
        match self {
            HealthMutation::Used => {
                cred.usage_count = cred.usage_count.saturating_add(1);
                cred.error_count = 0;
                cred.last_used = Some(now);
            }
            HealthMutation::Error => {
                cred.error_count = cred.error_count.saturating_add(1);
                if cred.error_count >= ERROR_THRESHOLD {
                    cred.is_valid = false;
                }
            }
            HealthMutation::Valid => {
                cred.is_valid = true;
                cred.error_count = 0;
                cred.last_validated = Some(now);
            }
            HealthMutation::Invalid => {
                cred.is_valid = false;
                cred.last_validated = Some(now);
            }
            HealthMutation::ProbeFailed => {
                cred.is_valid = false;
                cred.error_count = cred.error_count.saturating_add(1);
                cred.last_validated = Some(now);
            }
        }
        cred.updated_at = now;
    }
}

/// Records outcomes against the credential store.
#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn CredentialStore>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn mark_used(&self, id: u64) -> Result<Credential> {
        self.store.apply_health(id, HealthMutation::Used).await
    }

    pub async fn mark_error(&self, id: u64) -> Result<Credential> {
        let cred = self.store.apply_health(id, HealthMutation::Error).await?;
        if !cred.is_valid && cred.error_count == ERROR_THRESHOLD {
            warn!(
                "Credential {} invalidated after {} consecutive errors",
                id, cred.error_count
            );
        }
        Ok(cred)
    }

    pub async fn mark_valid(&self, id: u64) -> Result<Credential> {
        self.store.apply_health(id, HealthMutation::Valid).await
    }

    pub async fn mark_invalid(&self, id: u64) -> Result<Credential> {
        self.store.apply_health(id, HealthMutation::Invalid).await
    }

    /// Apply the outcome of a validation probe.
    pub async fn record_probe(&self, id: u64, passed: bool) -> Result<Credential> {
        let mutation = if passed {
            HealthMutation::Valid
        } else {
            HealthMutation::ProbeFailed
        };
        let cred = self.store.apply_health(id, mutation).await?;
        info!(
            "Credential {} probe {}",
            id,
            if passed { "passed" } else { "failed" }
        );
        Ok(cred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store_memory::MemoryCredentialStore;
    use crate::credentials::NewCredential;

    fn new_cred(name: &str) -> NewCredential {
        NewCredential {
            name: name.into(),
            api_key: format!("cookie-{}", name),
            session_key: None,
            priority: None,
        }
    }

    #[tokio::test]
    async fn fifth_error_invalidates_until_revalidated() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tracker = HealthTracker::new(store.clone());
        let c = store.create(1, new_cred("a")).await.unwrap();

        for n in 1..ERROR_THRESHOLD {
            let after = tracker.mark_error(c.id).await.unwrap();
            assert!(after.is_valid, "still valid after {} errors", n);
        }
        let after = tracker.mark_error(c.id).await.unwrap();
        assert!(!after.is_valid);
        assert_eq!(after.error_count, ERROR_THRESHOLD);

        // A successful use alone does not revive it.
        let after = tracker.mark_used(c.id).await.unwrap();
        assert!(!after.is_valid);
        assert_eq!(after.error_count, 0);

        let after = tracker.record_probe(c.id, true).await.unwrap();
        assert!(after.is_valid);
        assert!(after.last_validated.is_some());
    }

    #[tokio::test]
    async fn use_resets_error_counter() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tracker = HealthTracker::new(store.clone());
        let c = store.create(1, new_cred("a")).await.unwrap();

        tracker.mark_error(c.id).await.unwrap();
        tracker.mark_error(c.id).await.unwrap();
        let after = tracker.mark_used(c.id).await.unwrap();
        assert_eq!(after.error_count, 0);
        assert_eq!(after.usage_count, 1);
        assert!(after.last_used.is_some());
    }

    #[tokio::test]
    async fn failed_probe_counts_an_error() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tracker = HealthTracker::new(store.clone());
        let c = store.create(1, new_cred("a")).await.unwrap();

        let after = tracker.record_probe(c.id, false).await.unwrap();
        assert!(!after.is_valid);
        assert_eq!(after.error_count, 1);
    }

    #[tokio::test]
    async fn manual_marks_stamp_validation_time() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tracker = HealthTracker::new(store.clone());
        let c = store.create(1, new_cred("a")).await.unwrap();
        assert!(c.last_validated.is_none());

        tracker.mark_error(c.id).await.unwrap();
        let after = tracker.mark_invalid(c.id).await.unwrap();
        assert!(!after.is_valid);
        assert!(after.last_validated.is_some());
        assert_eq!(after.error_count, 1);

        let after = tracker.mark_valid(c.id).await.unwrap();
        assert!(after.is_valid);
        assert_eq!(after.error_count, 0);
        assert!(after.last_validated.is_some());
    }

    #[tokio::test]
    async fn concurrent_uses_are_not_lost() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tracker = HealthTracker::new(store.clone());
        let c = store.create(1, new_cred("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let t = tracker.clone();
            handles.push(tokio::spawn(async move { t.mark_used(c.id).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.get(c.id).await.unwrap().usage_count, 16);
    }
}
