//! Credential rotation pool.
//!
//! One `RotationPool` is built at startup and shared through `AppState`. Each
//! `select` reads the current valid set from the store and applies the active
//! strategy under a single async mutex, so the cursor and the strategy change
//! atomically with respect to concurrent selections.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::credentials::{Credential, CredentialStore};
use crate::error::GatewayError;

/// Credential selection policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Cycle through valid credentials in id order
    #[default]
    RoundRobin,
    /// Highest priority first
    Priority,
    /// Lowest usage counter first
    LeastUsed,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::RoundRobin => "round_robin",
            RotationStrategy::Priority => "priority",
            RotationStrategy::LeastUsed => "least_used",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(RotationStrategy::RoundRobin),
            "priority" => Ok(RotationStrategy::Priority),
            "least_used" | "leastused" => Ok(RotationStrategy::LeastUsed),
            other => Err(format!("unknown rotation strategy '{}'", other)),
        }
    }
}

struct PoolState {
    strategy: RotationStrategy,
    cursor: usize,
}

pub struct RotationPool {
    store: Arc<dyn CredentialStore>,
    state: Mutex<PoolState>,
}

impl RotationPool {
    pub fn new(store: Arc<dyn CredentialStore>, strategy: RotationStrategy) -> Self {
        Self {
            store,
            state: Mutex::new(PoolState {
                strategy,
                cursor: 0,
            }),
        }
    }

    /// Pick one credential for the next outbound call.
    pub async fn select(&self) -> Result<Credential, GatewayError> {
        let mut state = self.state.lock().await;
        let mut valid = self.store.list_valid().await?;
        if valid.is_empty() {
            return Err(GatewayError::CredentialExhausted);
        }

        let picked = match state.strategy {
            RotationStrategy::RoundRobin => {
                // Usage changes the storage order, so cycle over a stable one.
                valid.sort_by_key(|c| c.id);
                let idx = state.cursor % valid.len();
                state.cursor = state.cursor.wrapping_add(1);
                valid.swap_remove(idx)
            }
            RotationStrategy::Priority => {
                let idx = first_best(&valid, |a, b| a.priority > b.priority);
                valid.swap_remove(idx)
            }
            RotationStrategy::LeastUsed => {
                let idx = first_best(&valid, |a, b| a.usage_count < b.usage_count);
                valid.swap_remove(idx)
            }
        };

        info!(
            "Selected credential {} ({}) via {}",
            picked.id, picked.name, state.strategy
        );
        Ok(picked)
    }

    pub async fn strategy(&self) -> RotationStrategy {
        self.state.lock().await.strategy
    }

    /// Switch strategy; the round-robin cursor starts over.
    pub async fn set_strategy(&self, strategy: RotationStrategy) {
        let mut state = self.state.lock().await;
        state.strategy = strategy;
        state.cursor = 0;
        info!("Rotation strategy set to {}", strategy);
    }
}

/// Index of the first credential no later one beats; ties keep storage order.
fn first_best(valid: &[Credential], beats: impl Fn(&Credential, &Credential) -> bool) -> usize {
    let mut best = 0;
    for (i, c) in valid.iter().enumerate().skip(1) {
        if beats(c, &valid[best]) {
            best = i;
        }
    }
    best
}
