//! Credential validation probe.
//!
//! A probe is one small real chat turn sent through the same converter, client
//! and stream decoder that serve live traffic. A credential passes when the
//! backend neither refuses it (401/403) nor answers with something other than an
//! SSE frame. That is a liveness check; the body is decoded only to report how
//! many events it produced.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::conversion::{to_upstream_request, ModelPolicy};
use crate::credentials::{Credential, CredentialStore};
use crate::health::HealthTracker;
use crate::models::messages::{ChatMessage, ChatRequest, MessageContent, Role};
use crate::stream::{trim_ascii, StreamTransformer, UpstreamTranslator};
use crate::tokenizer::TokenEstimator;
use crate::upstream::UpstreamClient;

const PROBE_MAX_TOKENS: u32 = 1024;
const PROBE_PROMPT: &str = "Hello!";
const PROBE_CONCURRENCY: usize = 4;
const FRAME_MARKER: &[u8] = b"data:";

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub credential_id: u64,
    pub valid: bool,
    pub status: Option<u16>,
    /// Front events the body decoded to.
    pub events: usize,
    pub reason: Option<String>,
}

pub struct ValidationProbe {
    client: UpstreamClient,
    policy: ModelPolicy,
    estimator: Arc<dyn TokenEstimator>,
    health: HealthTracker,
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl ValidationProbe {
    pub fn new(
        client: UpstreamClient,
        policy: ModelPolicy,
        estimator: Arc<dyn TokenEstimator>,
        health: HealthTracker,
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            policy,
            estimator,
            health,
            store,
            timeout,
        }
    }

    fn probe_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.policy.default_model.clone(),
            max_tokens: PROBE_MAX_TOKENS,
            messages: vec![ChatMessage {
                role: Role::User,
                content: MessageContent::Text(PROBE_PROMPT.to_string()),
            }],
            system: None,
            tools: None,
            stream: Some(true),
            temperature: None,
            stop_sequences: None,
        }
    }

    /// Probe without recording anything.
    pub async fn probe(&self, cred: &Credential) -> ProbeReport {
        let mut report = ProbeReport {
            credential_id: cred.id,
            valid: false,
            status: None,
            events: 0,
            reason: None,
        };

        let upstream = match to_upstream_request(&self.probe_request(), &self.policy) {
            Ok(u) => u,
            Err(e) => {
                report.reason = Some(e.to_string());
                return report;
            }
        };

        let resp = match self
            .client
            .send_raw(&upstream, cred, Some(self.timeout), None)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                report.reason = Some(e.to_string());
                return report;
            }
        };

        let status = resp.status().as_u16();
        report.status = Some(status);
        if status == 401 || status == 403 {
            report.reason = Some(format!("backend refused credential ({})", status));
            return report;
        }

        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                report.reason = Some(format!("reading probe body: {}", e));
                return report;
            }
        };

        let mut translator = UpstreamTranslator::new(StreamTransformer::new(
            format!("probe_{}", cred.id),
            upstream.model.clone(),
            0,
            self.estimator.clone(),
        ));
        report.events = 1 + translator.push(&body).len() + translator.finish().len();

        if trim_ascii(&body).starts_with(FRAME_MARKER) {
            report.valid = true;
        } else {
            report.reason = Some(format!(
                "unexpected probe response (status {}): {}",
                status,
                String::from_utf8_lossy(&body[..body.len().min(120)])
            ));
        }
        report
    }

    /// Probe and record the result against the credential.
    pub async fn validate(&self, cred: &Credential) -> ProbeReport {
        let report = self.probe(cred).await;
        if let Some(reason) = &report.reason {
            warn!("Credential {} failed validation: {}", cred.id, reason);
        }
        if let Err(e) = self.health.record_probe(cred.id, report.valid).await {
            warn!("Failed to record probe for credential {}: {}", cred.id, e);
        }
        report
    }

    /// Validate every credential an owner holds.
    pub async fn validate_owner(
        &self,
        owner_id: u64,
    ) -> crate::credentials::Result<BTreeMap<u64, bool>> {
        let creds = self.store.list_for_owner(owner_id).await?;
        info!("Validating {} credentials for owner {}", creds.len(), owner_id);

        let results: Vec<(u64, bool)> = stream::iter(creds)
            .map(|c| async move {
                let report = self.validate(&c).await;
                (c.id, report.valid)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;
        Ok(results.into_iter().collect())
    }
}
