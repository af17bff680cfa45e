//! Gateway configuration.
//!
//! Every setting has an environment variable and a default so the binary runs with
//! no configuration at all. `main.rs` layers CLI flags on top.
//!
//! Environment:
//! - MORPHGATE_UPSTREAM_URL             backend chat endpoint
//! - MORPHGATE_DEFAULT_MODEL            model used when a request names none
//! - MORPHGATE_SUPPORTED_MODELS         comma-separated allow-list (default: the default model)
//! - MORPHGATE_ROTATION_STRATEGY        round_robin | priority | least_used
//! - MORPHGATE_STREAM_BUFFER            bounded channel capacity between stream stages
//! - MORPHGATE_PING_INTERVAL_SECONDS    idle time before a `ping` event is sent
//! - MORPHGATE_PROBE_TIMEOUT_SECONDS    validation probe timeout
//! - MORPHGATE_STORE                    memory | sled
//! - MORPHGATE_SLED_PATH                sled database path
//! - MORPHGATE_DEBUG_DIR                enables the verbatim debug side-channel
//! - MORPHGATE_DEBUG_MAX_FOLDERS        retained debug request folders
//! - MORPHGATE_ACCESS_TOKENS            `token=owner_id,...` for the management API

use std::path::PathBuf;
use std::time::Duration;

use crate::rotation::RotationStrategy;

pub const DEFAULT_UPSTREAM_URL: &str = "https://www.morphllm.com/api/warpgrep-chat";
pub const DEFAULT_MODEL: &str = "claude-opus-4-5-20251101";

/// Where credentials live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sled(PathBuf),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream_url: String,
    pub default_model: String,
    pub supported_models: Vec<String>,
    pub rotation_strategy: RotationStrategy,
    pub stream_buffer: usize,
    pub ping_interval: Duration,
    pub probe_timeout: Duration,
    pub store: StoreBackend,
    pub debug_dir: Option<PathBuf>,
    pub debug_max_folders: usize,
    pub access_tokens: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            supported_models: vec![DEFAULT_MODEL.to_string()],
            rotation_strategy: RotationStrategy::RoundRobin,
            stream_buffer: 32,
            ping_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(30),
            store: StoreBackend::Memory,
            debug_dir: None,
            debug_max_folders: 50,
            access_tokens: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let upstream_url = env_nonempty("MORPHGATE_UPSTREAM_URL").unwrap_or(defaults.upstream_url);
        let default_model =
            env_nonempty("MORPHGATE_DEFAULT_MODEL").unwrap_or(defaults.default_model);

        let mut supported_models: Vec<String> = env_nonempty("MORPHGATE_SUPPORTED_MODELS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if supported_models.is_empty() {
            supported_models.push(default_model.clone());
        }

        let rotation_strategy = match env_nonempty("MORPHGATE_ROTATION_STRATEGY") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Unknown MORPHGATE_ROTATION_STRATEGY '{}'; using round_robin",
                    raw
                );
                RotationStrategy::RoundRobin
            }),
            None => defaults.rotation_strategy,
        };

        let stream_buffer = env_parse("MORPHGATE_STREAM_BUFFER")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.stream_buffer);

        // Zero would make the keepalive timer fire in a busy loop.
        let ping_interval = positive_seconds(env_nonempty("MORPHGATE_PING_INTERVAL_SECONDS"))
            .unwrap_or(defaults.ping_interval);

        let probe_timeout = positive_seconds(env_nonempty("MORPHGATE_PROBE_TIMEOUT_SECONDS"))
            .unwrap_or(defaults.probe_timeout);

        let store = match env_nonempty("MORPHGATE_STORE")
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            Some("sled") => StoreBackend::Sled(
                env_nonempty("MORPHGATE_SLED_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/credentials.db")),
            ),
            _ => StoreBackend::Memory,
        };

        let debug_dir = env_nonempty("MORPHGATE_DEBUG_DIR").map(PathBuf::from);
        let debug_max_folders =
            env_parse("MORPHGATE_DEBUG_MAX_FOLDERS").unwrap_or(defaults.debug_max_folders);

        Self {
            upstream_url,
            default_model,
            supported_models,
            rotation_strategy,
            stream_buffer,
            ping_interval,
            probe_timeout,
            store,
            debug_dir,
            debug_max_folders,
            access_tokens: env_nonempty("MORPHGATE_ACCESS_TOKENS"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}

fn positive_seconds(raw: Option<String>) -> Option<Duration> {
    raw.and_then(|v| v.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_only_the_default_model() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.supported_models, vec![DEFAULT_MODEL.to_string()]);
        assert_eq!(cfg.rotation_strategy, RotationStrategy::RoundRobin);
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert!(cfg.debug_dir.is_none());
    }

    #[test]
    fn zero_or_garbage_seconds_fall_back() {
        assert_eq!(positive_seconds(Some("0".into())), None);
        assert_eq!(positive_seconds(Some("soon".into())), None);
        assert_eq!(positive_seconds(None), None);
        assert_eq!(
            positive_seconds(Some("20".into())),
            Some(Duration::from_secs(20))
        );
    }
}
