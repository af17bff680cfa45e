use std::sync::Arc;

use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::{SessionVerifier, StaticTokenVerifier};
use crate::config::{GatewayConfig, StoreBackend};
use crate::conversion::ModelPolicy;
use crate::credential_store_memory::MemoryCredentialStore;
use crate::credential_store_sled::SledCredentialStore;
use crate::credentials::CredentialStore;
use crate::debug_log::DebugRecorder;
use crate::health::HealthTracker;
use crate::rotation::RotationPool;
use crate::tokenizer::{default_estimator, TokenEstimator};
use crate::upstream::UpstreamClient;
use crate::validator::ValidationProbe;

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to .envfile, then default .env
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none"
        && std::path::Path::new(".envfile").is_file()
        && dotenvy::from_filename(".envfile").is_ok()
    {
        env_source = ".envfile".into();
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Get the bind address for the HTTP server from env or default to 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    std::env::var("MORPHGATE_BIND_ADDR")
        .or_else(|_| std::env::var("BIND_ADDR"))
        .unwrap_or_else(|_| "0.0.0.0:8088".into())
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - MORPHGATE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - MORPHGATE_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / http_proxy             -> HTTP proxy
/// - HTTPS_PROXY / https_proxy           -> HTTPS proxy
/// - MORPHGATE_CONNECT_TIMEOUT_SECONDS   -> connect timeout (u64)
///
/// No overall timeout is set: chat responses stream for as long as the backend
/// keeps producing.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("MORPHGATE_CONNECT_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.connect_timeout(std::time::Duration::from_secs(n));
        }
    }

    let no_proxy = std::env::var("MORPHGATE_NO_PROXY")
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false);

    if no_proxy {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("MORPHGATE_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Open the configured credential store.
pub fn open_store(backend: &StoreBackend) -> anyhow::Result<Arc<dyn CredentialStore>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryCredentialStore::new())),
        StoreBackend::Sled(path) => Ok(Arc::new(SledCredentialStore::open_path(path.clone())?)),
    }
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub policy: ModelPolicy,
    pub store: Arc<dyn CredentialStore>,
    pub pool: Arc<RotationPool>,
    pub health: HealthTracker,
    pub upstream: UpstreamClient,
    pub probe: Arc<ValidationProbe>,
    pub estimator: Arc<dyn TokenEstimator>,
    /// Present when MORPHGATE_DEBUG_DIR is set.
    pub debug: Option<DebugRecorder>,
    pub verifier: Arc<dyn SessionVerifier>,
}

impl AppState {
    /// Wire every component from configuration and an already opened store.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn CredentialStore>,
        http: reqwest::Client,
    ) -> Self {
        Self::with_estimator(config, store, http, default_estimator())
    }

    pub fn with_estimator(
        config: GatewayConfig,
        store: Arc<dyn CredentialStore>,
        http: reqwest::Client,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let policy = ModelPolicy::from_config(&config);
        let pool = Arc::new(RotationPool::new(store.clone(), config.rotation_strategy));
        let health = HealthTracker::new(store.clone());
        let upstream = UpstreamClient::new(http, config.upstream_url.clone());
        let probe = Arc::new(ValidationProbe::new(
            upstream.clone(),
            policy.clone(),
            estimator.clone(),
            health.clone(),
            store.clone(),
            config.probe_timeout,
        ));
        let debug = config
            .debug_dir
            .clone()
            .map(|dir| DebugRecorder::new(dir, config.debug_max_folders));
        let verifier = StaticTokenVerifier::from_table(config.access_tokens.as_deref());
        if verifier.is_empty() {
            tracing::warn!(
                "No MORPHGATE_ACCESS_TOKENS configured; management API will refuse all requests"
            );
        }

        Self {
            config,
            policy,
            store,
            pool,
            health,
            upstream,
            probe,
            estimator,
            debug,
            verifier: Arc::new(verifier),
        }
    }
}

/// Build a Messages-protocol error body: `{"type":"error","error":{"type":..,"message":..}}`.
pub fn error_response(status: StatusCode, kind: &str, msg: &str) -> HttpResponse {
    let body = serde_json::json!({
        "type": "error",
        "error": { "type": kind, "message": msg }
    });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Build CORS configuration from environment variables.
///
/// Environment:
/// - CORS_ALLOWED_ORIGINS = "*" | comma-separated origins (default: any)
/// - CORS_ALLOWED_METHODS = "*" | comma-separated methods (default: any)
/// - CORS_ALLOWED_HEADERS = "*" | comma-separated headers (default: any)
/// - CORS_ALLOW_CREDENTIALS = 1|true|yes|on
/// - CORS_MAX_AGE = seconds
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
        let s = origins.trim();
        if s == "*" {
            cors = cors.allow_any_origin();
        } else {
            for part in s.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
    } else {
        cors = cors.allow_any_origin();
    }

    if let Ok(methods) = std::env::var("CORS_ALLOWED_METHODS") {
        let s = methods.trim();
        if s == "*" {
            cors = cors.allow_any_method();
        } else {
            let methods: Vec<&str> = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
    } else {
        cors = cors.allow_any_method();
    }

    if let Ok(headers) = std::env::var("CORS_ALLOWED_HEADERS") {
        let s = headers.trim();
        if s == "*" {
            cors = cors.allow_any_header();
        } else {
            for h in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_header(h);
            }
        }
    } else {
        cors = cors.allow_any_header();
    }

    if let Ok(val) = std::env::var("CORS_ALLOW_CREDENTIALS") {
        let v = val.trim().to_ascii_lowercase();
        if v == "1" || v == "true" || v == "yes" || v == "on" {
            cors = cors.supports_credentials();
        }
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn error_body_uses_messages_shape() {
        let resp = error_response(StatusCode::BAD_REQUEST, "invalid_request_error", "nope");
        assert_eq!(resp.status().as_u16(), 400);
        let bytes = resp.into_body().try_into_bytes().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"]["type"], "invalid_request_error");
        assert_eq!(v["error"]["message"], "nope");
    }

    #[test]
    fn memory_store_opens() {
        assert!(open_store(&StoreBackend::Memory).is_ok());
    }
}
