use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::{bearer_token, Session};
use crate::conversion::{render_prompt_text, to_upstream_request};
use crate::credentials::{Credential, CredentialPatch, NewCredential};
use crate::debug_log::{DebugSession, CLIENT_REQUEST_FILE};
use crate::error::GatewayError;
use crate::health::HealthTracker;
use crate::models::messages::{ChatRequest, CountTokensResponse};
use crate::pipeline::{collect_message, spawn_streaming, StreamOutcome};
use crate::rotation::RotationStrategy;
use crate::stream::{StreamTransformer, UpstreamTranslator};
use crate::util::AppState;

type HandlerResult = Result<HttpResponse, GatewayError>;

const ROUTES: &[&str] = &[
    "/health",
    "/status",
    "/v1/messages",
    "/v1/messages/count_tokens",
    "/api/credentials",
    "/api/credentials/stats",
    "/api/credentials/validate/all",
    "/api/credentials/{id}",
    "/api/credentials/{id}/validate",
    "/api/rotation/strategy",
];

/// Register every gateway route.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .route("/v1/messages", web::post().to(messages))
        .route("/v1/messages/count_tokens", web::post().to(count_tokens))
        .service(
            web::scope("/api")
                .route("/credentials", web::get().to(list_credentials))
                .route("/credentials", web::post().to(create_credential))
                .route("/credentials/stats", web::get().to(credential_stats))
                .route(
                    "/credentials/validate/all",
                    web::post().to(validate_all_credentials),
                )
                .route("/credentials/{id}", web::get().to(get_credential))
                .route("/credentials/{id}", web::put().to(update_credential))
                .route("/credentials/{id}", web::delete().to(delete_credential))
                .route(
                    "/credentials/{id}/validate",
                    web::post().to(validate_credential),
                )
                .route("/rotation/strategy", web::get().to(get_strategy))
                .route("/rotation/strategy", web::put().to(set_strategy)),
        );
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid request body: {}", e)))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Service status: version, active rotation policy and available routes.
async fn status(state: web::Data<AppState>) -> HttpResponse {
    let store_ok = state.store.health().await.is_ok();
    HttpResponse::Ok().json(serde_json::json!({
        "name": "morphgate",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream_url": state.config.upstream_url,
        "default_model": state.config.default_model,
        "supported_models": state.config.supported_models,
        "rotation_strategy": state.pool.strategy().await,
        "store_ok": store_ok,
        "debug_capture": state.debug.is_some(),
        "routes": ROUTES,
    }))
}

// ============================================================================
// Messages
// ============================================================================

async fn messages(state: web::Data<AppState>, body: Bytes) -> HandlerResult {
    let req: ChatRequest = parse_body(&body)?;
    let request_id = uuid::Uuid::new_v4().simple().to_string();

    let debug: Option<DebugSession> = match &state.debug {
        Some(recorder) => recorder.begin(&request_id).await,
        None => None,
    };
    if let Some(d) = &debug {
        d.write_json(CLIENT_REQUEST_FILE, &req).await;
    }

    // Rejected models never reach credential selection.
    let upstream_req = to_upstream_request(&req, &state.policy)?;
    let input_tokens = state.estimator.count(&render_prompt_text(&req));
    info!(
        "messages request_id={} model={} stream={} input_tokens~{}",
        request_id,
        upstream_req.model,
        req.wants_stream(),
        input_tokens
    );

    let cred = state.pool.select().await?;
    let resp = match state.upstream.send(&upstream_req, &cred, debug.as_ref()).await {
        Ok(r) => r,
        Err(e) => {
            record_failure(&state.health, &cred, &e.to_string()).await;
            return Err(e);
        }
    };

    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let translator = UpstreamTranslator::new(StreamTransformer::new(
        message_id,
        upstream_req.model.clone(),
        input_tokens,
        state.estimator.clone(),
    ));

    if !req.wants_stream() {
        let result = collect_message(resp.bytes_stream(), translator, debug.as_ref()).await;
        return match result {
            Ok(message) => {
                if let Err(e) = state.health.mark_used(cred.id).await {
                    warn!("Failed to record use of credential {}: {}", cred.id, e);
                }
                if let (Some(d), Ok(bytes)) = (&debug, serde_json::to_vec(&message)) {
                    d.record_client(&bytes).await;
                }
                Ok(HttpResponse::Ok().json(message))
            }
            Err(reason) => {
                record_failure(&state.health, &cred, &reason).await;
                Err(GatewayError::UpstreamUnavailable(reason))
            }
        };
    }

    let (stream, producer) = spawn_streaming(
        resp.bytes_stream(),
        translator,
        state.config.stream_buffer,
        state.config.ping_interval,
        debug,
    );

    let health = state.health.clone();
    tokio::spawn(async move {
        match producer.await {
            Ok(StreamOutcome::Completed) => {
                if let Err(e) = health.mark_used(cred.id).await {
                    warn!("Failed to record use of credential {}: {}", cred.id, e);
                }
            }
            Ok(StreamOutcome::Failed(reason)) => record_failure(&health, &cred, &reason).await,
            Ok(StreamOutcome::Cancelled) => {
                info!("Client disconnected; credential {} left unchanged", cred.id)
            }
            Err(e) => warn!("Stream producer task failed: {}", e),
        }
    });

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(stream))
}

async fn record_failure(health: &HealthTracker, cred: &Credential, reason: &str) {
    warn!("Request with credential {} failed: {}", cred.id, reason);
    if let Err(e) = health.mark_error(cred.id).await {
        warn!("Failed to record error for credential {}: {}", cred.id, e);
    }
}

async fn count_tokens(state: web::Data<AppState>, body: Bytes) -> HandlerResult {
    let req: ChatRequest = parse_body(&body)?;
    let input_tokens = state.estimator.count(&render_prompt_text(&req));
    Ok(HttpResponse::Ok().json(CountTokensResponse { input_tokens }))
}

// ============================================================================
// Credential management
// ============================================================================

async fn session(state: &AppState, req: &HttpRequest) -> Result<Session, GatewayError> {
    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = bearer_token(auth).ok_or(GatewayError::Unauthorized)?;
    state
        .verifier
        .verify(token)
        .await
        .ok_or(GatewayError::Unauthorized)
}

async fn owned_credential(state: &AppState, id: u64, owner_id: u64) -> Result<Credential, GatewayError> {
    let cred = state.store.get(id).await?;
    if cred.owner_id != owner_id {
        return Err(GatewayError::NotFound(format!("credential {}", id)));
    }
    Ok(cred)
}

async fn list_credentials(state: web::Data<AppState>, req: HttpRequest) -> HandlerResult {
    let session = session(&state, &req).await?;
    let creds: Vec<Credential> = state
        .store
        .list_for_owner(session.owner_id)
        .await?
        .iter()
        .map(Credential::masked)
        .collect();
    Ok(HttpResponse::Ok().json(creds))
}

async fn credential_stats(state: web::Data<AppState>, req: HttpRequest) -> HandlerResult {
    let session = session(&state, &req).await?;
    let stats = state.store.stats(session.owner_id).await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn create_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Bytes,
) -> HandlerResult {
    let session = session(&state, &req).await?;
    let new: NewCredential = parse_body(&body)?;
    if new.name.trim().is_empty() || new.api_key.trim().is_empty() {
        return Err(GatewayError::Validation(
            "name and api_key are required".to_string(),
        ));
    }
    let cred = state.store.create(session.owner_id, new).await?;
    info!("Owner {} added credential {}", session.owner_id, cred.id);
    Ok(HttpResponse::Created().json(cred.masked()))
}

async fn get_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> HandlerResult {
    let session = session(&state, &req).await?;
    let cred = owned_credential(&state, path.into_inner(), session.owner_id).await?;
    Ok(HttpResponse::Ok().json(cred.masked()))
}

/// PUT body: editable fields plus an optional manual validity flag.
#[derive(Debug, Deserialize)]
struct CredentialUpdate {
    #[serde(flatten)]
    patch: CredentialPatch,
    #[serde(default)]
    is_valid: Option<bool>,
}

async fn update_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
    body: Bytes,
) -> HandlerResult {
    let session = session(&state, &req).await?;
    let CredentialUpdate { patch, is_valid } = parse_body(&body)?;
    let id = path.into_inner();
    let mut cred = state.store.update(id, session.owner_id, patch).await?;
    cred = match is_valid {
        Some(true) => state.health.mark_valid(id).await?,
        Some(false) => state.health.mark_invalid(id).await?,
        None => cred,
    };
    Ok(HttpResponse::Ok().json(cred.masked()))
}

async fn delete_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> HandlerResult {
    let session = session(&state, &req).await?;
    let id = path.into_inner();
    state.store.delete(id, session.owner_id).await?;
    info!("Owner {} deleted credential {}", session.owner_id, id);
    Ok(HttpResponse::NoContent().finish())
}

async fn validate_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<u64>,
) -> HandlerResult {
    let session = session(&state, &req).await?;
    let cred = owned_credential(&state, path.into_inner(), session.owner_id).await?;
    let report = state.probe.validate(&cred).await;
    let updated = state.store.get(cred.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "report": report,
        "credential": updated.masked(),
    })))
}

async fn validate_all_credentials(state: web::Data<AppState>, req: HttpRequest) -> HandlerResult {
    let session = session(&state, &req).await?;
    let results = state.probe.validate_owner(session.owner_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
struct StrategyBody {
    strategy: RotationStrategy,
}

async fn get_strategy(state: web::Data<AppState>, req: HttpRequest) -> HandlerResult {
    session(&state, &req).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "strategy": state.pool.strategy().await })))
}

async fn set_strategy(state: web::Data<AppState>, req: HttpRequest, body: Bytes) -> HandlerResult {
    let session = session(&state, &req).await?;
    let StrategyBody { strategy } = parse_body(&body)?;
    state.pool.set_strategy(strategy).await;
    info!("Owner {} switched rotation to {}", session.owner_id, strategy);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "strategy": strategy })))
}
