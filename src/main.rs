use std::path::PathBuf;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use morphgate::config::{GatewayConfig, StoreBackend};
use morphgate::rotation::RotationStrategy;
use morphgate::server::config_routes;
use morphgate::util::{
    build_http_client_from_env, cors_config_from_env, env_bind_addr, init_tracing, open_store,
    AppState,
};

/// Messages API gateway for the MorphLLM backend.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (falls back to BIND_ADDR, then 0.0.0.0:8088)
    #[arg(long, env = "MORPHGATE_BIND_ADDR")]
    bind: Option<String>,

    /// Backend chat endpoint (overrides MORPHGATE_UPSTREAM_URL)
    #[arg(long)]
    upstream_url: Option<String>,

    /// Initial rotation strategy: round_robin, priority or least_used
    #[arg(long)]
    strategy: Option<RotationStrategy>,

    /// Persist credentials in a sled database at this path instead of memory
    #[arg(long)]
    sled_path: Option<PathBuf>,

    /// Write per-request debug captures under this directory
    #[arg(long)]
    debug_dir: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(url) = args.upstream_url {
        config.upstream_url = url;
    }
    if let Some(strategy) = args.strategy {
        config.rotation_strategy = strategy;
    }
    if let Some(path) = args.sled_path {
        config.store = StoreBackend::Sled(path);
    }
    if let Some(dir) = args.debug_dir {
        config.debug_dir = Some(dir);
    }

    let store = open_store(&config.store).context("opening credential store")?;
    info!(
        "Upstream: {} | default model: {} | rotation: {} | store: {:?}",
        config.upstream_url, config.default_model, config.rotation_strategy, config.store
    );
    if let Some(dir) = &config.debug_dir {
        info!("Debug captures enabled under {}", dir.display());
    }

    let state = web::Data::new(AppState::new(config, store, build_http_client_from_env()));
    let bind = args.bind.unwrap_or_else(env_bind_addr);
    info!("morphgate listening on {}", bind);

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&bind)
    .with_context(|| format!("binding {}", bind))?
    .run()
    .await?;

    Ok(())
}
