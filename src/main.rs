// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use darkroom::auth::HttpIdentityVerifier;
use darkroom::config;
use darkroom::engine::RelayEngine;
use darkroom::ratelimit::{FixedWindowLimiter, RateLimiter};
use darkroom::relay::{self, AppState};
use darkroom::storage::{HttpObjectStore, ObjectStore};
use darkroom::upstream::ReqwestHttpSender;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "darkroom", about = "Streaming relay for AI image generation")]
struct Cli {
    /// Path to the darkroom.yaml config file
    #[arg(long, default_value = "darkroom.yaml", env = "DARKROOM_CONFIG")]
    config: String,

    /// Port to listen on
    #[arg(long, default_value_t = 9460, env = "DARKROOM_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    tracing::info!(%addr, "darkroom starting");

    let source = config::FileSource {
        path: std::path::PathBuf::from(cli.config),
    };
    let config = match config::load_config(&source) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = %config.version,
        environment = %config.environment,
        mode = %config.upstream.response_mode,
        storage = config.storage.is_some(),
        config_hash = %config.config_hash,
        "config loaded"
    );

    let client = reqwest::Client::new();

    let verifier = Arc::new(HttpIdentityVerifier::new(
        client.clone(),
        config.auth.identity_url.clone(),
    ));

    let limiter = Arc::new(FixedWindowLimiter::new(&config.rate_limit));

    // Sweep rolled-over windows so idle callers do not pin memory.
    let sweep = Arc::clone(&limiter);
    let sweep_every = Duration::from_millis(config.rate_limit.window_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            sweep.purge_expired();
        }
    });

    let store = config.storage.as_ref().map(|sc| {
        Arc::new(HttpObjectStore::new(client.clone(), sc)) as Arc<dyn ObjectStore>
    });

    let sender = Arc::new(ReqwestHttpSender::new(client));
    let backend = Arc::new(RelayEngine::new(Arc::clone(&config), sender, store));

    let limiter: Arc<dyn RateLimiter> = limiter;
    let app = relay::router(AppState {
        verifier,
        limiter,
        backend,
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "darkroom listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}
