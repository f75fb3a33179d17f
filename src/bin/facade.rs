//! `botster-hv-facade` — the thin HTTP boundary in front of the
//! supervisor's `system_check` API worker (spec §4.7). Exposes `/health`
//! and `/state` only; no operator-action routes, per the façade's
//! "interfaces only" scoping.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use botster_hv::facade::{ClientFacadeQuery, FacadeQuery};
use botster_hv::transport::AsyncClient;
use clap::Parser;
use serde_json::json;

/// Minimal HTTP façade over the supervisor's `system_check` identity.
#[derive(Debug, Parser)]
#[command(name = "botster-hv-facade", version, about)]
struct Cli {
    /// Address this HTTP server binds.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind_addr: String,
    /// Address of the supervisor's `system_check` API worker.
    #[arg(long, default_value = "127.0.0.1:5557")]
    system_check_addr: String,
}

struct AppState {
    query: Arc<dyn FacadeQuery>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut endpoints = HashMap::new();
    endpoints.insert("system_check".to_string(), cli.system_check_addr.clone());
    let client = AsyncClient::new(endpoints);
    let state = Arc::new(AppState {
        query: Arc::new(ClientFacadeQuery::new(client)),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/state", get(state_route))
        .with_state(state);

    tracing::info!(bind_addr = %cli.bind_addr, system_check_addr = %cli.system_check_addr, "starting facade");
    let listener = tokio::net::TcpListener::bind(&cli.bind_addr).await.context("binding facade http listener")?;
    axum::serve(listener, app).await.context("serving facade http")?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn state_route(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.query.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}
