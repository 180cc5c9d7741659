use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::keys::KeySet;
use crate::pipeline::walker::StepReport;
use crate::request::{sign_document_text, verify_document_text};
use crate::validate::require;

#[derive(Clone, Default)]
pub struct AppState {
    pub keys: Option<Arc<KeySet>>,
    /// Used when a sign request does not name a key.
    pub default_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub repository: String,
    pub steps: String,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    pub steps: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub repository: String,
    pub steps: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub trusted: bool,
    pub steps: Vec<StepReport>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(|| async move { (StatusCode::OK, "Ok").into_response() }))
        .route("/sign", post(sign_handler))
        .route("/verify", post(verify_handler))
        .with_state(state)
}

pub async fn run(host: String, port: u16, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    tracing::info!(address = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("serving HTTP")?;

    Ok(())
}

fn configured_keys(state: &AppState) -> Result<Arc<KeySet>, ServerError> {
    state.keys.clone().ok_or(ServerError::KeysNotConfigured)
}

async fn sign_handler(
    State(state): State<AppState>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, ServerError> {
    require("repository", &request.repository)?;
    require("steps", &request.steps)?;
    let keys = configured_keys(&state)?;
    let key_id = request.key_id.or(state.default_key_id);

    // Signing is CPU-bound; RSA in particular should not stall the runtime.
    let steps = tokio::task::spawn_blocking(move || {
        sign_document_text(&request.steps, &request.repository, &keys, key_id.as_deref())
    })
    .await
    .context("signing task panicked")??;

    Ok(Json(SignResponse { steps }))
}

async fn verify_handler(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ServerError> {
    require("repository", &request.repository)?;
    require("steps", &request.steps)?;
    let keys = configured_keys(&state)?;

    let report = tokio::task::spawn_blocking(move || {
        verify_document_text(&request.steps, &request.repository, &keys)
    })
    .await
    .context("verification task panicked")??;

    Ok(Json(VerifyResponse {
        trusted: report.is_trusted(),
        steps: report.steps,
    }))
}
