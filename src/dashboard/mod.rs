use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::Broker;

#[derive(Clone)]
pub struct DashboardState {
    pub broker: Arc<Broker>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    payload: String,
    scope: String,
    affinities: Vec<String>,
    created_at: String,
}

/// Routes of the read-only status API.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, token: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.broker.status().await)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .broker
        .pending_jobs()
        .await
        .into_iter()
        .map(|job| JobResponse {
            id: job.id.to_string(),
            payload: job.payload,
            scope: job.scope,
            affinities: job.affinities.into_iter().collect(),
            created_at: job.created_at.to_rfc3339(),
        })
        .collect();

    Json(jobs)
}
