use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod runs;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/github/webhook", post(webhook::webhook))
        .route("/api/runs/{run_id}", get(runs::get_run))
}

async fn health() -> &'static str { "ok" }
