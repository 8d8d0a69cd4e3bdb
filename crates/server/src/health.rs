use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use ragway_agent::SessionOrchestrator;
use ragway_core::registry::CollectionRegistry;
use ragway_db::{migrations, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub registry: Arc<CollectionRegistry>,
    pub orchestrator: SessionOrchestrator,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub collections: usize,
    pub active_sessions: usize,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "ragway-server orchestrator initialized".to_string(),
        },
        database,
        collections: state.registry.collection_ids().len(),
        active_sessions: state.orchestrator.active_sessions(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match migrations::applied_version(pool).await {
        Ok(Some(version)) => HealthCheck {
            status: "ready",
            detail: format!("database reachable, schema version {version}"),
        },
        Ok(None) => HealthCheck {
            status: "degraded",
            detail: "database reachable but migrations have not been applied".to_string(),
        },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
