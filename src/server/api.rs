//! Status and control HTTP API.
//!
//! - POST /v1/sequences
//! - GET /v1/sequences/{id}
//! - DELETE /v1/sequences/{id}
//! - GET /v1/queue
//! - GET /v1/cache/stats
//! - GET /v1/budgets
//! - GET /v1/workers
//! - GET /v1/transfers
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::budget::BudgetSnapshot;
use crate::cache::manager::TierStats;
use crate::config::Config;
use crate::inference::engine::ServingEngine;
use crate::placement::worker::WorkerSnapshot;
use crate::scheduler::admission::{Decision, QueueSnapshot, SchedulerError, Submission};
use crate::scheduler::sequence::{RejectReason, SequenceId, SequenceRequest, SequenceStatus};
use crate::transfer::engine::TransferRecord;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<ServingEngine>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/sequences", post(submit_sequence))
        .route(
            "/v1/sequences/{id}",
            get(sequence_status).delete(cancel_sequence),
        )
        .route("/v1/queue", get(queue))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/budgets", get(budgets))
        .route("/v1/workers", get(workers))
        .route("/v1/transfers", get(transfers))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub total_pages: usize,
    pub tiers: Vec<TierStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct TierStatsResponse {
    pub name: String,
    pub page_count: usize,
    pub bytes_used: u64,
    pub capacity: u64,
    pub utilization: f64,
}

impl From<&TierStats> for TierStatsResponse {
    fn from(stats: &TierStats) -> Self {
        Self {
            name: stats
                .tier
                .map(|t| t.to_string())
                .unwrap_or_else(|| "total".to_string()),
            page_count: stats.page_count,
            bytes_used: stats.bytes_used,
            capacity: stats.capacity,
            utilization: stats.usage_fraction(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub tenants: usize,
    pub workers: usize,
    pub queue: QueueSnapshot,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::UnknownSequence(_) => StatusCode::NOT_FOUND,
        SchedulerError::EmptyPrompt => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn submit_sequence(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SequenceRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let tenant = req.tenant.clone();
    let submission = state.engine.submit(req).map_err(api_error)?;
    let status = match submission.decision {
        Decision::Admitted | Decision::Queued => StatusCode::ACCEPTED,
        Decision::Rejected {
            reason: RejectReason::QueueFull | RejectReason::RateLimited,
        } => StatusCode::TOO_MANY_REQUESTS,
        Decision::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    info!(sequence = %submission.id, tenant = %tenant, decision = ?submission.decision, "Submitted");
    Ok((status, Json(submission)))
}

async fn sequence_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SequenceId>,
) -> Result<Json<SequenceStatus>, ApiError> {
    state
        .engine
        .status(id)
        .map(Json)
        .ok_or_else(|| api_error(SchedulerError::UnknownSequence(id)))
}

async fn cancel_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SequenceId>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel(id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue(State(state): State<Arc<AppState>>) -> Json<QueueSnapshot> {
    Json(state.engine.queue())
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        total_pages: state.engine.cache().len(),
        tiers: state
            .engine
            .cache_stats()
            .iter()
            .map(TierStatsResponse::from)
            .collect(),
    })
}

async fn budgets(State(state): State<Arc<AppState>>) -> Json<Vec<BudgetSnapshot>> {
    Json(state.engine.budget_snapshot())
}

async fn workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.engine.workers())
}

async fn transfers(State(state): State<Arc<AppState>>) -> Json<Vec<TransferRecord>> {
    Json(state.engine.transfer_history())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tenants: state.config.tenants.len(),
        workers: state.config.workers.len(),
        queue: state.engine.queue(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::budget::BudgetTracker;
    use crate::cache::manager::CacheManager;
    use crate::cache::page::Tier;
    use crate::cache::store::{MemoryStore, TierStore};
    use crate::inference::backend::SimulatedBackend;
    use crate::inference::engine::EngineParts;
    use crate::metrics::Metrics;
    use crate::transfer::engine::TransferEngine;

    fn app() -> Router {
        let mut config = Config::default();
        config.fill_defaults();
        config.backend.time_scale = 0.0;
        let metrics = Arc::new(Metrics::new().unwrap());
        let budgets = Arc::new(BudgetTracker::from_config(&config));
        let stores: Vec<Arc<dyn TierStore>> = vec![
            Arc::new(MemoryStore::new(Tier::DeviceMemory)),
            Arc::new(MemoryStore::new(Tier::HostMemory)),
        ];
        let cache = Arc::new(CacheManager::with_stores(
            &config,
            budgets.clone(),
            metrics.clone(),
            stores,
        ));
        let transfers = Arc::new(TransferEngine::new(&config.transfer, metrics.clone()));
        let backend = Arc::new(SimulatedBackend::new(
            config.backend.clone(),
            config.model.kv_bytes_per_token(),
        ));
        let engine = ServingEngine::start(
            config.clone(),
            EngineParts {
                metrics,
                budgets,
                cache,
                transfers,
                backend,
            },
        );
        build_router(Arc::new(AppState {
            engine,
            config: Arc::new(config),
            start_time: Instant::now(),
        }))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submit(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/sequences")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["workers"], 3);
    }

    #[tokio::test]
    async fn test_submit_and_status() {
        let app = app();
        let response = app
            .clone()
            .oneshot(submit(serde_json::json!({
                "tenant": "default",
                "prompt": [1, 2, 3, 4],
                "max_new_tokens": 4
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        let id = json["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::get(format!("/v1/sequences/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tenant"], "default");
        assert_eq!(json["prompt_tokens"], 4);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_unprocessable() {
        let response = app()
            .oneshot(submit(serde_json::json!({
                "tenant": "nobody",
                "prompt": [1],
                "max_new_tokens": 1
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["decision"]["rejected"]["reason"], "unknown-tenant");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_bad_request() {
        let response = app()
            .oneshot(submit(serde_json::json!({
                "tenant": "default",
                "prompt": [],
                "max_new_tokens": 1
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_unknown_sequence() {
        let id = SequenceId::new();
        let response = app()
            .oneshot(
                Request::delete(format!("/v1/sequences/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_budgets_and_cache_stats() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::get("/v1/budgets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["resource"] == "tokens_in_flight"));

        let response = app
            .oneshot(Request::get("/v1/cache/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total_pages"], 0);
    }
}
