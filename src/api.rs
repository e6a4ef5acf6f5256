// src/api.rs
//! HTTP surface: webhook intake, source admin and debug views.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;

use crate::coordinator::{CycleReport, CycleState, PollCycleCoordinator, TickOutcome};
use crate::error::Error;
use crate::ratelimit::{BudgetSnapshot, RateLimitScheduler};
use crate::source::{Source, SourceKind};
use crate::store::{SourceRegistry, StateStore};
use crate::webhook::{DeliveryReport, WebhookIngest};

#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<PollCycleCoordinator>,
    scheduler: Arc<RateLimitScheduler>,
    store: Arc<dyn StateStore>,
    webhook: Arc<WebhookIngest>,
    /// SHA-256 of the shared webhook secret, if one is configured.
    webhook_auth: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<PollCycleCoordinator>,
        scheduler: Arc<RateLimitScheduler>,
        store: Arc<dyn StateStore>,
        webhook: Arc<WebhookIngest>,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            store,
            webhook,
            webhook_auth: None,
        }
    }

    pub fn with_webhook_auth(mut self, token: Option<&str>) -> Self {
        self.webhook_auth = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(digest);
        self
    }

    fn webhook_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.webhook_auth else {
            return true;
        };
        let Some(got) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let got = got.trim();
        let got = got.strip_prefix("Bearer ").unwrap_or(got);
        digest(got.trim()) == *expected
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/webhook", post(webhook))
        .route("/sources", get(list_sources).post(register_source))
        .route("/sources/{id}", delete(remove_source))
        .route("/sources/{id}/deactivate", post(deactivate_source))
        .route("/admin/poll", post(admin_poll))
        .route("/debug/budgets", get(debug_budgets))
        .route("/debug/state", get(debug_state))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Config(_) | Error::MalformedPayload(_) | Error::InvalidId(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": self.0.kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !state.webhook_authorized(&headers) {
        tracing::warn!(target: "webhook", "delivery rejected: bad or missing authorization");
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::MalformedPayload(format!("delivery is not JSON: {e}")))?;
    let report: DeliveryReport = state.webhook.ingest(&value).await?;

    // Ask the provider to redeliver when something failed after validation;
    // whatever was already emitted is suppressed by the ledger next time.
    let status = if report.failed > 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<Source>>, ApiError> {
    Ok(Json(state.store.list_sources().await?))
}

#[derive(Debug, Deserialize)]
struct RegisterReq {
    external_id: String,
    kind: String,
}

async fn register_source(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    let kind = SourceKind::parse(&req.kind)?;
    let source = state.store.register_source(&req.external_id, kind).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn remove_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    Ok(if state.store.remove_source(&id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn deactivate_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    Ok(if state.store.deactivate_source(&id).await? {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn admin_poll(State(state): State<AppState>) -> Response {
    match state.coordinator.tick().await {
        TickOutcome::Completed(report) => Json::<CycleReport>(report).into_response(),
        TickOutcome::Skipped => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "cycle_running" })),
        )
            .into_response(),
    }
}

async fn debug_budgets(State(state): State<AppState>) -> Json<Vec<BudgetSnapshot>> {
    let snaps = state
        .scheduler
        .known_endpoints()
        .iter()
        .filter_map(|k| state.scheduler.budget_snapshot(k))
        .collect();
    Json(snaps)
}

#[derive(Serialize)]
struct StateOut {
    state: CycleState,
    running: bool,
    matcher_version: &'static str,
    sources: usize,
    active_sources: usize,
}

async fn debug_state(State(state): State<AppState>) -> Result<Json<StateOut>, ApiError> {
    let sources = state.store.list_sources().await?;
    Ok(Json(StateOut {
        state: state.coordinator.state(),
        running: state.coordinator.is_running(),
        matcher_version: state.coordinator.matcher_version(),
        sources: sources.len(),
        active_sources: sources.iter().filter(|s| s.active).count(),
    }))
}
