//! Axum JSON API over the topic aggregation engine.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use topics_core::{ApprovalStatus, CoreError, PhaseId, TopicApproval, TopicRequest, TopicSubmission};
use topics_engine::{
    EngineError, RegenerationSummary, ServiceConfig, SubmissionReceipt, TopicEngine,
};
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "topics-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TopicEngine>,
}

impl AppState {
    pub fn new(engine: TopicEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(inner) => Self::Validation(inner.to_string()),
            EngineError::NotFound(_) => Self::NotFound(err.to_string()),
            EngineError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Validation(msg) | Self::NotFound(msg) => msg.clone(),
            // Store failures are logged, never echoed to clients.
            Self::Internal(detail) => {
                error!(%detail, "request failed at the storage boundary");
                "internal server error".to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApprovalsQuery {
    phase: Option<String>,
    domain: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MatchingQuery {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    topic: String,
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateBody {
    #[serde(default)]
    approval: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/topic-requests", post(submit_handler))
        .route("/topic-requests/matching", get(matching_requests_handler))
        .route("/topic-approvals", get(approvals_handler))
        .route("/topic-approvals/{id}", put(update_status_handler))
        .route("/admin/topic-approvals/regenerate", post(regenerate_handler))
        .with_state(state)
}

pub async fn serve(config: &ServiceConfig, engine: TopicEngine) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "topic aggregation api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let (config, engine) = topics_engine::engine_from_env().await?;
    serve(&config, engine).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn submit_handler(
    State(state): State<AppState>,
    payload: Result<Json<TopicSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmissionReceipt>), ApiError> {
    let Json(submission) = payload?;
    let receipt = state.engine.submit_request(submission).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn approvals_handler(
    State(state): State<AppState>,
    Query(query): Query<ApprovalsQuery>,
) -> Result<Json<Vec<TopicApproval>>, ApiError> {
    let selector = query
        .phase
        .filter(|p| !p.trim().is_empty())
        .ok_or(CoreError::MissingFields(vec!["phase"]))?;
    let mut approvals = state.engine.get_approvals(&selector).await?;
    if let Some(domain) = query.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        approvals.retain(|a| a.domain == domain);
    }
    Ok(Json(approvals))
}

async fn update_status_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    payload: Result<Json<StatusUpdateBody>, JsonRejection>,
) -> Result<Json<TopicApproval>, ApiError> {
    let Json(body) = payload?;
    let status: ApprovalStatus = body.approval.parse()?;
    let updated = state.engine.update_approval_status(id, status).await?;
    Ok(Json(updated))
}

async fn matching_requests_handler(
    State(state): State<AppState>,
    Query(query): Query<MatchingQuery>,
) -> Result<Json<Vec<TopicRequest>>, ApiError> {
    let phase = match query.phase.as_deref().map(str::trim) {
        Some(selector) if !selector.is_empty() => Some(PhaseId::parse_selector(selector)?),
        _ => None,
    };
    let requests = state
        .engine
        .find_requests_matching_topic(&query.domain, &query.topic, phase)
        .await?;
    Ok(Json(requests))
}

async fn regenerate_handler(
    State(state): State<AppState>,
) -> Result<Json<RegenerationSummary>, ApiError> {
    Ok(Json(state.engine.regenerate_all().await?))
}
