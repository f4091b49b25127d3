use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::sse;
use crate::errors::{AdmissionError, ReasonCode};
use crate::orchestrator::{CancelOutcome, Orchestrator};
use crate::publish::parse_repo_ref;
use crate::store::models::{NewTarget, TargetUpdate, TriageStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FromGithubRequest {
    pub github_url: String,
}

#[derive(Deserialize)]
pub struct UpdateFindingRequest {
    pub triage: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    NotReady(Vec<String>),
    Internal(String),
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            AdmissionError::NotReady { failing } => ApiError::NotReady(failing),
            AdmissionError::TargetNotFound { .. } => ApiError::NotFound(err.to_string()),
            AdmissionError::TargetInactive { .. } => ApiError::BadRequest(err.to_string()),
            AdmissionError::Persistence(e) => ApiError::internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code, remediation, failing) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found", None, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "bad_request", None, None),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                msg,
                "conflict",
                Some("Wait for the active run to finish or cancel it first."),
                None,
            ),
            ApiError::NotReady(failing) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Dependencies not ready: {}", failing.join("; ")),
                "not_ready",
                Some("Fix the failing dependencies, then re-run validation (POST /api/validation)."),
                Some(failing),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                msg,
                ReasonCode::InternalError.as_str(),
                Some(ReasonCode::InternalError.remediation()),
                None,
            ),
        };
        let mut body = serde_json::json!({
            "error": message,
            "code": code,
            "remediation": remediation,
        });
        if let Some(failing) = failing {
            body["failing"] = serde_json::json!(failing);
        }
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/targets", get(list_targets).post(create_target))
        .route("/api/targets/from-github", post(create_target_from_github))
        .route(
            "/api/targets/{id}",
            get(get_target).patch(update_target).delete(delete_target),
        )
        .route("/api/targets/{id}/runs", get(list_target_runs).post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/stream", get(sse::run_stream))
        .route("/api/runs/{id}/findings", get(list_run_findings))
        .route("/api/findings", get(list_findings))
        .route("/api/findings/{id}", get(get_finding).patch(update_finding))
        .route("/api/validation", get(get_validation).post(run_validation))
        .route("/api/stats/overview", get(stats_overview))
        .route("/health", get(health_check))
}

// ── Target handlers ───────────────────────────────────────────────────

async fn list_targets(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let targets = state
        .orchestrator
        .db()
        .call(|db| db.list_targets())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(targets))
}

async fn create_target(
    State(state): State<SharedState>,
    Json(req): Json<NewTarget>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate().map_err(ApiError::BadRequest)?;
    let target = state
        .orchestrator
        .db()
        .call(move |db| db.create_target(&req))
        .await
        .map_err(ApiError::internal)?;
    tracing::info!(target_id = target.id, name = %target.name, "Target created");
    Ok((StatusCode::CREATED, Json(target)))
}

/// Import a repository target named after its `owner/repo` slug.
async fn create_target_from_github(
    State(state): State<SharedState>,
    Json(req): Json<FromGithubRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let slug = parse_repo_ref(&req.github_url)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid GitHub repository URL: {}", req.github_url)))?;
    let new = NewTarget {
        name: slug.clone(),
        repo_url: Some(format!("https://github.com/{}", slug)),
        ..Default::default()
    };
    new.validate().map_err(ApiError::BadRequest)?;
    let target = state
        .orchestrator
        .db()
        .call(move |db| db.create_target(&new))
        .await
        .map_err(ApiError::internal)?;
    tracing::info!(target_id = target.id, repo = %slug, "Target imported from GitHub");
    Ok((StatusCode::CREATED, Json(target)))
}

async fn get_target(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state
        .orchestrator
        .db()
        .call(move |db| db.get_target(id))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Target {} not found", id)))?;
    Ok(Json(target))
}

async fn update_target(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<TargetUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(url) = req.url.as_deref()
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(ApiError::BadRequest(format!(
            "Target url must start with http:// or https://: {}",
            url
        )));
    }
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("Target name must not be empty".into()));
    }
    let target = state
        .orchestrator
        .db()
        .call(move |db| db.update_target(id, &req))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Target {} not found", id)))?;
    Ok(Json(target))
}

async fn delete_target(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    // Checked and deleted under one lock so admission cannot interleave.
    let result = state
        .orchestrator
        .db()
        .call(move |db| match db.active_run_for_target(id)? {
            Some(run_id) => Ok(Err(run_id)),
            None => Ok(Ok(db.delete_target(id)?)),
        })
        .await
        .map_err(ApiError::internal)?;
    match result {
        Err(run_id) => Err(ApiError::Conflict(format!(
            "Target {} has active run {}; cancel it before deleting",
            id, run_id
        ))),
        Ok(false) => Err(ApiError::NotFound(format!("Target {} not found", id))),
        Ok(true) => Ok(StatusCode::NO_CONTENT),
    }
}

// ── Run handlers ──────────────────────────────────────────────────────

async fn start_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.start_run(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run.id, "status": run.status })),
    ))
}

async fn list_target_runs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .orchestrator
        .db()
        .call(move |db| match db.get_target(id)? {
            Some(_) => Ok(Some(db.list_runs_for_target(id)?)),
            None => Ok(None),
        })
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Target {} not found", id)))?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .orchestrator
        .get_run_status(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(detail))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.cancel_run(id).await.map_err(ApiError::internal)? {
        CancelOutcome::Signalled => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "run_id": id, "cancelling": true })),
        )),
        CancelOutcome::NotActive => Err(ApiError::Conflict(format!("Run {} is not in progress", id))),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("Run {} not found", id))),
    }
}

async fn list_run_findings(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let findings = state
        .orchestrator
        .db()
        .call(move |db| match db.get_run(id)? {
            Some(_) => Ok(Some(db.list_findings(id)?)),
            None => Ok(None),
        })
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(findings))
}

// ── Finding handlers ──────────────────────────────────────────────────

async fn list_findings(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let findings = state
        .orchestrator
        .db()
        .call(|db| db.list_all_findings())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(findings))
}

async fn get_finding(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let finding = state
        .orchestrator
        .db()
        .call(move |db| db.get_finding(id))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Finding {} not found", id)))?;
    Ok(Json(finding))
}

async fn update_finding(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFindingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let triage: TriageStatus = req.triage.parse().map_err(ApiError::BadRequest)?;
    let finding = state
        .orchestrator
        .db()
        .call(move |db| db.update_finding_triage(id, triage))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Finding {} not found", id)))?;
    Ok(Json(finding))
}

// ── Stats ─────────────────────────────────────────────────────────────

const RECENT_RUNS: usize = 5;

async fn stats_overview(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .orchestrator
        .db()
        .call(|db| db.overview_stats(RECENT_RUNS))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(stats))
}

// ── Validation and health ─────────────────────────────────────────────

async fn get_validation(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.gate().current().as_ref().clone())
}

async fn run_validation(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.gate().run().await.as_ref().clone())
}

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    match state.orchestrator.db().call(|db| db.ping()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "database": "ok",
                "runs_in_flight": state.orchestrator.in_flight(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "database": format!("{:#}", e),
            })),
        ),
    }
}
