//! HTTP endpoints of the deferred settlement facilitator.
//!
//! The boundary is thin: each handler locks the shared core, invokes one
//! ledger/dispute/engine operation, and wraps the result in a
//! `{success, …}` envelope. Failures render as
//! `{success: false, error: message}` with a 4xx/5xx status.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::dispute::DisputeError;
use crate::engine::{EngineError, SettlementEngine};
use crate::ledger::LedgerError;
use crate::monitoring::Monitoring;
use crate::state::SharedState;
use crate::types::{
    Authorization, AuthorizationStatus, BatchCompleteRequest, BatchCreateRequest,
    BatchFailRequest, DisputeRequest, DisputeResolveRequest, QueueRequest, TriggerRequest,
};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub engine: Arc<SettlementEngine>,
    pub monitoring: Arc<Monitoring>,
}

/// Boundary error: wraps core errors and maps them onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Dispute(#[from] DisputeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Agent not found")]
    AgentNotFound,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Ledger(error) => ledger_status(error),
            ApiError::Dispute(error) => match error {
                DisputeError::AuthorizationNotFound | DisputeError::DisputeNotFound => {
                    StatusCode::NOT_FOUND
                }
                DisputeError::AgentMismatch => StatusCode::FORBIDDEN,
                DisputeError::AlreadySettled
                | DisputeError::AlreadyOpen
                | DisputeError::AlreadyResolved => StatusCode::CONFLICT,
            },
            ApiError::Engine(error) => match error {
                EngineError::Ledger(inner) => ledger_status(inner),
                EngineError::Signer(_) => StatusCode::BAD_GATEWAY,
                EngineError::InvalidBatchAmount(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::AgentNotFound => StatusCode::NOT_FOUND,
        }
    }
}

fn ledger_status(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::AuthorizationNotFound | LedgerError::BatchNotFound => StatusCode::NOT_FOUND,
        LedgerError::DuplicateAuthorization
        | LedgerError::AlreadyQueued
        | LedgerError::AlreadySettled
        | LedgerError::AuthorizationDisputed
        | LedgerError::BatchAlreadyFinal => StatusCode::CONFLICT,
        LedgerError::AuthorizationExpired
        | LedgerError::InvalidSignature
        | LedgerError::InvalidAmount => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// All facilitator routes; callers attach the state and middleware layers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/verify", post(post_verify))
        .route("/queue", post(post_queue))
        .route("/batch/create", post(post_batch_create))
        .route("/batch/complete", post(post_batch_complete))
        .route("/batch/fail", post(post_batch_fail))
        .route("/list", get(get_list))
        .route("/pending", get(get_pending))
        .route("/merchants", get(get_merchants))
        .route("/batches", get(get_batches))
        .route("/usage", get(get_usage))
        .route("/dispute", post(post_dispute))
        .route("/dispute/resolve", post(post_dispute_resolve))
        .route("/disputes", get(get_disputes))
        .route("/settlement/trigger", post(post_settlement_trigger))
        .route("/settlement/start", post(post_settlement_start))
        .route("/settlement/stop", post(post_settlement_stop))
        .route("/monitoring/dashboard", get(get_dashboard))
        .route("/monitoring/metrics", get(get_metrics))
        .route("/monitoring/agent/{address}", get(get_agent_analytics))
        .route("/monitoring/agents", get(get_agents))
        .route("/monitoring/health", get(get_monitoring_health))
        .route("/monitoring/history", get(get_history))
        .route("/health", get(get_health))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentQuery {
    agent_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionalAgentQuery {
    #[serde(default)]
    agent_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    agent_address: String,
    #[serde(default)]
    status: Option<AuthorizationStatus>,
}

/// `POST /verify`: verify and store a signed authorization.
#[instrument(skip_all, fields(id = %auth.id, agent = %auth.agent_address))]
async fn post_verify(
    State(app): State<AppState>,
    Json(auth): Json<Authorization>,
) -> Response {
    let mut state = app.state.lock().await;
    match state.ledger.verify(auth) {
        Ok(()) => Json(json!({ "success": true, "valid": true })).into_response(),
        Err(error) => {
            tracing::warn!(%error, "verification rejected");
            let body = Json(json!({
                "success": false,
                "valid": false,
                "error": error.to_string(),
            }));
            (ledger_status(&error), body).into_response()
        }
    }
}

/// `POST /queue`: queue a verified authorization for settlement.
#[instrument(skip_all, fields(id = %body.authorization_id))]
async fn post_queue(
    State(app): State<AppState>,
    Json(body): Json<QueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let outcome = state
        .ledger
        .queue_for_settlement(&body.authorization_id, app.engine.thresholds())?;
    Ok(Json(json!({
        "success": true,
        "shouldSettle": outcome.should_settle,
        "reason": outcome.reason,
    })))
}

/// `POST /batch/create`: build a settlement batch without dispatching it.
#[instrument(skip_all, fields(agent = %body.agent_address))]
async fn post_batch_create(
    State(app): State<AppState>,
    Json(body): Json<BatchCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let batch = state
        .ledger
        .create_batch(&body.agent_address, body.merchant_address.as_deref())?;
    Ok(Json(json!({ "success": true, "batch": batch })))
}

/// `POST /batch/complete`: record an externally settled batch.
#[instrument(skip_all, fields(batch = %body.batch_id))]
async fn post_batch_complete(
    State(app): State<AppState>,
    Json(body): Json<BatchCompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let batch = state
        .ledger
        .complete_settlement(&body.batch_id, &body.transaction_signature)?;
    Ok(Json(json!({ "success": true, "batch": batch })))
}

/// `POST /batch/fail`: record a failed settlement attempt.
#[instrument(skip_all, fields(batch = %body.batch_id))]
async fn post_batch_fail(
    State(app): State<AppState>,
    Json(body): Json<BatchFailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let batch = state.ledger.fail_settlement(&body.batch_id, &body.error)?;
    Ok(Json(json!({ "success": true, "batch": batch })))
}

/// `GET /list?agentAddress&status?`: the agent's authorizations.
#[instrument(skip_all)]
async fn get_list(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let state = app.state.lock().await;
    let authorizations = state.ledger.list_by_agent(&query.agent_address, query.status);
    Json(json!({ "success": true, "authorizations": authorizations }))
}

/// `GET /pending?agentAddress`: the agent's queued authorizations.
#[instrument(skip_all)]
async fn get_pending(
    State(app): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> impl IntoResponse {
    let state = app.state.lock().await;
    let authorizations = state.ledger.list_pending(&query.agent_address);
    Json(json!({ "success": true, "authorizations": authorizations }))
}

/// `GET /merchants?agentAddress`: merchants across the agent's queued
/// authorizations.
#[instrument(skip_all)]
async fn get_merchants(
    State(app): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> impl IntoResponse {
    let state = app.state.lock().await;
    let merchants = state.ledger.pending_merchants(&query.agent_address);
    Json(json!({ "success": true, "merchants": merchants }))
}

/// `GET /batches?agentAddress?`: settlement batches.
#[instrument(skip_all)]
async fn get_batches(
    State(app): State<AppState>,
    Query(query): Query<OptionalAgentQuery>,
) -> impl IntoResponse {
    let state = app.state.lock().await;
    let batches = state.ledger.list_batches(query.agent_address.as_deref());
    Json(json!({ "success": true, "batches": batches }))
}

/// `GET /usage?agentAddress`: the agent's usage accounting.
#[instrument(skip_all)]
async fn get_usage(
    State(app): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let state = app.state.lock().await;
    let usage = state
        .ledger
        .usage(&query.agent_address)
        .ok_or(ApiError::AgentNotFound)?;
    Ok(Json(json!({ "success": true, "usage": usage })))
}

/// `POST /dispute`: open a dispute against an authorization.
#[instrument(skip_all, fields(authorization = %body.authorization_id))]
async fn post_dispute(
    State(app): State<AppState>,
    Json(body): Json<DisputeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let state = &mut *state;
    let dispute = state.disputes.create(&mut state.ledger, body)?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

/// `POST /dispute/resolve`: resolve a dispute for or against the agent.
#[instrument(skip_all, fields(dispute = %body.dispute_id))]
async fn post_dispute_resolve(
    State(app): State<AppState>,
    Json(body): Json<DisputeResolveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = app.state.lock().await;
    let state = &mut *state;
    let dispute = state.disputes.resolve(
        &mut state.ledger,
        &body.dispute_id,
        body.resolution,
        body.note,
    )?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

/// `GET /disputes?agentAddress?`: disputes, optionally for one agent.
#[instrument(skip_all)]
async fn get_disputes(
    State(app): State<AppState>,
    Query(query): Query<OptionalAgentQuery>,
) -> impl IntoResponse {
    let state = app.state.lock().await;
    let disputes = state.disputes.list(query.agent_address.as_deref());
    Json(json!({ "success": true, "disputes": disputes }))
}

/// `POST /settlement/trigger`: settle the agent's queued authorizations
/// now, for one merchant or the busiest one.
#[instrument(skip_all, fields(agent = %body.agent_address))]
async fn post_settlement_trigger(
    State(app): State<AppState>,
    Json(body): Json<TriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let batch = app
        .engine
        .trigger_settlement(&body.agent_address, body.merchant_address.as_deref())
        .await?;
    Ok(Json(json!({ "success": true, "batch": batch })))
}

/// `POST /settlement/start`: start the periodic settlement scheduler.
#[instrument(skip_all)]
async fn post_settlement_start(State(app): State<AppState>) -> impl IntoResponse {
    app.engine.start().await;
    Json(json!({ "success": true, "running": true }))
}

/// `POST /settlement/stop`: stop the periodic settlement scheduler.
#[instrument(skip_all)]
async fn post_settlement_stop(State(app): State<AppState>) -> impl IntoResponse {
    app.engine.stop().await;
    Json(json!({ "success": true, "running": false }))
}

/// `GET /monitoring/dashboard`: metrics, health, and history size.
#[instrument(skip_all)]
async fn get_dashboard(State(app): State<AppState>) -> impl IntoResponse {
    let dashboard = app.monitoring.dashboard().await;
    Json(json!({ "success": true, "dashboard": dashboard }))
}

/// `GET /monitoring/metrics`: payment, settlement, and dispute metrics.
#[instrument(skip_all)]
async fn get_metrics(State(app): State<AppState>) -> impl IntoResponse {
    let payments = app.monitoring.payment_metrics().await;
    let settlements = app.monitoring.settlement_metrics().await;
    let disputes = app.monitoring.dispute_metrics().await;
    Json(json!({
        "success": true,
        "payments": payments,
        "settlements": settlements,
        "disputes": disputes,
    }))
}

/// `GET /monitoring/agent/{address}`: analytics for one agent.
#[instrument(skip_all)]
async fn get_agent_analytics(
    State(app): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = app
        .monitoring
        .agent_analytics(&address)
        .await
        .ok_or(ApiError::AgentNotFound)?;
    Ok(Json(json!({ "success": true, "agent": agent })))
}

/// `GET /monitoring/agents`: analytics for every known agent.
#[instrument(skip_all)]
async fn get_agents(State(app): State<AppState>) -> impl IntoResponse {
    let agents = app.monitoring.all_agent_analytics().await;
    Json(json!({ "success": true, "agents": agents }))
}

/// `GET /monitoring/health`: the derived system health projection.
#[instrument(skip_all)]
async fn get_monitoring_health(State(app): State<AppState>) -> impl IntoResponse {
    let health = app.monitoring.system_health().await;
    Json(json!({ "success": true, "health": health }))
}

/// `GET /monitoring/history`: the bounded metrics snapshot ring.
#[instrument(skip_all)]
async fn get_history(State(app): State<AppState>) -> impl IntoResponse {
    let history = app.monitoring.history().await;
    Json(json!({ "success": true, "history": history }))
}

/// `GET /health`: liveness probe.
#[instrument(skip_all)]
async fn get_health(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": app.monitoring.uptime_seconds(),
    }))
}
