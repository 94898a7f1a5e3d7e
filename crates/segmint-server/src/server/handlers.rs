//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use segmint::routing::routing_hint;
use segmint::{
    AbandonReport, ConflictReport, ConsistencyReport, EngineStatus, GlobalStepSyncReport,
    IssuanceEngine, ProxyStatus, StepChangeReport, StepSizeReport, SystemClock, TimeSource,
};

use super::request::{BusinessQuery, ChangeStepBody, ForceSyncBody, GenerateBody, GenerateParams};
use super::response::{
    ApiError, DeletedResponse, GenerateResponse, HealthResponse, RecoveredResponse,
    SingleIdResponse,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IssuanceEngine>,
}

async fn run_generate(state: &AppState, body: GenerateBody) -> Result<GenerateResponse, ApiError> {
    let forced_role = body.forced_role()?;
    let routing_params = body
        .wants_routing()
        .then(|| (body.shard_db_count.unwrap_or(1), body.shard_table_count));

    let issued = state
        .engine
        .generate(body.into_generate_request(forced_role))
        .await?;

    let routing = routing_params.and_then(|(db_count, table_count)| {
        issued
            .ids
            .first()
            .map(|first| routing_hint(*first, db_count, table_count))
    });
    Ok(GenerateResponse::from_issued(issued, routing))
}

/// `POST /api/id/generate`
pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerateResponse>, ApiError> {
    Ok(Json(run_generate(&state, body).await?))
}

/// `GET /api/id/generate/{business_type}`, the query-parameter form.
pub async fn generate_by_path(
    State(state): State<AppState>,
    Path(business_type): Path<String>,
    Query(params): Query<GenerateParams>,
) -> Result<Json<GenerateResponse>, ApiError> {
    Ok(Json(run_generate(&state, params.into_body(business_type)).await?))
}

/// `GET /api/id/single/{business_type}`: one ID, flattened.
pub async fn single(
    State(state): State<AppState>,
    Path(business_type): Path<String>,
) -> Result<Json<SingleIdResponse>, ApiError> {
    let body = GenerateParams { count: 1, ..Default::default() }.into_body(business_type);
    let response = run_generate(&state, body).await?;
    Ok(Json(SingleIdResponse {
        id: response.ids[0],
        business_type: response.business_type,
        time_key: response.time_key,
        shard_type: response.shard_type,
        node_id: response.node_id,
    }))
}

/// `GET /api/id/status`
pub async fn status(State(state): State<AppState>) -> Result<Json<EngineStatus>, ApiError> {
    Ok(Json(state.engine.status().await?))
}

/// `GET /api/id/health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        service: "segmint",
        timestamp_ms: SystemClock.now_millis(),
    })
}

/// `POST /api/id/admin/step-size/change`
pub async fn change_step(
    State(state): State<AppState>,
    Json(body): Json<ChangeStepBody>,
) -> Result<Json<StepChangeReport>, ApiError> {
    let report = state
        .engine
        .change_step(
            &body.business_type,
            body.time_key.as_deref(),
            body.new_step_size,
            body.preview,
        )
        .await?;
    Ok(Json(report))
}

/// `POST /api/id/admin/step-size/force-sync`
pub async fn force_step_sync(
    State(state): State<AppState>,
    Json(body): Json<ForceSyncBody>,
) -> Result<Json<GlobalStepSyncReport>, ApiError> {
    let report = state
        .engine
        .change_step_global(body.new_step_size, body.preview)
        .await?;
    Ok(Json(report))
}

/// `GET /api/id/admin/step-size/current`
pub async fn current_steps(
    State(state): State<AppState>,
    Query(query): Query<BusinessQuery>,
) -> Result<Json<StepSizeReport>, ApiError> {
    let report = state
        .engine
        .step_distribution(query.business_type.as_deref())
        .await?;
    Ok(Json(report))
}

/// `GET /api/id/admin/step-size/consistency`
pub async fn step_consistency(
    State(state): State<AppState>,
    Query(query): Query<BusinessQuery>,
) -> Result<Json<ConsistencyReport>, ApiError> {
    let business_type = query
        .business_type
        .ok_or_else(|| ApiError::bad_request("business_type query parameter is required"))?;
    Ok(Json(state.engine.check_step_consistency(&business_type).await?))
}

/// `POST /api/id/admin/refresh/recover`
pub async fn recover_refresh(State(state): State<AppState>) -> Json<RecoveredResponse> {
    let recovered = state.engine.recover_stuck_refresh();
    Json(RecoveredResponse {
        count: recovered.len(),
        recovered,
    })
}

/// `POST /api/id/admin/conflicts/resolve`
pub async fn resolve_conflicts(
    State(state): State<AppState>,
) -> Result<Json<ConflictReport>, ApiError> {
    Ok(Json(state.engine.resolve_conflicts().await?))
}

/// `GET /api/id/admin/proxies`
pub async fn proxies(State(state): State<AppState>) -> Json<ProxyStatus> {
    Json(state.engine.proxy_status())
}

/// `POST /api/id/admin/proxies/abandon`
pub async fn abandon_proxies(State(state): State<AppState>) -> Json<AbandonReport> {
    Json(state.engine.abandon_proxies())
}

/// `DELETE /api/id/segments/expired/{cutoff}`
pub async fn delete_expired(
    State(state): State<AppState>,
    Path(cutoff): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state.engine.delete_expired(&cutoff).await?;
    Ok(Json(DeletedResponse { deleted }))
}
