//! Slice lifecycle endpoints (§6 "Ingress: slice creation", §4.4).

use axum::extract::{Path, State};
use axum::Json;

use crate::auth::Claims;
use crate::domain::Slice;
use crate::orchestrator;
use crate::request::CreateSliceRequest;
use crate::{lifecycle, store::StoreError};

use super::{ApiError, AppState};

/// Validate, persist, enqueue, and await the full provisioning pipeline.
#[utoipa::path(
    post,
    path = "/api/v1/slices",
    request_body = CreateSliceRequest,
    responses(
        (status = 200, description = "Slice deployed", body = Slice),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 409, description = "Resource exhausted or conflicting state", body = ApiError),
        (status = 502, description = "Driver failure", body = ApiError),
        (status = 503, description = "Pipeline did not finish in time", body = ApiError),
    ),
    tag = "slices"
)]
pub async fn create_slice(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<CreateSliceRequest>,
) -> Result<Json<Slice>, ApiError> {
    let slice = orchestrator::create_slice(
        &*state.store,
        &*state.queue,
        &state.events,
        &state.audit,
        &claims,
        req,
    )
    .await?;
    Ok(Json(slice))
}

/// List slices visible to the caller (all slices for admins, own slices otherwise).
#[utoipa::path(
    get,
    path = "/api/v1/slices",
    responses((status = 200, description = "Visible slices", body = [Slice])),
    tag = "slices"
)]
pub async fn list_slices(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<Slice>>, ApiError> {
    let slices = orchestrator::list_slices(&*state.store, &claims).await?;
    Ok(Json(slices))
}

#[utoipa::path(
    get,
    path = "/api/v1/slices/{id}",
    params(("id" = i64, Path, description = "Slice id")),
    responses(
        (status = 200, description = "Slice", body = Slice),
        (status = 403, description = "Not the owner", body = ApiError),
        (status = 404, description = "No such slice", body = ApiError),
    ),
    tag = "slices"
)]
pub async fn get_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<Json<Slice>, ApiError> {
    let slice = orchestrator::get_slice(&*state.store, &claims, id).await?;
    Ok(Json(slice))
}

#[utoipa::path(
    delete,
    path = "/api/v1/slices/{id}",
    params(("id" = i64, Path, description = "Slice id")),
    responses(
        (status = 204, description = "Slice deleted"),
        (status = 403, description = "Not the owner", body = ApiError),
        (status = 404, description = "No such slice", body = ApiError),
    ),
    tag = "slices"
)]
pub async fn delete_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::delete_slice(&*state.store, &state.driver, &state.slice_locks, &state.audit, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/pause",
    params(("id" = i64, Path, description = "Slice id")),
    responses((status = 204, description = "Slice paused"), (status = 409, description = "No VMs to operate on", body = ApiError)),
    tag = "slices"
)]
pub async fn pause_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::pause_slice(&*state.store, &state.driver, &state.slice_locks, &state.audit, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/resume",
    params(("id" = i64, Path, description = "Slice id")),
    responses((status = 204, description = "Slice resumed")),
    tag = "slices"
)]
pub async fn resume_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::resume_slice(&*state.store, &state.driver, &state.slice_locks, &state.audit, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/shutdown",
    params(("id" = i64, Path, description = "Slice id")),
    responses((status = 204, description = "Slice shut down")),
    tag = "slices"
)]
pub async fn shutdown_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::shutdown_slice(&*state.store, &state.driver, &state.slice_locks, &state.audit, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/start",
    params(("id" = i64, Path, description = "Slice id")),
    responses((status = 204, description = "Slice started")),
    tag = "slices"
)]
pub async fn start_slice(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::start_slice(&*state.store, &state.driver, &state.slice_locks, &state.audit, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Shared ownership check (§6): every mutating slice endpoint requires the
/// caller to own the slice or be an admin.
pub(super) async fn authorize(state: &AppState, claims: &Claims, slice_id: i64) -> Result<(), ApiError> {
    let slice = state.store.get_slice(slice_id).await?;
    if !claims.can_access(&slice.owner_user_id) {
        return Err(StoreError::Forbidden(format!("slice {slice_id} does not belong to this caller")).into());
    }
    Ok(())
}
