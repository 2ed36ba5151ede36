//! Per-VM lifecycle endpoints, scoped to a slice (§4.4).

use axum::extract::{Path, State};

use crate::auth::Claims;
use crate::lifecycle;

use super::slices::authorize;
use super::{ApiError, AppState};

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/vms/{vm_name}/pause",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("vm_name" = String, Path, description = "VM name, e.g. vm1"),
    ),
    responses((status = 204, description = "VM paused"), (status = 409, description = "Invalid transition", body = ApiError)),
    tag = "vms"
)]
pub async fn pause_vm(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, vm_name)): Path<(i64, String)>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::pause_vm(&*state.store, &state.driver, &state.slice_locks, &state.audit, id, &vm_name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/vms/{vm_name}/resume",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("vm_name" = String, Path, description = "VM name, e.g. vm1"),
    ),
    responses((status = 204, description = "VM resumed"), (status = 409, description = "Invalid transition", body = ApiError)),
    tag = "vms"
)]
pub async fn resume_vm(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, vm_name)): Path<(i64, String)>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::resume_vm(&*state.store, &state.driver, &state.slice_locks, &state.audit, id, &vm_name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/vms/{vm_name}/shutdown",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("vm_name" = String, Path, description = "VM name, e.g. vm1"),
    ),
    responses((status = 204, description = "VM shut down"), (status = 409, description = "Invalid transition", body = ApiError)),
    tag = "vms"
)]
pub async fn shutdown_vm(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, vm_name)): Path<(i64, String)>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::shutdown_vm(&*state.store, &state.driver, &state.slice_locks, &state.audit, id, &vm_name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/vms/{vm_name}/start",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("vm_name" = String, Path, description = "VM name, e.g. vm1"),
    ),
    responses((status = 204, description = "VM started"), (status = 409, description = "Invalid transition", body = ApiError)),
    tag = "vms"
)]
pub async fn start_vm(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, vm_name)): Path<(i64, String)>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    lifecycle::start_vm(&*state.store, &state.driver, &state.slice_locks, &state.audit, id, &vm_name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
