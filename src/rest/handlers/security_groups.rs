//! Security-group endpoints (§4.6).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::Claims;
use crate::domain::{RuleDirection, SecurityGroup};
use crate::security_groups::{self, NewRule};

use super::slices::authorize;
use super::{ApiError, AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSgRequest {
    pub name: String,
    pub description: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/security-groups",
    params(("id" = i64, Path, description = "Slice id")),
    request_body = CreateSgRequest,
    responses((status = 200, description = "Security group created", body = SecurityGroup)),
    tag = "security-groups"
)]
pub async fn create_sg(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
    Json(req): Json<CreateSgRequest>,
) -> Result<Json<SecurityGroup>, ApiError> {
    authorize(&state, &claims, id).await?;
    let slice = state.store.get_slice(id).await?;
    let sg = security_groups::create_custom_sg(
        &*state.store,
        &state.driver,
        &state.audit,
        slice.zone,
        id,
        &req.name,
        req.description.as_deref(),
    )
    .await?;
    Ok(Json(sg))
}

#[utoipa::path(
    delete,
    path = "/api/v1/slices/{id}/security-groups/{sg_id}",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("sg_id" = i64, Path, description = "Security group id"),
    ),
    responses(
        (status = 204, description = "Security group deleted"),
        (status = 409, description = "Cannot delete the default security group", body = ApiError),
    ),
    tag = "security-groups"
)]
pub async fn delete_sg(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, sg_id)): Path<(i64, i64)>,
) -> Result<axum::http::StatusCode, ApiError> {
    authorize(&state, &claims, id).await?;
    let slice = state.store.get_slice(id).await?;
    security_groups::delete_custom_sg(&*state.store, &state.driver, &state.audit, slice.zone, id, sg_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddRuleRequest {
    pub direction: RuleDirection,
    pub ether_type: String,
    pub protocol: Option<String>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub remote_cidr: Option<String>,
    pub remote_sg_name: Option<String>,
    pub description: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/slices/{id}/security-groups/{sg_id}/rules",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("sg_id" = i64, Path, description = "Security group id"),
    ),
    request_body = AddRuleRequest,
    responses((status = 200, description = "Rule added", body = SecurityGroup)),
    tag = "security-groups"
)]
pub async fn add_rule(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, sg_id)): Path<(i64, i64)>,
    Json(req): Json<AddRuleRequest>,
) -> Result<Json<SecurityGroup>, ApiError> {
    authorize(&state, &claims, id).await?;
    let slice = state.store.get_slice(id).await?;
    let new_rule = NewRule {
        direction: req.direction,
        ether_type: req.ether_type,
        protocol: req.protocol,
        port_range_start: req.port_range_start,
        port_range_end: req.port_range_end,
        remote_cidr: req.remote_cidr,
        remote_sg_name: req.remote_sg_name,
        description: req.description,
    };
    let sg = security_groups::add_rule(&*state.store, &state.driver, &state.audit, slice.zone, id, sg_id, new_rule).await?;
    Ok(Json(sg))
}

#[utoipa::path(
    delete,
    path = "/api/v1/slices/{id}/security-groups/{sg_id}/rules/{rule_id}",
    params(
        ("id" = i64, Path, description = "Slice id"),
        ("sg_id" = i64, Path, description = "Security group id"),
        ("rule_id" = u32, Path, description = "Rule id"),
    ),
    responses((status = 200, description = "Rule removed", body = SecurityGroup)),
    tag = "security-groups"
)]
pub async fn remove_rule(
    State(state): State<AppState>,
    claims: Claims,
    Path((id, sg_id, rule_id)): Path<(i64, i64, u32)>,
) -> Result<Json<SecurityGroup>, ApiError> {
    authorize(&state, &claims, id).await?;
    let slice = state.store.get_slice(id).await?;
    let sg = security_groups::remove_rule(&*state.store, &state.driver, &state.audit, slice.zone, id, sg_id, rule_id).await?;
    Ok(Json(sg))
}
