//! Image registry endpoints (§4.7). Admin-gated: images are a shared,
//! cross-tenant catalog, not a per-slice resource.

use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::Claims;
use crate::domain::{Image, ImportSource};
use crate::images;
use crate::store::StoreError;

use super::{ApiError, AppState};

fn require_admin(claims: &Claims) -> Result<(), ApiError> {
    if !claims.is_admin() {
        return Err(StoreError::Forbidden("only admins may manage the image catalog".into()).into());
    }
    Ok(())
}

/// Upload an image file directly (multipart `name`, `description`, `file`).
#[utoipa::path(
    post,
    path = "/api/v1/images",
    responses(
        (status = 200, description = "Image admitted", body = Image),
        (status = 403, description = "Caller is not an admin", body = ApiError),
    ),
    tag = "images"
)]
pub async fn upload_image(
    State(state): State<AppState>,
    claims: Claims,
    mut multipart: Multipart,
) -> Result<Json<Image>, ApiError> {
    require_admin(&claims)?;

    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut staged_path: Option<std::path::PathBuf> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| StoreError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "name" => {
                name = Some(field.text().await.map_err(|e| StoreError::Validation(e.to_string()))?);
            }
            "description" => {
                description = Some(field.text().await.map_err(|e| StoreError::Validation(e.to_string()))?);
            }
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.img").to_string();
                let bytes = field.bytes().await.map_err(|e| StoreError::Validation(e.to_string()))?;
                let dest = state.images_dir.join(format!("staged_{file_name}"));
                tokio::fs::write(&dest, &bytes)
                    .await
                    .map_err(|e| StoreError::Internal(format!("staging uploaded image failed: {e}")))?;
                staged_path = Some(dest);
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| StoreError::Validation("missing \"name\" field".into()))?;
    let staged_path = staged_path.ok_or_else(|| StoreError::Validation("missing \"file\" field".into()))?;

    let image = images::admit_image(
        &*state.store,
        &state.audit,
        &state.images_dir,
        &state.image_catalog,
        &state.openstack_images,
        &staged_path,
        &name,
        description.as_deref(),
        ImportSource::File,
    )
    .await?;
    Ok(Json(image))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ImportFromCatalogRequest {
    pub catalog_name: String,
    pub description: Option<String>,
}

/// Import an image already present in the external image catalog by name
/// (§6 "Egress: image catalog").
#[utoipa::path(
    post,
    path = "/api/v1/images/import",
    request_body = ImportFromCatalogRequest,
    responses(
        (status = 200, description = "Image admitted", body = Image),
        (status = 403, description = "Caller is not an admin", body = ApiError),
    ),
    tag = "images"
)]
pub async fn import_from_catalog(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<ImportFromCatalogRequest>,
) -> Result<Json<Image>, ApiError> {
    require_admin(&claims)?;

    let staged_path = state.images_dir.join(format!("staged_{}", req.catalog_name));
    state.image_catalog.download(&req.catalog_name, &staged_path).await?;

    let image = images::admit_image(
        &*state.store,
        &state.audit,
        &state.images_dir,
        &state.image_catalog,
        &state.openstack_images,
        &staged_path,
        &req.catalog_name,
        req.description.as_deref(),
        ImportSource::Url,
    )
    .await?;
    Ok(Json(image))
}

#[utoipa::path(
    get,
    path = "/api/v1/images",
    responses((status = 200, description = "Registered images", body = [Image])),
    tag = "images"
)]
pub async fn list_images(State(state): State<AppState>, _claims: Claims) -> Result<Json<Vec<Image>>, ApiError> {
    let images = state.store.list_images().await?;
    Ok(Json(images))
}

#[utoipa::path(
    delete,
    path = "/api/v1/images/{id}",
    params(("id" = i64, Path, description = "Image id")),
    responses(
        (status = 204, description = "Image deleted"),
        (status = 403, description = "Caller is not an admin", body = ApiError),
    ),
    tag = "images"
)]
pub async fn delete_image(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, ApiError> {
    require_admin(&claims)?;
    images::delete_image(
        &*state.store,
        &state.audit,
        &state.images_dir,
        &state.image_catalog,
        &state.openstack_images,
        id,
    )
    .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
