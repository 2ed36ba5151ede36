pub mod images;
pub mod security_groups;
pub mod slices;
pub mod vms;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::audit::ApiAuditLogger;
use crate::auth::JwtVerifier;
use crate::drivers::Driver;
use crate::images::{ImageCatalogClient, OpenstackImageClient};
use crate::lifecycle::SliceLocks;
use crate::queue::Queue;
use crate::store::{DataStore, Event, StoreError};

/// Shared application state, passed as the router's state type directly (not
/// `Arc<AppState>`) so the blanket `impl<T: Clone> FromRef<T> for T` lets
/// `Claims`'s extractor pull it straight out -- every field that needs
/// sharing is `Arc`-wrapped internally instead.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub queue: Arc<dyn Queue>,
    pub driver: Arc<Driver>,
    pub audit: Arc<ApiAuditLogger>,
    pub jwt: JwtVerifier,
    pub events: broadcast::Sender<Event>,
    pub slice_locks: Arc<SliceLocks>,
    pub images_dir: Arc<PathBuf>,
    pub image_catalog: Arc<ImageCatalogClient>,
    pub openstack_images: Arc<OpenstackImageClient>,
}

/// Wire error shape (§7): a stable `code` plus a human-readable `message`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "validation" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "forbidden" => StatusCode::FORBIDDEN,
            "resource_exhausted" => StatusCode::CONFLICT,
            "driver_failure" => StatusCode::BAD_GATEWAY,
            "dependency_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Validation(_) => "validation",
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
            StoreError::Forbidden(_) => "forbidden",
            StoreError::ResourceExhausted(_) => "resource_exhausted",
            StoreError::DriverFailure(_) => "driver_failure",
            StoreError::DependencyUnavailable(_) => "dependency_unavailable",
            StoreError::Internal(_) => "internal",
        };
        ApiError {
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}
