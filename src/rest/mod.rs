//! REST surface (C8 ingress, spec §6).
//!
//! Thin axum layer over `orchestrator`/`lifecycle`/`security_groups`/
//! `images`: handlers extract `Claims`, call straight into those modules, and
//! translate `StoreError` into the wire error shape of §7.

pub mod handlers;
pub mod routes;

pub use handlers::{AppState, ApiError};
pub use routes::create_router;
