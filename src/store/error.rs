//! Store error types, generalized from the teacher's `StoreError` to the
//! error taxonomy of spec §7 (validation / resource_exhausted /
//! driver_failure / dependency_unavailable / not_found / forbidden /
//! conflict).

use thiserror::Error;

/// Errors that can occur during store or orchestration operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Request failed a structural or cross-field validation rule (§4.1 step 2).
    #[error("validation: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with existing resource or a state-machine precondition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Row-level access check failed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No free VLANs, no admissible worker, out of VNC displays.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A cluster driver reported inability to create/delete.
    #[error("driver failure: {0}")]
    DriverFailure(String),

    /// Telemetry, headnode probe, or queue connection unavailable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Internal error not classified under the spec's taxonomy.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for store and orchestration operations.
pub type Result<T> = std::result::Result<T, StoreError>;
