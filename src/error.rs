//! Typed errors per component and HTTP mapping.

use crate::provision::ProvisioningStep;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
    #[error("invalid preview host pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("validation: {0}")]
    Validation(String),
}

/// Failures of the organization directory store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The directory could not be reached or the query failed.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("organization not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(e: sqlx::Error) -> Self {
        DirectoryError::Unavailable(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No tenant exists for these inputs and no default tenant is available.
    #[error("no store found for host '{hostname}'")]
    NotFound {
        hostname: String,
        route_slug: Option<String>,
    },
    /// The directory itself is unreachable.
    #[error("tenant lookup failed: {0}")]
    LookupFailed(String),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::LookupFailed(_))
    }
}

/// Connection acquisition failures. Cloned to every caller waiting on one acquisition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection acquisition failed for tenant {tenant_id}: {message}")]
    AcquisitionFailed { tenant_id: String, message: String },
    #[error("tenant {tenant_id} is unavailable: {reason}")]
    TenantUnavailable { tenant_id: String, reason: String },
    #[error("connection for tenant {0} was invalidated while it was being acquired")]
    Superseded(String),
    #[error("connection cache is shut down")]
    ShuttingDown,
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::AcquisitionFailed { .. } | ConnectionError::Superseded(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("organization create failed: {0}")]
    OrganizationCreateFailed(String),
    #[error("database provision failed: {0}")]
    DatabaseProvisionFailed(String),
    #[error("migration failed: {0}")]
    MigrationFailed(String),
    #[error("job store: {0}")]
    JobStore(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("directory: {0}")]
    Directory(String),
}

impl From<DirectoryError> for ProvisionError {
    fn from(e: DirectoryError) -> Self {
        ProvisionError::Directory(e.to_string())
    }
}

impl ProvisionError {
    /// Step that failed, for step-scoped retry actions.
    pub fn failed_step(&self) -> Option<ProvisioningStep> {
        match self {
            ProvisionError::OrganizationCreateFailed(_) => Some(ProvisioningStep::CreateOrganization),
            ProvisionError::DatabaseProvisionFailed(_) => Some(ProvisioningStep::ProvisionDatabase),
            ProvisionError::MigrationFailed(_) => Some(ProvisioningStep::RunMigrations),
            _ => None,
        }
    }

    pub fn for_step(step: ProvisioningStep, message: String) -> Self {
        match step {
            ProvisioningStep::CreateOrganization => ProvisionError::OrganizationCreateFailed(message),
            ProvisioningStep::ProvisionDatabase => ProvisionError::DatabaseProvisionFailed(message),
            ProvisioningStep::RunMigrations => ProvisionError::MigrationFailed(message),
        }
    }
}

/// Failure reported by an infrastructure provider or schema migrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InfraError(pub String);

impl From<sqlx::Error> for InfraError {
    fn from(e: sqlx::Error) -> Self {
        InfraError(e.to_string())
    }
}

impl From<DirectoryError> for InfraError {
    fn from(e: DirectoryError) -> Self {
        InfraError(e.to_string())
    }
}

/// Degraded state reported by the tenant context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TenantError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TenantError::Resolve(e) => e.is_retryable(),
            TenantError::Connection(e) => e.is_retryable(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<TenantError> for AppError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::Resolve(e) => AppError::Resolve(e),
            TenantError::Connection(e) => AppError::Connection(e),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            // Unresolved tenants all render the same generic page.
            AppError::Resolve(ResolveError::NotFound { .. }) => (StatusCode::NOT_FOUND, "store_unavailable"),
            AppError::Resolve(ResolveError::LookupFailed(_)) => (StatusCode::SERVICE_UNAVAILABLE, "lookup_failed"),
            AppError::Connection(ConnectionError::TenantUnavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            AppError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "connection_failed"),
            AppError::Provision(ProvisionError::InvalidRequest(_)) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Provision(ProvisionError::InvalidTransition { .. }) => (StatusCode::CONFLICT, "conflict"),
            AppError::Provision(ProvisionError::JobStore(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "job_store_error")
            }
            AppError::Provision(ProvisionError::Directory(_)) => (StatusCode::SERVICE_UNAVAILABLE, "lookup_failed"),
            AppError::Provision(_) => (StatusCode::BAD_GATEWAY, "provisioning_failed"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        let details = match &self {
            AppError::Provision(e) => e
                .failed_step()
                .map(|step| serde_json::json!({ "failedStep": step })),
            _ => None,
        };
        let message = match &self {
            AppError::Resolve(ResolveError::NotFound { .. }) => "store unavailable".to_string(),
            _ => self.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
