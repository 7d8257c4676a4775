//! New-store provisioning: submit, poll, retry.

use crate::connection::ConnectionFactory;
use crate::error::{AppError, ProvisionError};
use crate::provision::{ProvisionOutcome, ProvisionRequest, ProvisioningState};
use crate::response::{accepted, success_one_ok};
use crate::state::AppState;
use crate::tenant::TenantId;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionBody {
    pub organization_id: String,
    pub display_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// POST /api/v1/provisioning — record the job and run it in the background.
pub async fn start_provisioning<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Json(body): Json<ProvisionBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let request = ProvisionRequest {
        organization_id: TenantId::new(body.organization_id.trim()),
        display_name: body.display_name,
        region: body.region.unwrap_or_else(|| state.default_region.clone()),
        description: body.description,
    };
    let job = state.provisioner.submit(request).await?;
    Ok(accepted(job))
}

/// GET /api/v1/provisioning/:organization_id
pub async fn provisioning_status<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Path(organization_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let job = state
        .provisioner
        .status(&TenantId::new(organization_id.as_str()))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("provisioning job not found: {}", organization_id)))?;
    Ok(success_one_ok(job))
}

/// POST /api/v1/provisioning/:organization_id/retry — new attempt at the failed step; waits for the result.
pub async fn retry_provisioning<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Path(organization_id): Path<String>,
) -> Result<Json<ProvisionOutcome>, AppError> {
    let organization_id = TenantId::new(organization_id);
    let job = state
        .provisioner
        .status(&organization_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("provisioning job not found: {}", organization_id)))?;
    if job.state != ProvisioningState::Failed {
        return Err(ProvisionError::InvalidTransition {
            from: job.state.to_string(),
            to: "retry".into(),
        }
        .into());
    }
    match state.provisioner.resume(&organization_id).await {
        // Step failures are an outcome; bookkeeping failures are errors.
        Err(
            e @ (ProvisionError::JobStore(_) | ProvisionError::Directory(_) | ProvisionError::InvalidTransition { .. }),
        ) => Err(e.into()),
        result => Ok(Json(ProvisionOutcome::from(result))),
    }
}
