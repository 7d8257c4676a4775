//! Provisioning job: persisted state machine for one organization's tenant database.

use crate::error::ProvisionError;
use crate::tenant::{slugify, NewOrganization, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Pending,
    CreatingOrganization,
    ProvisioningDatabase,
    RunningMigrations,
    Complete,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Pending => "pending",
            ProvisioningState::CreatingOrganization => "creating_organization",
            ProvisioningState::ProvisioningDatabase => "provisioning_database",
            ProvisioningState::RunningMigrations => "running_migrations",
            ProvisioningState::Complete => "complete",
            ProvisioningState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Complete | ProvisioningState::Failed)
    }

    /// Step executed while the job sits in this state.
    pub fn step(&self) -> Option<ProvisioningStep> {
        match self {
            ProvisioningState::CreatingOrganization => Some(ProvisioningStep::CreateOrganization),
            ProvisioningState::ProvisioningDatabase => Some(ProvisioningStep::ProvisionDatabase),
            ProvisioningState::RunningMigrations => Some(ProvisioningStep::RunMigrations),
            _ => None,
        }
    }

    /// Forward-only: one step ahead, or any live state to `Failed`.
    pub fn can_transition(from: ProvisioningState, to: ProvisioningState) -> bool {
        use ProvisioningState::*;

        match (from, to) {
            (Pending, CreatingOrganization) => true,
            (CreatingOrganization, ProvisioningDatabase) => true,
            (ProvisioningDatabase, RunningMigrations) => true,
            (RunningMigrations, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProvisioningState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProvisioningState::Pending),
            "creating_organization" => Ok(ProvisioningState::CreatingOrganization),
            "provisioning_database" => Ok(ProvisioningState::ProvisioningDatabase),
            "running_migrations" => Ok(ProvisioningState::RunningMigrations),
            "complete" => Ok(ProvisioningState::Complete),
            "failed" => Ok(ProvisioningState::Failed),
            _ => Err(format!("invalid provisioning state: {}", s)),
        }
    }
}

/// The three units of work; each maps to its own error variant and retry action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    CreateOrganization,
    ProvisionDatabase,
    RunMigrations,
}

impl ProvisioningStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStep::CreateOrganization => "create_organization",
            ProvisioningStep::ProvisionDatabase => "provision_database",
            ProvisioningStep::RunMigrations => "run_migrations",
        }
    }

    pub fn state(&self) -> ProvisioningState {
        match self {
            ProvisioningStep::CreateOrganization => ProvisioningState::CreatingOrganization,
            ProvisioningStep::ProvisionDatabase => ProvisioningState::ProvisioningDatabase,
            ProvisioningStep::RunMigrations => ProvisioningState::RunningMigrations,
        }
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProvisioningStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_organization" => Ok(ProvisioningStep::CreateOrganization),
            "provision_database" => Ok(ProvisioningStep::ProvisionDatabase),
            "run_migrations" => Ok(ProvisioningStep::RunMigrations),
            _ => Err(format!("invalid provisioning step: {}", s)),
        }
    }
}

/// New-store submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub organization_id: TenantId,
    pub display_name: String,
    pub region: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ProvisionRequest {
    pub fn new(organization_id: impl Into<TenantId>, display_name: impl Into<String>, region: impl Into<String>) -> Self {
        ProvisionRequest {
            organization_id: organization_id.into(),
            display_name: display_name.into(),
            region: region.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `allowed_regions` empty means any region.
    pub fn validate(&self, allowed_regions: &[String]) -> Result<(), ProvisionError> {
        if self.organization_id.as_str().trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("organizationId is required".into()));
        }
        if slugify(&self.display_name).is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "displayName must contain at least one letter or digit".into(),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("region is required".into()));
        }
        if !allowed_regions.is_empty() && !allowed_regions.iter().any(|r| r == &self.region) {
            return Err(ProvisionError::InvalidRequest(format!("unsupported region: {}", self.region)));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionFailure {
    pub step: ProvisioningStep,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub state: ProvisioningState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// One job lineage per organization id; retries bump `attempt` instead of creating a new job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningJob {
    pub id: Uuid,
    pub organization_id: TenantId,
    pub display_name: String,
    pub slug: String,
    pub description: Option<String>,
    pub region: String,
    pub state: ProvisioningState,
    pub attempt: u32,
    pub last_error: Option<ProvisionFailure>,
    pub tenant_database_id: Option<String>,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningJob {
    pub fn new(request: &ProvisionRequest) -> Self {
        let now = Utc::now();
        ProvisioningJob {
            id: Uuid::new_v4(),
            organization_id: request.organization_id.clone(),
            display_name: request.display_name.trim().to_string(),
            slug: slugify(&request.display_name),
            description: request.description.clone(),
            region: request.region.clone(),
            state: ProvisioningState::Pending,
            attempt: 1,
            last_error: None,
            tenant_database_id: None,
            history: vec![StateChange {
                state: ProvisioningState::Pending,
                attempt: 1,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: ProvisioningState) -> Result<(), ProvisionError> {
        if !ProvisioningState::can_transition(self.state, to) {
            return Err(ProvisionError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.record(to);
        Ok(())
    }

    /// Mark the current step failed.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<ProvisioningStep, ProvisionError> {
        let step = self.state.step().ok_or_else(|| ProvisionError::InvalidTransition {
            from: self.state.to_string(),
            to: ProvisioningState::Failed.to_string(),
        })?;
        self.transition(ProvisioningState::Failed)?;
        self.last_error = Some(ProvisionFailure {
            step,
            message: message.into(),
            at: self.updated_at,
        });
        Ok(step)
    }

    /// Start a new attempt at the step that failed.
    pub fn begin_retry(&mut self) -> Result<ProvisioningStep, ProvisionError> {
        let step = match (&self.state, &self.last_error) {
            (ProvisioningState::Failed, Some(failure)) => failure.step,
            _ => {
                return Err(ProvisionError::InvalidTransition {
                    from: self.state.to_string(),
                    to: "retry".into(),
                })
            }
        };
        self.attempt += 1;
        self.record(step.state());
        Ok(step)
    }

    pub fn failed_step(&self) -> Option<ProvisioningStep> {
        match self.state {
            ProvisioningState::Failed => self.last_error.as_ref().map(|f| f.step),
            _ => None,
        }
    }

    /// Typed error for a job sitting in `Failed`.
    pub fn error(&self) -> Option<ProvisionError> {
        self.failed_step().zip(self.last_error.as_ref()).map(|(step, failure)| {
            ProvisionError::for_step(step, failure.message.clone())
        })
    }

    pub fn new_organization(&self) -> NewOrganization {
        NewOrganization {
            id: self.organization_id.clone(),
            name: self.display_name.clone(),
            slug: self.slug.clone(),
            subdomain: self.slug.clone(),
            description: self.description.clone(),
        }
    }

    fn record(&mut self, state: ProvisioningState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        self.history.push(StateChange {
            state,
            attempt: self.attempt,
            at: now,
        });
    }
}

/// Persistence for provisioning jobs, keyed by organization id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, organization_id: &TenantId) -> Result<Option<ProvisioningJob>, ProvisionError>;

    async fn save(&self, job: &ProvisioningJob) -> Result<(), ProvisionError>;
}
