//! Tenant database provisioning: organization record, database, baseline schema.
//!
//! A job's state is persisted before the step it names runs, so a job found at
//! state S has not finished S. Resuming re-runs S; every step is idempotent.

pub mod cluster;
pub mod infra;
pub mod job;

pub use cluster::PgClusterProvider;
pub use infra::{InfrastructureProvider, SchemaMigrator};
pub use job::{
    JobStore, ProvisionFailure, ProvisionRequest, ProvisioningJob, ProvisioningState, ProvisioningStep, StateChange,
};

use crate::config::ProvisioningSettings;
use crate::directory::OrganizationDirectory;
use crate::error::{InfraError, ProvisionError};
use crate::tenant::{OrganizationStatus, TenantId};
use tokio::sync::OwnedMutexGuard;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReceipt {
    pub organization_id: TenantId,
    pub tenant_database_id: String,
}

/// Wire shape of a provisioning result: `{success, tenantDatabaseId}` or `{success, error, failedStep}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_database_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<ProvisioningStep>,
}

impl From<Result<ProvisionReceipt, ProvisionError>> for ProvisionOutcome {
    fn from(result: Result<ProvisionReceipt, ProvisionError>) -> Self {
        match result {
            Ok(receipt) => ProvisionOutcome {
                success: true,
                tenant_database_id: Some(receipt.tenant_database_id),
                error: None,
                failed_step: None,
            },
            Err(e) => ProvisionOutcome {
                success: false,
                tenant_database_id: None,
                failed_step: e.failed_step(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisionerOptions {
    pub step_timeout: Duration,
    /// Empty means any region.
    pub allowed_regions: Vec<String>,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self::from_settings(&ProvisioningSettings::default())
    }
}

impl ProvisionerOptions {
    pub fn from_settings(settings: &ProvisioningSettings) -> Self {
        ProvisionerOptions {
            step_timeout: settings.step_timeout,
            allowed_regions: settings.allowed_regions.clone(),
        }
    }
}

type RunLocks = Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive right to run one organization's job. Dropping it removes the map entry
/// once no other run holds or awaits it.
struct RunGuard<'a> {
    held: Option<OwnedMutexGuard<()>>,
    locks: &'a RunLocks,
    organization_id: TenantId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.organization_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.organization_id);
        }
    }
}

pub struct Provisioner {
    directory: Arc<dyn OrganizationDirectory>,
    jobs: Arc<dyn JobStore>,
    infrastructure: Arc<dyn InfrastructureProvider>,
    migrator: Arc<dyn SchemaMigrator>,
    options: ProvisionerOptions,
    /// Serializes runs per organization.
    guards: RunLocks,
    events: broadcast::Sender<ProvisioningJob>,
}

impl Provisioner {
    pub fn new(
        directory: Arc<dyn OrganizationDirectory>,
        jobs: Arc<dyn JobStore>,
        infrastructure: Arc<dyn InfrastructureProvider>,
        migrator: Arc<dyn SchemaMigrator>,
        options: ProvisionerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Provisioner {
            directory,
            jobs,
            infrastructure,
            migrator,
            options,
            guards: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Every persisted job change, in order, for all organizations.
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningJob> {
        self.events.subscribe()
    }

    pub async fn status(&self, organization_id: &TenantId) -> Result<Option<ProvisioningJob>, ProvisionError> {
        self.jobs.load(organization_id).await
    }

    /// Run (or continue) provisioning for a new store and wait for the outcome.
    ///
    /// Re-submitting for an organization that already has a job continues that job:
    /// a completed job returns its receipt, a failed one starts a new attempt at the
    /// failed step.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionReceipt, ProvisionError> {
        request.validate(&self.options.allowed_regions)?;
        let _running = self.lock_run(&request.organization_id).await;
        let job = self.load_or_create(&request).await?;
        self.drive(job).await
    }

    /// Continue the existing job for `organization_id`.
    pub async fn resume(&self, organization_id: &TenantId) -> Result<ProvisionReceipt, ProvisionError> {
        let _running = self.lock_run(organization_id).await;
        let job = self.jobs.load(organization_id).await?.ok_or_else(|| {
            ProvisionError::InvalidRequest(format!("no provisioning job for organization {}", organization_id))
        })?;
        self.drive(job).await
    }

    /// Persist the job and run it in the background. Returns the job as first recorded.
    pub async fn submit(self: &Arc<Self>, request: ProvisionRequest) -> Result<ProvisioningJob, ProvisionError> {
        request.validate(&self.options.allowed_regions)?;
        let job = {
            let _running = self.lock_run(&request.organization_id).await;
            self.load_or_create(&request).await?
        };
        let provisioner = Arc::clone(self);
        tokio::spawn(async move {
            let organization_id = request.organization_id.clone();
            if let Err(e) = provisioner.provision(request).await {
                tracing::warn!(organization_id = %organization_id, error = %e, "background provisioning failed");
            }
        });
        Ok(job)
    }

    async fn lock_run(&self, organization_id: &TenantId) -> RunGuard<'_> {
        let lock = {
            let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(guards.entry(organization_id.clone()).or_default())
        };
        RunGuard {
            held: Some(lock.lock_owned().await),
            locks: &self.guards,
            organization_id: organization_id.clone(),
        }
    }

    async fn load_or_create(&self, request: &ProvisionRequest) -> Result<ProvisioningJob, ProvisionError> {
        if let Some(job) = self.jobs.load(&request.organization_id).await? {
            tracing::debug!(
                organization_id = %request.organization_id,
                state = %job.state,
                "provisioning job already exists"
            );
            return Ok(job);
        }
        let job = ProvisioningJob::new(request);
        self.persist(&job).await?;
        tracing::info!(organization_id = %job.organization_id, job_id = %job.id, "provisioning job created");
        Ok(job)
    }

    async fn persist(&self, job: &ProvisioningJob) -> Result<(), ProvisionError> {
        self.jobs.save(job).await?;
        // No subscribers is fine.
        let _ = self.events.send(job.clone());
        Ok(())
    }

    async fn drive(&self, mut job: ProvisioningJob) -> Result<ProvisionReceipt, ProvisionError> {
        if job.state == ProvisioningState::Failed {
            let step = job.begin_retry()?;
            tracing::info!(
                organization_id = %job.organization_id,
                attempt = job.attempt,
                step = %step,
                "retrying provisioning"
            );
            self.persist(&job).await?;
        }

        loop {
            let next = match job.state {
                ProvisioningState::Complete => {
                    self.mark_ready(&job.organization_id).await?;
                    return receipt(&job);
                }
                ProvisioningState::Failed => {
                    return Err(job
                        .error()
                        .unwrap_or_else(|| ProvisionError::JobStore("failed job without an error".into())))
                }
                ProvisioningState::Pending => ProvisioningState::CreatingOrganization,
                ProvisioningState::CreatingOrganization => ProvisioningState::ProvisioningDatabase,
                ProvisioningState::ProvisioningDatabase => ProvisioningState::RunningMigrations,
                ProvisioningState::RunningMigrations => ProvisioningState::Complete,
            };

            if let Some(step) = job.state.step() {
                if let Err(e) = self.run_step(&mut job, step).await {
                    return Err(self.record_failure(job, step, e).await);
                }
            }
            job.transition(next)?;
            self.persist(&job).await?;
            tracing::info!(organization_id = %job.organization_id, state = %job.state, "provisioning advanced");
        }
    }

    async fn run_step(&self, job: &mut ProvisioningJob, step: ProvisioningStep) -> Result<(), InfraError> {
        let timeout = self.options.step_timeout;
        let work = async {
            match step {
                ProvisioningStep::CreateOrganization => self.create_organization(job).await,
                ProvisioningStep::ProvisionDatabase => self.provision_database(job).await,
                ProvisioningStep::RunMigrations => self.run_migrations(job).await,
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(InfraError(format!("{} timed out after {}s", step, timeout.as_secs_f64()))),
        }
    }

    async fn create_organization(&self, job: &ProvisioningJob) -> Result<(), InfraError> {
        let org = self.directory.create_organization(job.new_organization()).await?;
        if org.status == OrganizationStatus::Unprovisioned {
            self.directory
                .set_status(&job.organization_id, OrganizationStatus::Provisioning)
                .await?;
        }
        Ok(())
    }

    async fn provision_database(&self, job: &mut ProvisioningJob) -> Result<(), InfraError> {
        let id = &job.organization_id;
        let database = match self.infrastructure.find_database(id).await? {
            Some(existing) => {
                tracing::debug!(organization_id = %id, database_id = %existing.id, "reusing tenant database");
                existing
            }
            None => self.infrastructure.create_database(id, &job.region).await?,
        };
        self.directory.attach_database(id, &database).await?;
        job.tenant_database_id = Some(database.id);
        Ok(())
    }

    async fn run_migrations(&self, job: &ProvisioningJob) -> Result<(), InfraError> {
        let id = &job.organization_id;
        let org = self
            .directory
            .find_by_id(id)
            .await?
            .ok_or_else(|| InfraError(format!("organization {} is missing", id)))?;
        let database = org
            .tenant_database
            .ok_or_else(|| InfraError(format!("organization {} has no tenant database", id)))?;
        self.migrator.migrate(&database).await?;
        Ok(())
    }

    /// Runs only once the job is persisted as complete, so a ready organization always
    /// has a complete job. Repeated on every later pass until it sticks.
    async fn mark_ready(&self, organization_id: &TenantId) -> Result<(), ProvisionError> {
        let org = self
            .directory
            .find_by_id(organization_id)
            .await?
            .ok_or_else(|| ProvisionError::Directory(format!("organization {} is missing", organization_id)))?;
        if matches!(
            org.status,
            OrganizationStatus::Provisioning | OrganizationStatus::Unprovisioned
        ) {
            self.directory.set_status(organization_id, OrganizationStatus::Ready).await?;
            self.directory.refresh().await;
            tracing::info!(organization_id = %organization_id, "organization ready");
        }
        Ok(())
    }

    async fn record_failure(&self, mut job: ProvisioningJob, step: ProvisioningStep, cause: InfraError) -> ProvisionError {
        tracing::warn!(
            organization_id = %job.organization_id,
            attempt = job.attempt,
            step = %step,
            error = %cause,
            "provisioning step failed"
        );
        if let Err(e) = job.fail(cause.0.clone()) {
            return e;
        }
        self.flag_unprovisioned(&job.organization_id).await;
        if let Err(e) = self.persist(&job).await {
            return e;
        }
        ProvisionError::for_step(step, cause.0)
    }

    /// An organization left behind by a failed run must not look ready.
    async fn flag_unprovisioned(&self, organization_id: &TenantId) {
        match self.directory.find_by_id(organization_id).await {
            Ok(Some(org)) if org.status != OrganizationStatus::Ready => {
                if let Err(e) = self
                    .directory
                    .set_status(organization_id, OrganizationStatus::Unprovisioned)
                    .await
                {
                    tracing::warn!(organization_id = %organization_id, error = %e, "could not flag organization unprovisioned");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(organization_id = %organization_id, error = %e, "could not load organization after failure")
            }
        }
    }
}

fn receipt(job: &ProvisioningJob) -> Result<ProvisionReceipt, ProvisionError> {
    let tenant_database_id = job
        .tenant_database_id
        .clone()
        .ok_or_else(|| ProvisionError::JobStore("completed job has no tenant database".into()))?;
    Ok(ProvisionReceipt {
        organization_id: job.organization_id.clone(),
        tenant_database_id,
    })
}
