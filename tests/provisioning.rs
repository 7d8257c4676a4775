use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront_tenancy::error::InfraError;
use storefront_tenancy::memory::{InMemoryDirectory, InMemoryInfrastructure, InMemoryJobStore, InMemoryMigrator};
use storefront_tenancy::provision::{
    InfrastructureProvider, JobStore, PgClusterProvider, ProvisionRequest, Provisioner, ProvisionerOptions,
    ProvisioningJob, ProvisioningState, ProvisioningStep,
};
use storefront_tenancy::tenant::TenantDatabase;
use storefront_tenancy::{OrganizationDirectory, OrganizationStatus, ProvisionError, TenantId};

struct Harness {
    directory: Arc<InMemoryDirectory>,
    jobs: Arc<InMemoryJobStore>,
    infra: Arc<InMemoryInfrastructure>,
    migrator: Arc<InMemoryMigrator>,
    provisioner: Arc<Provisioner>,
}

fn harness(step_timeout: Duration) -> Harness {
    let directory = Arc::new(InMemoryDirectory::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let infra = Arc::new(InMemoryInfrastructure::new());
    let migrator = Arc::new(InMemoryMigrator::new());
    let provisioner = Arc::new(Provisioner::new(
        directory.clone(),
        jobs.clone(),
        infra.clone(),
        migrator.clone(),
        ProvisionerOptions {
            step_timeout,
            allowed_regions: vec!["local".into(), "eu-west".into()],
        },
    ));
    Harness {
        directory,
        jobs,
        infra,
        migrator,
        provisioner,
    }
}

fn my_shop() -> ProvisionRequest {
    ProvisionRequest::new("org-1", "My Shop", "local").with_description("Homewares")
}

#[tokio::test]
async fn my_shop_walks_every_state_to_complete() {
    let h = harness(Duration::from_secs(5));
    let mut events = h.provisioner.subscribe();

    let receipt = h.provisioner.provision(my_shop()).await.unwrap();
    assert_eq!(receipt.organization_id.as_str(), "org-1");
    assert_eq!(receipt.tenant_database_id, "db-org-1");

    let mut states = Vec::new();
    while let Ok(job) = events.try_recv() {
        states.push(job.state);
    }
    assert_eq!(
        states,
        vec![
            ProvisioningState::Pending,
            ProvisioningState::CreatingOrganization,
            ProvisioningState::ProvisioningDatabase,
            ProvisioningState::RunningMigrations,
            ProvisioningState::Complete,
        ]
    );

    let org = h.directory.get("org-1").unwrap();
    assert_eq!(org.slug, "my-shop");
    assert_eq!(org.subdomain, "my-shop");
    assert_eq!(org.description.as_deref(), Some("Homewares"));
    assert_eq!(org.status, OrganizationStatus::Ready);
    assert!(org.is_resolvable());
    assert_eq!(h.migrator.migrated(), vec!["db-org-1".to_string()]);

    let job = h.provisioner.status(&TenantId::new("org-1")).await.unwrap().unwrap();
    assert_eq!(job.state, ProvisioningState::Complete);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn retry_after_database_failure_does_not_duplicate_organization() {
    let h = harness(Duration::from_secs(5));
    h.infra.fail_next(1);

    let err = h.provisioner.provision(my_shop()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::DatabaseProvisionFailed(_)));
    assert_eq!(err.failed_step(), Some(ProvisioningStep::ProvisionDatabase));

    let org = h.directory.get("org-1").unwrap();
    assert_eq!(org.status, OrganizationStatus::Unprovisioned);
    assert!(!org.is_resolvable());
    let job = h.jobs.get("org-1").unwrap();
    assert_eq!(job.state, ProvisioningState::Failed);
    assert_eq!(job.failed_step(), Some(ProvisioningStep::ProvisionDatabase));

    let receipt = h.provisioner.resume(&TenantId::new("org-1")).await.unwrap();
    assert_eq!(receipt.tenant_database_id, "db-org-1");

    assert_eq!(h.directory.len(), 1);
    assert_eq!(h.directory.create_calls(), 1, "retry starts at the failed step");
    assert_eq!(h.jobs.len(), 1);
    let job = h.jobs.get("org-1").unwrap();
    assert_eq!(job.state, ProvisioningState::Complete);
    assert_eq!(job.attempt, 2);
    assert_eq!(h.directory.get("org-1").unwrap().status, OrganizationStatus::Ready);
}

#[tokio::test]
async fn resubmitting_the_same_request_continues_the_failed_job() {
    let h = harness(Duration::from_secs(5));
    h.infra.fail_next(1);
    assert!(h.provisioner.provision(my_shop()).await.is_err());

    let receipt = h.provisioner.provision(my_shop()).await.unwrap();
    assert_eq!(receipt.tenant_database_id, "db-org-1");
    assert_eq!(h.directory.len(), 1);
    assert_eq!(h.jobs.get("org-1").unwrap().attempt, 2);

    // Completed jobs just return their receipt.
    let again = h.provisioner.provision(my_shop()).await.unwrap();
    assert_eq!(again, receipt);
    assert_eq!(h.infra.create_calls(), 2);
}

#[tokio::test]
async fn migration_failure_retries_only_the_migration() {
    let h = harness(Duration::from_secs(5));
    h.migrator.fail_next(1);

    let err = h.provisioner.provision(my_shop()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::MigrationFailed(_)));
    assert_eq!(h.directory.get("org-1").unwrap().status, OrganizationStatus::Unprovisioned);

    h.provisioner.resume(&TenantId::new("org-1")).await.unwrap();
    assert_eq!(h.infra.create_calls(), 1);
    assert_eq!(h.migrator.migrated(), vec!["db-org-1".to_string()]);
}

#[tokio::test]
async fn hung_step_times_out_as_typed_failure() {
    let h = harness(Duration::from_millis(50));
    h.infra.set_delay(Duration::from_secs(5));

    let err = h.provisioner.provision(my_shop()).await.unwrap_err();
    match err {
        ProvisionError::DatabaseProvisionFailed(message) => assert!(message.contains("timed out")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.jobs.get("org-1").unwrap().state, ProvisioningState::Failed);

    h.infra.set_delay(Duration::ZERO);
    h.provisioner.resume(&TenantId::new("org-1")).await.unwrap();
    assert_eq!(h.infra.database_count(), 1);
}

#[tokio::test]
async fn concurrent_submissions_for_one_organization_provision_once() {
    let h = harness(Duration::from_secs(5));
    h.infra.set_delay(Duration::from_millis(30));

    let (a, b) = tokio::join!(h.provisioner.provision(my_shop()), h.provisioner.provision(my_shop()));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(h.infra.create_calls(), 1);
    assert_eq!(h.directory.len(), 1);
    assert_eq!(h.jobs.len(), 1);
}

#[tokio::test]
async fn abandoned_job_is_resumed_from_its_persisted_state() {
    let h = harness(Duration::from_secs(5));
    let request = my_shop();
    // An earlier run created the organization and persisted the next state, then stopped.
    let mut job = ProvisioningJob::new(&request);
    h.directory.create_organization(job.new_organization()).await.unwrap();
    job.transition(ProvisioningState::CreatingOrganization).unwrap();
    job.transition(ProvisioningState::ProvisioningDatabase).unwrap();
    h.jobs.save(&job).await.unwrap();

    let receipt = h.provisioner.resume(&TenantId::new("org-1")).await.unwrap();
    assert_eq!(receipt.tenant_database_id, "db-org-1");
    assert_eq!(h.directory.create_calls(), 1);
    assert_eq!(h.jobs.get("org-1").unwrap().id, job.id);
}

#[tokio::test]
async fn taken_slug_fails_at_organization_step() {
    let h = harness(Duration::from_secs(5));
    h.directory.insert_ready("other", "My Shop", "my-shop");

    let err = h.provisioner.provision(my_shop()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::OrganizationCreateFailed(_)));
    assert_eq!(h.directory.get("other").unwrap().status, OrganizationStatus::Ready);
    assert!(h.directory.get("org-1").is_none());
    assert_eq!(h.infra.create_calls(), 0);
}

#[tokio::test]
async fn invalid_requests_create_no_job() {
    let h = harness(Duration::from_secs(5));
    let err = h
        .provisioner
        .provision(ProvisionRequest::new("org-9", "Shop", "mars"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidRequest(_)));

    let err = h.provisioner.resume(&TenantId::new("org-9")).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidRequest(_)));
    assert!(h.jobs.is_empty());
}

/// Job store that records the organization's status at every save.
struct StatusAtSave {
    jobs: InMemoryJobStore,
    directory: Arc<InMemoryDirectory>,
    seen: Mutex<Vec<(ProvisioningState, Option<OrganizationStatus>)>>,
}

#[async_trait]
impl JobStore for StatusAtSave {
    async fn load(&self, organization_id: &TenantId) -> Result<Option<ProvisioningJob>, ProvisionError> {
        self.jobs.load(organization_id).await
    }

    async fn save(&self, job: &ProvisioningJob) -> Result<(), ProvisionError> {
        let status = self.directory.get(job.organization_id.as_str()).map(|o| o.status);
        self.seen.lock().unwrap().push((job.state, status));
        self.jobs.save(job).await
    }
}

#[tokio::test]
async fn organization_turns_ready_only_after_job_completes() {
    let directory = Arc::new(InMemoryDirectory::new());
    let jobs = Arc::new(StatusAtSave {
        jobs: InMemoryJobStore::new(),
        directory: directory.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let provisioner = Provisioner::new(
        directory.clone(),
        jobs.clone(),
        Arc::new(InMemoryInfrastructure::new()),
        Arc::new(InMemoryMigrator::new()),
        ProvisionerOptions::default(),
    );

    provisioner.provision(my_shop()).await.unwrap();

    let seen = jobs.seen.lock().unwrap().clone();
    assert_eq!(seen.last().map(|(state, _)| *state), Some(ProvisioningState::Complete));
    for (state, status) in &seen {
        assert_ne!(*status, Some(OrganizationStatus::Ready), "ready while job was {state}");
    }
    assert_eq!(directory.get("org-1").unwrap().status, OrganizationStatus::Ready);
}

#[tokio::test]
async fn migration_timeout_leaves_organization_unresolvable() {
    let h = harness(Duration::from_millis(50));
    h.migrator.set_delay(Duration::from_secs(5));

    let err = h.provisioner.provision(my_shop()).await.unwrap_err();
    match &err {
        ProvisionError::MigrationFailed(message) => assert!(message.contains("timed out")),
        other => panic!("unexpected error: {other:?}"),
    }
    let org = h.directory.get("org-1").unwrap();
    assert_eq!(org.status, OrganizationStatus::Unprovisioned);
    assert!(!org.is_resolvable());
    assert_eq!(h.jobs.get("org-1").unwrap().state, ProvisioningState::Failed);

    h.migrator.set_delay(Duration::ZERO);
    h.provisioner.resume(&TenantId::new("org-1")).await.unwrap();
    assert_eq!(h.directory.get("org-1").unwrap().status, OrganizationStatus::Ready);
}

/// Keeps databases by their cluster name, the way a shared PostgreSQL cluster does.
#[derive(Default)]
struct NamedDatabases {
    databases: Mutex<HashMap<String, TenantDatabase>>,
}

#[async_trait]
impl InfrastructureProvider for NamedDatabases {
    async fn find_database(&self, organization_id: &TenantId) -> Result<Option<TenantDatabase>, InfraError> {
        let name = PgClusterProvider::database_name(organization_id);
        Ok(self.databases.lock().unwrap().get(&name).cloned())
    }

    async fn create_database(&self, organization_id: &TenantId, region: &str) -> Result<TenantDatabase, InfraError> {
        let name = PgClusterProvider::database_name(organization_id);
        let database = TenantDatabase {
            id: name.clone(),
            region: region.to_string(),
            connection_url: format!("postgres://cluster/{}", name),
        };
        self.databases.lock().unwrap().insert(name, database.clone());
        Ok(database)
    }
}

#[tokio::test]
async fn ids_differing_in_case_or_separator_get_their_own_databases() {
    let directory = Arc::new(InMemoryDirectory::new());
    let infra = Arc::new(NamedDatabases::default());
    let provisioner = Provisioner::new(
        directory.clone(),
        Arc::new(InMemoryJobStore::new()),
        infra.clone(),
        Arc::new(InMemoryMigrator::new()),
        ProvisionerOptions::default(),
    );

    let alpha = provisioner
        .provision(ProvisionRequest::new("Shop-1", "Alpha", "local"))
        .await
        .unwrap();
    let beta = provisioner
        .provision(ProvisionRequest::new("shop_1", "Beta", "local"))
        .await
        .unwrap();

    assert_ne!(alpha.tenant_database_id, beta.tenant_database_id);
    assert_eq!(infra.databases.lock().unwrap().len(), 2);
    let alpha_db = directory.get("Shop-1").unwrap().tenant_database.unwrap();
    let beta_db = directory.get("shop_1").unwrap().tenant_database.unwrap();
    assert_ne!(alpha_db.connection_url, beta_db.connection_url);
}
