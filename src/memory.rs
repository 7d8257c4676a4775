//! In-process implementations of every seam, for tests and local development.

use crate::connection::{ConnectionFactory, TenantDatabaseGate};
use crate::directory::OrganizationDirectory;
use crate::error::{ConnectionError, DirectoryError, InfraError, ProvisionError};
use crate::provision::{InfrastructureProvider, JobStore, ProvisioningJob, SchemaMigrator};
use crate::tenant::{
    NewOrganization, Organization, OrganizationStatus, SubscriptionStatus, TenantDatabase, TenantId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Directory kept in insertion order, which doubles as creation order.
#[derive(Default)]
pub struct InMemoryDirectory {
    organizations: Mutex<Vec<Organization>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
    create_calls: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, org: Organization) {
        let mut orgs = lock(&self.organizations);
        orgs.retain(|o| o.id != org.id);
        orgs.push(org);
    }

    /// A ready organization whose subdomain equals its slug.
    pub fn insert_ready(&self, id: &str, name: &str, slug: &str) -> Organization {
        let now = Utc::now();
        let org = Organization {
            id: TenantId::new(id),
            name: name.to_string(),
            slug: slug.to_string(),
            subdomain: slug.to_string(),
            description: None,
            custom_domain: None,
            subscription_status: SubscriptionStatus::Active,
            subscription_plan: None,
            status: OrganizationStatus::Ready,
            tenant_database: Some(TenantDatabase {
                id: format!("db-{}", id),
                region: "local".into(),
                connection_url: format!("memory://{}", id),
            }),
            created_at: now,
            updated_at: now,
        };
        self.insert(org.clone());
        org
    }

    /// Mutate a stored organization in place. Returns false when `id` is unknown.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Organization)) -> bool {
        let mut orgs = lock(&self.organizations);
        match orgs.iter_mut().find(|o| o.id.as_str() == id) {
            Some(org) => {
                f(org);
                org.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Organization> {
        lock(&self.organizations).iter().find(|o| o.id.as_str() == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.organizations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// While set, every call fails with `DirectoryError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory offline".into()));
        }
        Ok(())
    }

    fn find(&self, pred: impl Fn(&Organization) -> bool) -> Result<Option<Organization>, DirectoryError> {
        self.check()?;
        Ok(lock(&self.organizations).iter().find(|o| pred(o)).cloned())
    }
}

#[async_trait]
impl OrganizationDirectory for InMemoryDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Organization>, DirectoryError> {
        self.find(|o| &o.id == id)
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Organization>, DirectoryError> {
        self.find(|o| o.subdomain == subdomain)
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Organization>, DirectoryError> {
        self.find(|o| o.slug == slug)
    }

    async fn find_by_custom_domain(&self, domain: &str) -> Result<Option<Organization>, DirectoryError> {
        self.find(|o| {
            o.custom_domain
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(domain))
        })
    }

    async fn list_resolvable(&self) -> Result<Vec<Organization>, DirectoryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.organizations)
            .iter()
            .filter(|o| o.is_resolvable())
            .cloned()
            .collect())
    }

    async fn create_organization(&self, new: NewOrganization) -> Result<Organization, DirectoryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut orgs = lock(&self.organizations);
        if let Some(existing) = orgs.iter().find(|o| o.id == new.id) {
            return Ok(existing.clone());
        }
        if orgs.iter().any(|o| o.slug == new.slug || o.subdomain == new.subdomain) {
            return Err(DirectoryError::Conflict(format!(
                "slug or subdomain '{}' is already taken",
                new.slug
            )));
        }
        let now = Utc::now();
        let org = Organization {
            id: new.id,
            name: new.name,
            slug: new.slug,
            subdomain: new.subdomain,
            description: new.description,
            custom_domain: None,
            subscription_status: SubscriptionStatus::Trialing,
            subscription_plan: None,
            status: OrganizationStatus::Provisioning,
            tenant_database: None,
            created_at: now,
            updated_at: now,
        };
        orgs.push(org.clone());
        Ok(org)
    }

    async fn attach_database(&self, id: &TenantId, database: &TenantDatabase) -> Result<(), DirectoryError> {
        self.check()?;
        if self.update(id.as_str(), |o| o.tenant_database = Some(database.clone())) {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(id.to_string()))
        }
    }

    async fn set_status(&self, id: &TenantId, status: OrganizationStatus) -> Result<(), DirectoryError> {
        self.check()?;
        if self.update(id.as_str(), |o| o.status = status) {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(id.to_string()))
        }
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        self.check()
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<TenantId, ProvisioningJob>>,
    saves: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, organization_id: &str) -> Option<ProvisioningJob> {
        lock(&self.jobs).get(&TenantId::new(organization_id)).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load(&self, organization_id: &TenantId) -> Result<Option<ProvisioningJob>, ProvisionError> {
        Ok(lock(&self.jobs).get(organization_id).cloned())
    }

    async fn save(&self, job: &ProvisioningJob) -> Result<(), ProvisionError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        lock(&self.jobs).insert(job.organization_id.clone(), job.clone());
        Ok(())
    }
}

/// Records created databases; can be told to fail or stall.
#[derive(Default)]
pub struct InMemoryInfrastructure {
    databases: Mutex<HashMap<TenantId, TenantDatabase>>,
    failures_left: AtomicU32,
    delay: Mutex<Duration>,
    create_calls: AtomicUsize,
}

impl InMemoryInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` calls to `create_database` fail.
    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    /// Every `create_database` call sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn database_count(&self) -> usize {
        lock(&self.databases).len()
    }
}

#[async_trait]
impl InfrastructureProvider for InMemoryInfrastructure {
    async fn find_database(&self, organization_id: &TenantId) -> Result<Option<TenantDatabase>, InfraError> {
        Ok(lock(&self.databases).get(organization_id).cloned())
    }

    async fn create_database(&self, organization_id: &TenantId, region: &str) -> Result<TenantDatabase, InfraError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(InfraError("database quota exceeded".into()));
        }
        let database = TenantDatabase {
            id: format!("db-{}", organization_id),
            region: region.to_string(),
            connection_url: format!("memory://{}", organization_id),
        };
        lock(&self.databases).insert(organization_id.clone(), database.clone());
        Ok(database)
    }
}

#[derive(Default)]
pub struct InMemoryMigrator {
    failures_left: AtomicU32,
    delay: Mutex<Duration>,
    migrated: Mutex<Vec<String>>,
}

impl InMemoryMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Database ids in migration order; repeats show re-runs.
    pub fn migrated(&self) -> Vec<String> {
        lock(&self.migrated).clone()
    }
}

#[async_trait]
impl SchemaMigrator for InMemoryMigrator {
    async fn migrate(&self, database: &TenantDatabase) -> Result<(), InfraError> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(InfraError(format!("migration of {} failed", database.id)));
        }
        lock(&self.migrated).push(database.id.clone());
        Ok(())
    }
}

/// Handle produced by [`InMemoryConnectionFactory`]; `serial` is unique per connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryHandle {
    pub tenant_id: TenantId,
    pub serial: u64,
    /// Set when the factory goes through a [`TenantDatabaseGate`].
    pub database_id: Option<String>,
}

/// Counts connects and releases; can be told to fail or stall.
#[derive(Default)]
pub struct InMemoryConnectionFactory {
    gate: Option<TenantDatabaseGate>,
    serial: AtomicU64,
    connects: AtomicUsize,
    releases: AtomicUsize,
    failures_left: AtomicU32,
    unavailable: Mutex<Vec<TenantId>>,
    delay: Mutex<Duration>,
}

impl InMemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        let factory = Self::default();
        factory.set_delay(delay);
        factory
    }

    /// Resolve (and if needed provision) the tenant database before every connect.
    pub fn with_gate(mut self, gate: TenantDatabaseGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// The next `times` connects fail with a retryable error.
    pub fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    /// Connects for `tenant_id` fail with `TenantUnavailable` (not retryable).
    pub fn mark_unavailable(&self, tenant_id: &str) {
        lock(&self.unavailable).push(TenantId::new(tenant_id));
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryConnectionFactory {
    type Handle = MemoryHandle;

    async fn connect(&self, tenant_id: &TenantId) -> Result<MemoryHandle, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let database_id = match &self.gate {
            Some(gate) => Some(gate.ready_database(tenant_id).await?.id),
            None => None,
        };
        if lock(&self.unavailable).contains(tenant_id) {
            return Err(ConnectionError::TenantUnavailable {
                tenant_id: tenant_id.to_string(),
                reason: "tenant database is not provisioned".into(),
            });
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::AcquisitionFailed {
                tenant_id: tenant_id.to_string(),
                message: "connection refused".into(),
            });
        }
        Ok(MemoryHandle {
            tenant_id: tenant_id.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            database_id,
        })
    }

    async fn release(&self, _tenant_id: &TenantId, _handle: &MemoryHandle) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
