//! Organization directory: the store the resolver reads and the provisioner writes.

use crate::error::DirectoryError;
use crate::tenant::{NewOrganization, Organization, OrganizationStatus, TenantDatabase, TenantId};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Organization>, DirectoryError>;

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Organization>, DirectoryError>;

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Organization>, DirectoryError>;

    async fn find_by_custom_domain(&self, domain: &str) -> Result<Option<Organization>, DirectoryError>;

    /// All organizations the resolver may hand out, oldest first.
    async fn list_resolvable(&self) -> Result<Vec<Organization>, DirectoryError>;

    /// Insert the record, or return the existing one when `id` is already present.
    /// Fails with `Conflict` when slug or subdomain belongs to a different id.
    async fn create_organization(&self, new: NewOrganization) -> Result<Organization, DirectoryError>;

    async fn attach_database(&self, id: &TenantId, database: &TenantDatabase) -> Result<(), DirectoryError>;

    async fn set_status(&self, id: &TenantId, status: OrganizationStatus) -> Result<(), DirectoryError>;

    /// Drop any cached tenant list. No-op for uncached stores.
    async fn refresh(&self) {}

    /// Reachability check for readiness probes.
    async fn ping(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

struct Snapshot {
    loaded_at: Instant,
    organizations: Arc<Vec<Organization>>,
}

/// Caches `list_resolvable` for `ttl`; every other call goes straight to the inner store.
pub struct CachedDirectory {
    inner: Arc<dyn OrganizationDirectory>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn OrganizationDirectory>, ttl: Duration) -> Self {
        CachedDirectory {
            inner,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<Vec<Organization>>> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.organizations))
    }

    fn clear(&self) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

#[async_trait]
impl OrganizationDirectory for CachedDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Organization>, DirectoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Organization>, DirectoryError> {
        self.inner.find_by_subdomain(subdomain).await
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Organization>, DirectoryError> {
        self.inner.find_by_slug(slug).await
    }

    async fn find_by_custom_domain(&self, domain: &str) -> Result<Option<Organization>, DirectoryError> {
        self.inner.find_by_custom_domain(domain).await
    }

    async fn list_resolvable(&self) -> Result<Vec<Organization>, DirectoryError> {
        if let Some(orgs) = self.cached() {
            return Ok(orgs.as_ref().clone());
        }
        let orgs = self.inner.list_resolvable().await?;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Snapshot {
            loaded_at: Instant::now(),
            organizations: Arc::new(orgs.clone()),
        });
        Ok(orgs)
    }

    async fn create_organization(&self, new: NewOrganization) -> Result<Organization, DirectoryError> {
        let org = self.inner.create_organization(new).await?;
        self.clear();
        Ok(org)
    }

    async fn attach_database(&self, id: &TenantId, database: &TenantDatabase) -> Result<(), DirectoryError> {
        self.inner.attach_database(id, database).await?;
        self.clear();
        Ok(())
    }

    async fn set_status(&self, id: &TenantId, status: OrganizationStatus) -> Result<(), DirectoryError> {
        self.inner.set_status(id, status).await?;
        self.clear();
        Ok(())
    }

    async fn refresh(&self) {
        self.clear();
        self.inner.refresh().await;
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDirectory;

    #[tokio::test]
    async fn snapshot_is_served_until_refresh() {
        let inner = Arc::new(InMemoryDirectory::new());
        inner.insert_ready("a", "Alpha", "alpha");
        let cached = CachedDirectory::new(inner.clone(), Duration::from_secs(60));

        assert_eq!(cached.list_resolvable().await.unwrap().len(), 1);
        inner.insert_ready("b", "Beta", "beta");
        assert_eq!(cached.list_resolvable().await.unwrap().len(), 1);
        assert_eq!(inner.list_calls(), 1);

        cached.refresh().await;
        assert_eq!(cached.list_resolvable().await.unwrap().len(), 2);
        assert_eq!(inner.list_calls(), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let inner = Arc::new(InMemoryDirectory::new());
        inner.insert_ready("a", "Alpha", "alpha");
        let cached = CachedDirectory::new(inner.clone(), Duration::ZERO);
        cached.list_resolvable().await.unwrap();
        cached.list_resolvable().await.unwrap();
        assert_eq!(inner.list_calls(), 2);
    }
}
