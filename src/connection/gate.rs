//! Looks up the tenant database behind a connection request, provisioning it on first use.

use crate::directory::OrganizationDirectory;
use crate::error::ConnectionError;
use crate::provision::Provisioner;
use crate::tenant::{Organization, OrganizationStatus, TenantDatabase, TenantId};
use std::sync::Arc;

/// Shared by every [`ConnectionFactory`](crate::connection::ConnectionFactory) that needs a
/// ready tenant database before it can connect.
#[derive(Clone)]
pub struct TenantDatabaseGate {
    directory: Arc<dyn OrganizationDirectory>,
    /// When set, a tenant whose database is not ready has its provisioning job resumed first.
    provisioner: Option<Arc<Provisioner>>,
}

impl TenantDatabaseGate {
    pub fn new(directory: Arc<dyn OrganizationDirectory>) -> Self {
        TenantDatabaseGate {
            directory,
            provisioner: None,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    async fn organization(&self, tenant_id: &TenantId) -> Result<Organization, ConnectionError> {
        self.directory
            .find_by_id(tenant_id)
            .await
            .map_err(|e| ConnectionError::AcquisitionFailed {
                tenant_id: tenant_id.to_string(),
                message: e.to_string(),
            })?
            .ok_or_else(|| ConnectionError::TenantUnavailable {
                tenant_id: tenant_id.to_string(),
                reason: "unknown organization".into(),
            })
    }

    /// The tenant's database once the organization is ready. A deactivated organization
    /// is refused; any other non-ready one is provisioned first when a provisioner is set.
    pub async fn ready_database(&self, tenant_id: &TenantId) -> Result<TenantDatabase, ConnectionError> {
        let org = self.organization(tenant_id).await?;
        match (org.status, org.tenant_database) {
            (OrganizationStatus::Ready, Some(db)) => return Ok(db),
            (OrganizationStatus::Deactivated, _) => {
                return Err(ConnectionError::TenantUnavailable {
                    tenant_id: tenant_id.to_string(),
                    reason: "organization is deactivated".into(),
                })
            }
            _ => {}
        }
        let Some(provisioner) = &self.provisioner else {
            return Err(ConnectionError::TenantUnavailable {
                tenant_id: tenant_id.to_string(),
                reason: "tenant database is not provisioned".into(),
            });
        };
        tracing::info!(tenant_id = %tenant_id, "tenant database not ready, resuming provisioning");
        provisioner
            .resume(tenant_id)
            .await
            .map_err(|e| ConnectionError::TenantUnavailable {
                tenant_id: tenant_id.to_string(),
                reason: e.to_string(),
            })?;
        self.organization(tenant_id)
            .await?
            .tenant_database
            .ok_or_else(|| ConnectionError::TenantUnavailable {
                tenant_id: tenant_id.to_string(),
                reason: "provisioning completed without a tenant database".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDirectory;
    use crate::tenant::NewOrganization;

    #[tokio::test]
    async fn ready_tenant_passes_straight_through() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert_ready("A", "Aurelio Living", "aurelioliving");
        let gate = TenantDatabaseGate::new(directory);
        let db = gate.ready_database(&"A".into()).await.unwrap();
        assert_eq!(db.id, "db-A");
    }

    #[tokio::test]
    async fn unready_tenant_without_provisioner_is_unavailable() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .create_organization(NewOrganization {
                id: "B".into(),
                name: "Bolt".into(),
                slug: "bolt".into(),
                subdomain: "bolt".into(),
                description: None,
            })
            .await
            .unwrap();
        directory.insert_ready("C", "Cedar", "cedar");
        directory.update("C", |o| o.status = OrganizationStatus::Deactivated);
        let gate = TenantDatabaseGate::new(directory);

        for id in ["B", "C", "missing"] {
            let err = gate.ready_database(&id.into()).await.unwrap_err();
            assert!(matches!(err, ConnectionError::TenantUnavailable { .. }), "{id}: {err:?}");
        }
    }

    #[tokio::test]
    async fn directory_outage_is_retryable() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.set_unavailable(true);
        let gate = TenantDatabaseGate::new(directory);
        let err = gate.ready_database(&"A".into()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
