//! PostgreSQL tenant connections: one `PgPool` per tenant database.

use crate::config::ConnectionSettings;
use crate::connection::{ConnectionFactory, TenantDatabaseGate};
use crate::directory::OrganizationDirectory;
use crate::error::ConnectionError;
use crate::provision::Provisioner;
use crate::tenant::TenantId;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

pub struct PgConnectionFactory {
    gate: TenantDatabaseGate,
    settings: ConnectionSettings,
}

impl PgConnectionFactory {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, settings: ConnectionSettings) -> Self {
        PgConnectionFactory {
            gate: TenantDatabaseGate::new(directory),
            settings,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<Provisioner>) -> Self {
        self.gate = self.gate.with_provisioner(provisioner);
        self
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Handle = PgPool;

    async fn connect(&self, tenant_id: &TenantId) -> Result<PgPool, ConnectionError> {
        let database = self.gate.ready_database(tenant_id).await?;
        PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.acquire_timeout)
            .connect(&database.connection_url)
            .await
            .map_err(|e| ConnectionError::AcquisitionFailed {
                tenant_id: tenant_id.to_string(),
                message: e.to_string(),
            })
    }

    async fn release(&self, tenant_id: &TenantId, pool: &PgPool) {
        tracing::debug!(tenant_id = %tenant_id, "closing tenant pool");
        pool.close().await;
    }

    async fn probe(&self, tenant_id: &TenantId, pool: &PgPool) -> Result<(), ConnectionError> {
        sqlx::query("SELECT 1")
            .fetch_optional(pool)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::AcquisitionFailed {
                tenant_id: tenant_id.to_string(),
                message: e.to_string(),
            })
    }
}
