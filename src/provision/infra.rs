//! Seams to the database platform and to the tenant schema.

use crate::error::InfraError;
use crate::tenant::{TenantDatabase, TenantId};
use async_trait::async_trait;

/// Creates tenant databases. Both calls are keyed by organization id so a replayed
/// step finds the database an earlier attempt created.
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    async fn find_database(&self, organization_id: &TenantId) -> Result<Option<TenantDatabase>, InfraError>;

    async fn create_database(&self, organization_id: &TenantId, region: &str) -> Result<TenantDatabase, InfraError>;
}

/// Applies the baseline schema to a fresh tenant database. Must be safe to re-run.
#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    async fn migrate(&self, database: &TenantDatabase) -> Result<(), InfraError>;
}
