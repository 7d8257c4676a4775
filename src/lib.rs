//! Storefront tenancy: resolve the store behind a request, hold one live connection per
//! tenant database, and provision new tenant databases.

pub mod config;
pub mod connection;
pub mod context;
pub mod directory;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod memory;
pub mod migration;
pub mod provision;
pub mod resolver;
pub mod response;
pub mod routes;
pub mod state;
pub mod store;
pub mod tenant;

pub use config::{validate, TenancyConfig};
pub use connection::{
    ConnectionFactory, PgConnectionFactory, RetryPolicy, TenantConnection, TenantConnectionCache, TenantDatabaseGate,
};
pub use context::{RequestTarget, TenantContext, TenantSnapshot};
pub use directory::{CachedDirectory, OrganizationDirectory};
pub use error::{AppError, ConfigError, ConnectionError, DirectoryError, ProvisionError, ResolveError, TenantError};
pub use migration::{BaselineSchema, PgSchemaMigrator};
pub use provision::{
    PgClusterProvider, ProvisionOutcome, ProvisionReceipt, ProvisionRequest, Provisioner, ProvisionerOptions,
    ProvisioningJob, ProvisioningState,
};
pub use resolver::{Resolution, ResolverOptions, TenantResolver};
pub use routes::{app, common_routes_with_ready};
pub use state::AppState;
pub use store::{ensure_database_exists, ensure_sys_tables, PgJobStore, PgOrganizationDirectory};
pub use tenant::{Organization, OrganizationStatus, TenantId, TenantIdentity};
