//! Tenancy server: store resolution and tenant provisioning over HTTP, backed by PostgreSQL.
//!
//! Run from repo root: `cargo run -p tenancy-server`

use std::sync::Arc;
use storefront_tenancy::{
    app, ensure_database_exists, ensure_sys_tables, AppState, CachedDirectory, OrganizationDirectory,
    PgClusterProvider, PgConnectionFactory, PgJobStore, PgOrganizationDirectory, PgSchemaMigrator, Provisioner,
    ProvisionerOptions, ResolverOptions, RetryPolicy, TenancyConfig, TenantConnectionCache, TenantResolver,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("storefront_tenancy=info,tenancy_server=info")),
        )
        .init();

    let config = TenancyConfig::from_env()?;
    ensure_database_exists(&config.database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    ensure_sys_tables(&pool, &config.schema).await?;

    let store: Arc<dyn OrganizationDirectory> = Arc::new(PgOrganizationDirectory::new(pool.clone(), &config.schema));
    let directory: Arc<dyn OrganizationDirectory> =
        Arc::new(CachedDirectory::new(store, config.resolver.directory_cache_ttl));

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&directory),
        Arc::new(PgJobStore::new(pool.clone(), &config.schema)),
        Arc::new(PgClusterProvider::new(
            &config.database_url,
            config.provisioning.allowed_regions.clone(),
        )?),
        Arc::new(PgSchemaMigrator::default()),
        ProvisionerOptions::from_settings(&config.provisioning),
    ));

    let factory = PgConnectionFactory::new(Arc::clone(&directory), config.connections.clone())
        .with_provisioner(Arc::clone(&provisioner));
    let connections = TenantConnectionCache::new(factory, RetryPolicy::from_settings(&config.connections));
    let resolver = Arc::new(TenantResolver::new(
        Arc::clone(&directory),
        ResolverOptions::from_settings(&config.resolver)?,
    ));

    let state = AppState {
        directory,
        resolver,
        connections: connections.clone(),
        provisioner,
        default_region: config.provisioning.default_region.clone(),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("tenancy server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    connections.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
