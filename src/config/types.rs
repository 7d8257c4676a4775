//! Runtime settings for resolution, connection caching and provisioning.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct TenancyConfig {
    /// Control-plane database holding the organization directory and provisioning jobs.
    pub database_url: String,
    /// Schema for the `_sys_*` tables. Must be a plain PostgreSQL identifier.
    pub schema: String,
    pub bind_addr: String,
    pub resolver: ResolverSettings,
    pub connections: ConnectionSettings,
    pub provisioning: ProvisioningSettings,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        TenancyConfig {
            database_url: "postgres://localhost/storefront".into(),
            schema: "tenancy".into(),
            bind_addr: "127.0.0.1:3000".into(),
            resolver: ResolverSettings::default(),
            connections: ConnectionSettings::default(),
            provisioning: ProvisioningSettings::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolverSettings {
    /// Slug of the fallback tenant. Unset means unmatched hosts are `NotFound`.
    pub default_tenant: Option<String>,
    pub loopback_hosts: Vec<String>,
    /// Regexes matched against the first host label.
    pub preview_patterns: Vec<String>,
    pub detect_deployment_hash: bool,
    pub directory_cache_ttl: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            default_tenant: None,
            loopback_hosts: vec!["localhost".into()],
            preview_patterns: vec!["^[a-z0-9-]+-git-[a-z0-9-]+$".into()],
            detect_deployment_hash: true,
            directory_cache_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Pool size per tenant database.
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisioningSettings {
    /// Upper bound for each provisioning step before it is reported as failed.
    pub step_timeout: Duration,
    pub default_region: String,
    pub allowed_regions: Vec<String>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        ProvisioningSettings {
            step_timeout: Duration::from_secs(120),
            default_region: "local".into(),
            allowed_regions: vec!["local".into()],
        }
    }
}
