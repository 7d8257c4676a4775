//! Load settings from environment variables (call `dotenvy::dotenv()` first to honour a `.env` file).

use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

impl TenancyConfig {
    /// Read every setting from the process environment, falling back to defaults, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = TenancyConfig::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let resolver = ResolverSettings {
            default_tenant: get("DEFAULT_TENANT"),
            loopback_hosts: get("LOOPBACK_HOSTS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.resolver.loopback_hosts),
            preview_patterns: get("PREVIEW_HOST_PATTERNS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.resolver.preview_patterns),
            detect_deployment_hash: parse_or(
                "PREVIEW_DETECT_DEPLOYMENT_HASH",
                get("PREVIEW_DETECT_DEPLOYMENT_HASH"),
                defaults.resolver.detect_deployment_hash,
            )?,
            directory_cache_ttl: secs_or(
                "DIRECTORY_CACHE_TTL_SECS",
                get("DIRECTORY_CACHE_TTL_SECS"),
                defaults.resolver.directory_cache_ttl,
            )?,
        };

        let connections = ConnectionSettings {
            max_connections: parse_or(
                "TENANT_MAX_CONNECTIONS",
                get("TENANT_MAX_CONNECTIONS"),
                defaults.connections.max_connections,
            )?,
            acquire_timeout: secs_or(
                "TENANT_ACQUIRE_TIMEOUT_SECS",
                get("TENANT_ACQUIRE_TIMEOUT_SECS"),
                defaults.connections.acquire_timeout,
            )?,
            max_attempts: parse_or(
                "CONNECTION_MAX_ATTEMPTS",
                get("CONNECTION_MAX_ATTEMPTS"),
                defaults.connections.max_attempts,
            )?,
            initial_backoff: millis_or(
                "CONNECTION_INITIAL_BACKOFF_MS",
                get("CONNECTION_INITIAL_BACKOFF_MS"),
                defaults.connections.initial_backoff,
            )?,
            max_backoff: millis_or(
                "CONNECTION_MAX_BACKOFF_MS",
                get("CONNECTION_MAX_BACKOFF_MS"),
                defaults.connections.max_backoff,
            )?,
        };

        let provisioning = ProvisioningSettings {
            step_timeout: secs_or(
                "PROVISION_STEP_TIMEOUT_SECS",
                get("PROVISION_STEP_TIMEOUT_SECS"),
                defaults.provisioning.step_timeout,
            )?,
            default_region: get("PROVISION_DEFAULT_REGION").unwrap_or(defaults.provisioning.default_region),
            allowed_regions: get("PROVISION_ALLOWED_REGIONS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.provisioning.allowed_regions),
        };

        let config = TenancyConfig {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            schema: get("TENANCY_SCHEMA").unwrap_or(defaults.schema),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            resolver,
            connections,
            provisioning,
        };
        validate(&config)?;
        Ok(config)
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            message: format!("'{}': {}", v, e),
        }),
    }
}

fn secs_or(name: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    Ok(match value {
        None => default,
        Some(_) => Duration::from_secs(parse_or::<u64>(name, value, 0)?),
    })
}

fn millis_or(name: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    Ok(match value {
        None => default,
        Some(_) => Duration::from_millis(parse_or::<u64>(name, value, 0)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<TenancyConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        TenancyConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.schema, "tenancy");
        assert_eq!(config.resolver.loopback_hosts, vec!["localhost"]);
        assert!(config.resolver.default_tenant.is_none());
        assert_eq!(config.connections.max_attempts, 3);
        assert_eq!(config.provisioning.step_timeout, Duration::from_secs(120));
    }

    #[test]
    fn lists_and_durations_are_parsed() {
        let config = load(&[
            ("DEFAULT_TENANT", "aurelio"),
            ("LOOPBACK_HOSTS", "localhost, dev.local"),
            ("PROVISION_ALLOWED_REGIONS", "eu-west,us-east"),
            ("PROVISION_DEFAULT_REGION", "eu-west"),
            ("PROVISION_STEP_TIMEOUT_SECS", "5"),
            ("CONNECTION_INITIAL_BACKOFF_MS", "10"),
        ])
        .unwrap();
        assert_eq!(config.resolver.default_tenant.as_deref(), Some("aurelio"));
        assert_eq!(config.resolver.loopback_hosts, vec!["localhost", "dev.local"]);
        assert_eq!(config.provisioning.allowed_regions, vec!["eu-west", "us-east"]);
        assert_eq!(config.provisioning.step_timeout, Duration::from_secs(5));
        assert_eq!(config.connections.initial_backoff, Duration::from_millis(10));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = load(&[("TENANT_MAX_CONNECTIONS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "TENANT_MAX_CONNECTIONS", .. }));
    }
}
