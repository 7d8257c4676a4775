//! Settings validation.

use crate::config::TenancyConfig;
use crate::error::ConfigError;
use regex::Regex;

/// Plain lowercase PostgreSQL identifier (used unquoted in DDL).
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn validate(config: &TenancyConfig) -> Result<(), ConfigError> {
    if !is_valid_identifier(&config.schema) {
        return Err(ConfigError::InvalidValue {
            name: "TENANCY_SCHEMA",
            message: format!("'{}' is not a valid schema identifier", config.schema),
        });
    }

    for pattern in &config.resolver.preview_patterns {
        Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
    }

    let c = &config.connections;
    if c.max_connections == 0 {
        return Err(ConfigError::Validation("TENANT_MAX_CONNECTIONS must be at least 1".into()));
    }
    if c.max_attempts == 0 {
        return Err(ConfigError::Validation("CONNECTION_MAX_ATTEMPTS must be at least 1".into()));
    }
    if c.initial_backoff > c.max_backoff {
        return Err(ConfigError::Validation(
            "CONNECTION_INITIAL_BACKOFF_MS must not exceed CONNECTION_MAX_BACKOFF_MS".into(),
        ));
    }

    let p = &config.provisioning;
    if p.step_timeout.is_zero() {
        return Err(ConfigError::Validation("PROVISION_STEP_TIMEOUT_SECS must be positive".into()));
    }
    if !p.allowed_regions.iter().any(|r| r == &p.default_region) {
        return Err(ConfigError::Validation(format!(
            "default region '{}' is not in PROVISION_ALLOWED_REGIONS",
            p.default_region
        )));
    }
    Ok(())
}
