//! Tenant identity resolution: host (and optional route slug) to organization, via an ordered strategy chain.

pub mod hostname;
pub mod strategy;

pub use hostname::{normalize_host, normalize_label, subdomain_candidate, HostRules, NoCandidate, PreviewPattern};
pub use strategy::{ResolutionInput, ResolutionStrategy, StrategyOutcome, DEFAULT_CHAIN};

use crate::config::ResolverSettings;
use crate::directory::OrganizationDirectory;
use crate::error::{ConfigError, ResolveError};
use crate::tenant::{Organization, TenantIdentity};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ResolverOptions {
    pub host_rules: HostRules,
    /// Slug of the tenant used when nothing else matches.
    pub default_tenant: Option<String>,
    pub chain: Vec<ResolutionStrategy>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            host_rules: HostRules::default(),
            default_tenant: None,
            chain: DEFAULT_CHAIN.to_vec(),
        }
    }
}

impl ResolverOptions {
    pub fn from_settings(settings: &ResolverSettings) -> Result<Self, ConfigError> {
        let mut preview_patterns = Vec::new();
        if settings.detect_deployment_hash {
            preview_patterns.push(PreviewPattern::DeploymentHash);
        }
        for pattern in &settings.preview_patterns {
            let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            preview_patterns.push(PreviewPattern::Regex(re));
        }
        Ok(ResolverOptions {
            host_rules: HostRules {
                loopback_hosts: settings.loopback_hosts.clone(),
                preview_patterns,
            },
            default_tenant: settings.default_tenant.clone(),
            chain: DEFAULT_CHAIN.to_vec(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Hit,
    Miss,
    Skipped,
}

/// One entry of the resolution trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: ResolutionStrategy,
    pub outcome: AttemptOutcome,
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub identity: TenantIdentity,
    pub organization: Organization,
    pub matched_by: ResolutionStrategy,
    /// Normalised host the chain ran against.
    pub host: String,
    pub candidate: Option<String>,
    pub trace: Vec<StrategyAttempt>,
}

pub struct TenantResolver {
    directory: Arc<dyn OrganizationDirectory>,
    options: ResolverOptions,
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, options: ResolverOptions) -> Self {
        TenantResolver { directory, options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Runs the chain; first hit wins. Directory errors abort with `LookupFailed`
    /// instead of falling through to the default tenant.
    pub async fn resolve(&self, hostname: &str, route_slug: Option<&str>) -> Result<Resolution, ResolveError> {
        let host = normalize_host(hostname);
        let route_slug = route_slug.map(str::trim).filter(|s| !s.is_empty());
        let candidate = match subdomain_candidate(&host, &self.options.host_rules) {
            Ok(c) => Some(c),
            Err(reason) => {
                tracing::debug!(host = %host, reason = ?reason, "no subdomain candidate");
                None
            }
        };
        let input = ResolutionInput {
            host: &host,
            candidate: candidate.as_deref(),
            route_slug,
            default_tenant: self.options.default_tenant.as_deref(),
        };

        let mut trace = Vec::with_capacity(self.options.chain.len());
        for strategy in &self.options.chain {
            let outcome = strategy
                .attempt(&input, self.directory.as_ref())
                .await
                .map_err(|e| {
                    tracing::warn!(host = %host, strategy = %strategy, error = %e, "tenant lookup failed");
                    ResolveError::LookupFailed(e.to_string())
                })?;
            match outcome {
                StrategyOutcome::Hit(org) => {
                    trace.push(StrategyAttempt {
                        strategy: *strategy,
                        outcome: AttemptOutcome::Hit,
                    });
                    tracing::info!(
                        host = %host,
                        strategy = %strategy,
                        organization_id = %org.id,
                        "tenant resolved"
                    );
                    return Ok(Resolution {
                        identity: org.identity(),
                        organization: org,
                        matched_by: *strategy,
                        host,
                        candidate,
                        trace,
                    });
                }
                StrategyOutcome::Miss => {
                    tracing::debug!(host = %host, strategy = %strategy, "miss");
                    trace.push(StrategyAttempt {
                        strategy: *strategy,
                        outcome: AttemptOutcome::Miss,
                    });
                }
                StrategyOutcome::Skipped => trace.push(StrategyAttempt {
                    strategy: *strategy,
                    outcome: AttemptOutcome::Skipped,
                }),
            }
        }

        tracing::info!(host = %host, route_slug = ?route_slug, "no tenant for host");
        Err(ResolveError::NotFound {
            hostname: host,
            route_slug: route_slug.map(String::from),
        })
    }
}
