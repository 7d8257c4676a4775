//! Resolution strategies. Each variant is one step of the fallback chain and reports hit or miss.

use crate::directory::OrganizationDirectory;
use crate::error::DirectoryError;
use crate::resolver::hostname::normalize_label;
use crate::tenant::Organization;
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Whole host equals an organization's custom domain.
    CustomDomain,
    /// Subdomain candidate equals a stored subdomain.
    ExactSubdomain,
    /// Candidate equals a stored subdomain or slug after `normalize_label`.
    NormalizedSubdomain,
    /// Explicit route slug equals a stored slug.
    RouteSlug,
    /// Configured default tenant slug.
    DefaultTenant,
}

/// Chain used when none is configured. Exact subdomain always precedes normalized.
pub const DEFAULT_CHAIN: [ResolutionStrategy; 5] = [
    ResolutionStrategy::CustomDomain,
    ResolutionStrategy::ExactSubdomain,
    ResolutionStrategy::NormalizedSubdomain,
    ResolutionStrategy::RouteSlug,
    ResolutionStrategy::DefaultTenant,
];

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::CustomDomain => "custom_domain",
            ResolutionStrategy::ExactSubdomain => "exact_subdomain",
            ResolutionStrategy::NormalizedSubdomain => "normalized_subdomain",
            ResolutionStrategy::RouteSlug => "route_slug",
            ResolutionStrategy::DefaultTenant => "default_tenant",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs shared by every strategy in one resolution.
#[derive(Clone, Copy, Debug)]
pub struct ResolutionInput<'a> {
    pub host: &'a str,
    pub candidate: Option<&'a str>,
    pub route_slug: Option<&'a str>,
    pub default_tenant: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyOutcome {
    Hit(Organization),
    Miss,
    /// The strategy had no input to work with.
    Skipped,
}

fn resolvable(org: Option<Organization>) -> StrategyOutcome {
    match org {
        Some(org) if org.is_resolvable() => StrategyOutcome::Hit(org),
        _ => StrategyOutcome::Miss,
    }
}

impl ResolutionStrategy {
    pub async fn attempt(
        &self,
        input: &ResolutionInput<'_>,
        directory: &dyn OrganizationDirectory,
    ) -> Result<StrategyOutcome, DirectoryError> {
        match self {
            ResolutionStrategy::CustomDomain => {
                if input.host.is_empty() {
                    return Ok(StrategyOutcome::Skipped);
                }
                Ok(resolvable(directory.find_by_custom_domain(input.host).await?))
            }
            ResolutionStrategy::ExactSubdomain => match input.candidate {
                None => Ok(StrategyOutcome::Skipped),
                Some(candidate) => Ok(resolvable(directory.find_by_subdomain(candidate).await?)),
            },
            ResolutionStrategy::NormalizedSubdomain => {
                let Some(candidate) = input.candidate else {
                    return Ok(StrategyOutcome::Skipped);
                };
                let wanted = normalize_label(candidate);
                if wanted.is_empty() {
                    return Ok(StrategyOutcome::Miss);
                }
                let mut matches = directory
                    .list_resolvable()
                    .await?
                    .into_iter()
                    .filter(|org| org.is_resolvable())
                    .filter(|org| normalize_label(&org.subdomain) == wanted || normalize_label(&org.slug) == wanted);
                let first = matches.next();
                if let Some(ref org) = first {
                    let others = matches.count();
                    if others > 0 {
                        tracing::warn!(
                            candidate = %candidate,
                            chosen = %org.id,
                            others,
                            "normalized subdomain is ambiguous, using oldest organization"
                        );
                    }
                }
                Ok(first.map(StrategyOutcome::Hit).unwrap_or(StrategyOutcome::Miss))
            }
            ResolutionStrategy::RouteSlug => match input.route_slug {
                None => Ok(StrategyOutcome::Skipped),
                Some(slug) => Ok(resolvable(directory.find_by_slug(slug).await?)),
            },
            ResolutionStrategy::DefaultTenant => match input.default_tenant {
                None => Ok(StrategyOutcome::Skipped),
                Some(slug) => Ok(resolvable(directory.find_by_slug(slug).await?)),
            },
        }
    }
}
