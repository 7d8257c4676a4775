//! Tenant (organization) model shared by the resolver, the connection cache and the provisioner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Organization id. Chosen by the initiating request so provisioning replays stay idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of an organization record with respect to its tenant database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    /// Record exists, tenant database not yet ready.
    Provisioning,
    /// Tenant database provisioned and migrated.
    Ready,
    /// A provisioning attempt failed; hidden until a retry succeeds.
    Unprovisioned,
    /// Deactivated by an admin. Organizations are never hard-deleted.
    Deactivated,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationStatus::Provisioning => "provisioning",
            OrganizationStatus::Ready => "ready",
            OrganizationStatus::Unprovisioned => "unprovisioned",
            OrganizationStatus::Deactivated => "deactivated",
        }
    }
}

impl std::str::FromStr for OrganizationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(OrganizationStatus::Provisioning),
            "ready" => Ok(OrganizationStatus::Ready),
            "unprovisioned" => Ok(OrganizationStatus::Unprovisioned),
            "deactivated" => Ok(OrganizationStatus::Deactivated),
            _ => Err(format!("invalid organization status: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(format!("invalid subscription status: {}", s)),
        }
    }
}

/// Descriptor of an isolated tenant database, as returned by the infrastructure provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDatabase {
    pub id: String,
    pub region: String,
    /// Connection string; never serialized to API clients.
    #[serde(skip_serializing, default)]
    pub connection_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub subdomain: String,
    pub description: Option<String>,
    pub custom_domain: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: Option<String>,
    pub status: OrganizationStatus,
    pub tenant_database: Option<TenantDatabase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// Only ready organizations with a tenant database may be resolved.
    pub fn is_resolvable(&self) -> bool {
        self.status == OrganizationStatus::Ready && self.tenant_database.is_some()
    }

    pub fn identity(&self) -> TenantIdentity {
        TenantIdentity {
            organization_id: self.id.clone(),
            name: self.name.clone(),
            slug: self.slug.clone(),
            subdomain: self.subdomain.clone(),
        }
    }
}

/// Input for creating an organization record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrganization {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub subdomain: String,
    pub description: Option<String>,
}

/// Resolved identity handed to downstream features.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantIdentity {
    pub organization_id: TenantId,
    pub name: String,
    pub slug: String,
    pub subdomain: String,
}

/// Lowercase, ASCII alphanumerics separated by single hyphens. "My Shop!" -> "my-shop".
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("My Shop"), "my-shop");
        assert_eq!(slugify("  Aurelio   Living!! "), "aurelio-living");
        assert_eq!(slugify("under_score--name"), "under-score-name");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OrganizationStatus::Provisioning,
            OrganizationStatus::Ready,
            OrganizationStatus::Unprovisioned,
            OrganizationStatus::Deactivated,
        ] {
            assert_eq!(status.as_str().parse::<OrganizationStatus>().unwrap(), status);
        }
        assert!("archived".parse::<OrganizationStatus>().is_err());
    }
}
