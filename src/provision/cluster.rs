//! One PostgreSQL database per tenant on a shared cluster.

use crate::error::{ConfigError, InfraError};
use crate::provision::InfrastructureProvider;
use crate::store::{ensure_database_exists, parse_db_name_from_url, quote_ident};
use crate::tenant::{TenantDatabase, TenantId};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnectOptions;
use sqlx::ConnectOptions;
use std::str::FromStr;

const REGION_PREFIX: &str = "region=";
const OWNER_SEPARATOR: &str = "\norg=";
/// Readable part of a database name; the digest keeps names distinct.
const NAME_PREFIX_LEN: usize = 23;
const DIGEST_HEX_LEN: usize = 32;

/// Owner and region recorded as the comment of a tenant database.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DatabaseComment {
    region: String,
    organization_id: Option<String>,
}

impl DatabaseComment {
    fn new(organization_id: &TenantId, region: &str) -> Self {
        DatabaseComment {
            region: region.to_string(),
            organization_id: Some(organization_id.to_string()),
        }
    }

    fn parse(comment: &str) -> Self {
        let rest = comment.strip_prefix(REGION_PREFIX).unwrap_or_default();
        match rest.split_once(OWNER_SEPARATOR) {
            Some((region, owner)) => DatabaseComment {
                region: region.to_string(),
                organization_id: Some(owner.to_string()),
            },
            None => DatabaseComment {
                region: rest.to_string(),
                organization_id: None,
            },
        }
    }

    fn render(&self) -> String {
        match &self.organization_id {
            Some(owner) => format!("{}{}{}{}", REGION_PREFIX, self.region, OWNER_SEPARATOR, owner),
            None => format!("{}{}", REGION_PREFIX, self.region),
        }
    }
}

/// Creates one `tenant_*` database per organization next to the control-plane database.
/// The database comment records the owning organization and its region.
#[derive(Clone, Debug)]
pub struct PgClusterProvider {
    /// URL up to and including the final `/`.
    base_url: String,
    admin_url: String,
    query: Option<String>,
    allowed_regions: Vec<String>,
}

impl PgClusterProvider {
    pub fn new(cluster_url: &str, allowed_regions: Vec<String>) -> Result<Self, ConfigError> {
        let (admin_url, _) = parse_db_name_from_url(cluster_url).map_err(|e| ConfigError::InvalidValue {
            name: "DATABASE_URL",
            message: e.to_string(),
        })?;
        let path_start = cluster_url.rfind('/').map(|i| i + 1).unwrap_or(cluster_url.len());
        let query = cluster_url
            .get(path_start..)
            .and_then(|path| path.split_once('?'))
            .map(|(_, q)| q.to_string());
        Ok(PgClusterProvider {
            base_url: cluster_url[..path_start].to_string(),
            admin_url,
            query,
            allowed_regions,
        })
    }

    /// `tenant_<readable prefix>_<digest of the exact id>`, within PostgreSQL's 63-byte limit.
    /// Ids that fold to the same prefix still get different names.
    pub fn database_name(organization_id: &TenantId) -> String {
        let id = organization_id.as_str();
        let prefix: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .take(NAME_PREFIX_LEN)
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("tenant_{}_{}", prefix, &digest[..DIGEST_HEX_LEN])
    }

    fn database_url(&self, name: &str) -> String {
        match &self.query {
            Some(q) => format!("{}{}?{}", self.base_url, name, q),
            None => format!("{}{}", self.base_url, name),
        }
    }

    async fn admin_connection(&self) -> Result<sqlx::PgConnection, InfraError> {
        let opts = PgConnectOptions::from_str(&self.admin_url)?;
        Ok(opts.connect().await?)
    }

    /// `None` when the database does not exist; the parsed comment (possibly empty) otherwise.
    async fn comment_of(&self, conn: &mut sqlx::PgConnection, name: &str) -> Result<Option<DatabaseComment>, InfraError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT shobj_description(oid, 'pg_database') FROM pg_database WHERE datname = $1",
        )
        .bind(name)
        .fetch_optional(conn)
        .await?;
        Ok(row.map(|(comment,)| DatabaseComment::parse(comment.as_deref().unwrap_or_default())))
    }
}

/// A database recorded for a different organization is never handed out.
fn check_owner(name: &str, comment: &DatabaseComment, organization_id: &TenantId) -> Result<(), InfraError> {
    match comment.organization_id.as_deref() {
        Some(owner) if owner != organization_id.as_str() => Err(InfraError(format!(
            "database {} belongs to another organization",
            name
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl InfrastructureProvider for PgClusterProvider {
    async fn find_database(&self, organization_id: &TenantId) -> Result<Option<TenantDatabase>, InfraError> {
        let name = Self::database_name(organization_id);
        let mut conn = self.admin_connection().await?;
        let Some(comment) = self.comment_of(&mut conn, &name).await? else {
            return Ok(None);
        };
        check_owner(&name, &comment, organization_id)?;
        if comment.organization_id.is_none() {
            // Created but never labelled; let create_database finish it.
            return Ok(None);
        }
        Ok(Some(TenantDatabase {
            region: comment.region,
            connection_url: self.database_url(&name),
            id: name,
        }))
    }

    async fn create_database(&self, organization_id: &TenantId, region: &str) -> Result<TenantDatabase, InfraError> {
        if !self.allowed_regions.is_empty() && !self.allowed_regions.iter().any(|r| r == region) {
            return Err(InfraError(format!("region '{}' is not available on this cluster", region)));
        }
        let name = Self::database_name(organization_id);
        let url = self.database_url(&name);
        ensure_database_exists(&url).await?;

        let mut conn = self.admin_connection().await?;
        if let Some(existing) = self.comment_of(&mut conn, &name).await? {
            check_owner(&name, &existing, organization_id)?;
        }
        let comment = DatabaseComment::new(organization_id, region).render().replace('\'', "''");
        sqlx::query(&format!("COMMENT ON DATABASE {} IS '{}'", quote_ident(&name), comment))
            .execute(&mut conn)
            .await?;
        tracing::info!(organization_id = %organization_id, database = %name, region, "tenant database created");
        Ok(TenantDatabase {
            id: name,
            region: region.to_string(),
            connection_url: url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names_are_plain_identifiers() {
        let name = PgClusterProvider::database_name(&"Org-42".into());
        assert!(name.starts_with("tenant_org_42_"));
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        let long = "x".repeat(100);
        assert!(PgClusterProvider::database_name(&long.as_str().into()).len() <= 63);
    }

    #[test]
    fn ids_that_fold_alike_get_distinct_databases() {
        let names: Vec<String> = ["Org-42", "org_42", "org.42", "org-42"]
            .iter()
            .map(|id| PgClusterProvider::database_name(&(*id).into()))
            .collect();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let shared = "s".repeat(60);
        let a = PgClusterProvider::database_name(&format!("{}a", shared).as_str().into());
        let b = PgClusterProvider::database_name(&format!("{}b", shared).as_str().into());
        assert_ne!(a, b);
        assert_eq!(PgClusterProvider::database_name(&"Org-42".into()), PgClusterProvider::database_name(&"Org-42".into()));
    }

    #[test]
    fn comment_records_owner_and_region() {
        let comment = DatabaseComment::new(&"Shop-1".into(), "eu-west");
        assert_eq!(DatabaseComment::parse(&comment.render()), comment);

        let legacy = DatabaseComment::parse("region=local");
        assert_eq!(legacy.region, "local");
        assert_eq!(legacy.organization_id, None);
        assert_eq!(DatabaseComment::parse("").region, "");
    }

    #[test]
    fn database_of_another_organization_is_refused() {
        let comment = DatabaseComment::new(&"Shop-1".into(), "local");
        assert!(check_owner("tenant_x", &comment, &"Shop-1".into()).is_ok());
        let err = check_owner("tenant_x", &comment, &"shop_1".into()).unwrap_err();
        assert!(err.0.contains("another organization"));
        assert!(check_owner("tenant_x", &DatabaseComment::parse("region=local"), &"shop_1".into()).is_ok());
    }

    #[test]
    fn tenant_urls_keep_cluster_and_query() {
        let p = PgClusterProvider::new("postgres://u:p@db:5432/storefront?sslmode=disable", vec![]).unwrap();
        assert_eq!(p.database_url("tenant_a"), "postgres://u:p@db:5432/tenant_a?sslmode=disable");
        assert_eq!(p.admin_url, "postgres://u:p@db:5432/postgres");

        let p = PgClusterProvider::new("postgres://db/storefront", vec![]).unwrap();
        assert_eq!(p.database_url("tenant_a"), "postgres://db/tenant_a");
    }

    #[tokio::test]
    async fn unknown_region_is_rejected_before_connecting() {
        let p = PgClusterProvider::new("postgres://db/storefront", vec!["local".into()]).unwrap();
        let err = p.create_database(&"org".into(), "mars").await.unwrap_err();
        assert!(err.0.contains("mars"));
    }
}
