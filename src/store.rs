//! _sys_* table DDL and PostgreSQL-backed directory and job persistence. All _sys_* tables
//! live in the schema named by `TENANCY_SCHEMA` (default `tenancy`).

use crate::directory::OrganizationDirectory;
use crate::error::{DirectoryError, ProvisionError};
use crate::provision::{JobStore, ProvisioningJob};
use crate::tenant::{
    NewOrganization, Organization, OrganizationStatus, SubscriptionStatus, TenantDatabase, TenantId,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{ConnectOptions, PgPool, Row};
use std::str::FromStr;

pub const ORGANIZATIONS_TABLE: &str = "_sys_organizations";
pub const JOBS_TABLE: &str = "_sys_provisioning_jobs";

/// Schema-qualified table name (e.g. "tenancy._sys_organizations").
pub fn qualified_sys_table(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// Create `schema` if not exists, then the _sys_* tables. `schema` must already be validated.
pub async fn ensure_sys_tables(pool: &PgPool, schema: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    let q_orgs = qualified_sys_table(schema, ORGANIZATIONS_TABLE);
    let orgs_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            subdomain TEXT NOT NULL UNIQUE,
            description TEXT,
            custom_domain TEXT UNIQUE,
            subscription_status TEXT NOT NULL DEFAULT 'trialing',
            subscription_plan TEXT,
            status TEXT NOT NULL DEFAULT 'provisioning',
            database_id TEXT,
            database_region TEXT,
            database_url TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        q_orgs
    );
    sqlx::query(&orgs_ddl).execute(pool).await?;
    let status_index = format!(
        "CREATE INDEX IF NOT EXISTS _sys_organizations_status_idx ON {} (status)",
        q_orgs
    );
    sqlx::query(&status_index).execute(pool).await?;

    let q_jobs = qualified_sys_table(schema, JOBS_TABLE);
    let jobs_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            organization_id TEXT PRIMARY KEY,
            job_id UUID NOT NULL,
            state TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            payload JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        q_jobs
    );
    sqlx::query(&jobs_ddl).execute(pool).await?;

    Ok(())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), sqlx::Error> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

/// Split a connection URL into (URL of the `postgres` maintenance database, database name).
pub(crate) fn parse_db_name_from_url(url: &str) -> Result<(String, String), sqlx::Error> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| sqlx::Error::Configuration("database url: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const ORG_COLUMNS: &str = "id, name, slug, subdomain, description, custom_domain, subscription_status, \
    subscription_plan, status, database_id, database_region, database_url, created_at, updated_at";

fn organization_from_row(row: &PgRow) -> Result<Organization, DirectoryError> {
    let status: String = row.try_get("status")?;
    let subscription_status: String = row.try_get("subscription_status")?;
    let database_id: Option<String> = row.try_get("database_id")?;
    let tenant_database = match database_id {
        Some(id) => Some(TenantDatabase {
            id,
            region: row.try_get::<Option<String>, _>("database_region")?.unwrap_or_default(),
            connection_url: row.try_get::<Option<String>, _>("database_url")?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Organization {
        id: TenantId::new(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        subdomain: row.try_get("subdomain")?,
        description: row.try_get("description")?,
        custom_domain: row.try_get("custom_domain")?,
        subscription_status: SubscriptionStatus::from_str(&subscription_status).map_err(DirectoryError::Unavailable)?,
        subscription_plan: row.try_get("subscription_plan")?,
        status: OrganizationStatus::from_str(&status).map_err(DirectoryError::Unavailable)?,
        tenant_database,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Organization directory backed by `<schema>._sys_organizations`.
#[derive(Clone)]
pub struct PgOrganizationDirectory {
    pool: PgPool,
    table: String,
}

impl PgOrganizationDirectory {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        PgOrganizationDirectory {
            pool,
            table: qualified_sys_table(schema, ORGANIZATIONS_TABLE),
        }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<Organization>, DirectoryError> {
        let sql = format!("SELECT {} FROM {} WHERE {} = $1", ORG_COLUMNS, self.table, column);
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await?;
        row.as_ref().map(organization_from_row).transpose()
    }
}

#[async_trait]
impl OrganizationDirectory for PgOrganizationDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Organization>, DirectoryError> {
        self.find_one("id", id.as_str()).await
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Organization>, DirectoryError> {
        self.find_one("subdomain", subdomain).await
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Organization>, DirectoryError> {
        self.find_one("slug", slug).await
    }

    async fn find_by_custom_domain(&self, domain: &str) -> Result<Option<Organization>, DirectoryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE lower(custom_domain) = lower($1)",
            ORG_COLUMNS, self.table
        );
        let row = sqlx::query(&sql).bind(domain).fetch_optional(&self.pool).await?;
        row.as_ref().map(organization_from_row).transpose()
    }

    async fn list_resolvable(&self) -> Result<Vec<Organization>, DirectoryError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = $1 AND database_id IS NOT NULL ORDER BY created_at, id",
            ORG_COLUMNS, self.table
        );
        let rows = sqlx::query(&sql)
            .bind(OrganizationStatus::Ready.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(organization_from_row).collect()
    }

    async fn create_organization(&self, new: NewOrganization) -> Result<Organization, DirectoryError> {
        let sql = format!(
            "INSERT INTO {} (id, name, slug, subdomain, description, status) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING",
            self.table
        );
        let inserted = sqlx::query(&sql)
            .bind(new.id.as_str())
            .bind(&new.name)
            .bind(&new.slug)
            .bind(&new.subdomain)
            .bind(&new.description)
            .bind(OrganizationStatus::Provisioning.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => DirectoryError::Conflict(format!(
                    "slug or subdomain '{}' is already taken",
                    new.slug
                )),
                other => DirectoryError::from(other),
            })?;
        if inserted.rows_affected() == 0 {
            tracing::debug!(organization_id = %new.id, "organization already exists");
        }
        self.find_by_id(&new.id)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(new.id.to_string()))
    }

    async fn attach_database(&self, id: &TenantId, database: &TenantDatabase) -> Result<(), DirectoryError> {
        let sql = format!(
            "UPDATE {} SET database_id = $2, database_region = $3, database_url = $4, updated_at = NOW() WHERE id = $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(&database.id)
            .bind(&database.region)
            .bind(&database.connection_url)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_status(&self, id: &TenantId, status: OrganizationStatus) -> Result<(), DirectoryError> {
        let sql = format!("UPDATE {} SET status = $2, updated_at = NOW() WHERE id = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        sqlx::query("SELECT 1").fetch_optional(&self.pool).await?;
        Ok(())
    }
}

/// Provisioning jobs in `<schema>._sys_provisioning_jobs`, one row per organization.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    table: String,
}

impl PgJobStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        PgJobStore {
            pool,
            table: qualified_sys_table(schema, JOBS_TABLE),
        }
    }
}

fn job_store_error(e: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::JobStore(e.to_string())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn load(&self, organization_id: &TenantId) -> Result<Option<ProvisioningJob>, ProvisionError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as(&format!("SELECT payload FROM {} WHERE organization_id = $1", self.table))
                .bind(organization_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(job_store_error)?;
        row.map(|(payload,)| serde_json::from_value(payload).map_err(job_store_error))
            .transpose()
    }

    async fn save(&self, job: &ProvisioningJob) -> Result<(), ProvisionError> {
        let payload = serde_json::to_value(job).map_err(job_store_error)?;
        sqlx::query(&format!(
            "INSERT INTO {} (organization_id, job_id, state, attempt, payload, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (organization_id) DO UPDATE SET job_id = EXCLUDED.job_id, state = EXCLUDED.state, \
             attempt = EXCLUDED.attempt, payload = EXCLUDED.payload, updated_at = NOW()",
            self.table
        ))
        .bind(job.organization_id.as_str())
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(job.attempt as i32)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(job_store_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_url_targets_postgres_database() {
        let (admin, name) = parse_db_name_from_url("postgres://u:p@db:5432/storefront?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@db:5432/postgres");
        assert_eq!(name, "storefront");
    }

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("tenant_a"), "\"tenant_a\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn sys_tables_are_schema_qualified() {
        assert_eq!(qualified_sys_table("tenancy", JOBS_TABLE), "tenancy._sys_provisioning_jobs");
    }
}
