//! Baseline schema for a new tenant database. Statements run in order inside one
//! transaction and are recorded in `_tenant_schema_version`, so re-running is a no-op.

use crate::error::InfraError;
use crate::provision::SchemaMigrator;
use crate::tenant::TenantDatabase;
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;

pub const VERSION_TABLE: &str = "_tenant_schema_version";

#[derive(Clone, Debug)]
pub struct BaselineSchema {
    pub version: i32,
    pub statements: Vec<String>,
}

impl Default for BaselineSchema {
    fn default() -> Self {
        BaselineSchema {
            version: 1,
            statements: vec![
                r#"
                CREATE TABLE IF NOT EXISTS store_settings (
                    key TEXT PRIMARY KEY,
                    value JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
                .into(),
                r#"
                CREATE TABLE IF NOT EXISTS store_members (
                    user_id TEXT PRIMARY KEY,
                    role TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
                .into(),
            ],
        }
    }
}

fn version_table_ddl() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        VERSION_TABLE
    )
}

/// Applies a [`BaselineSchema`] over a short-lived connection to the tenant database.
#[derive(Clone, Debug, Default)]
pub struct PgSchemaMigrator {
    baseline: BaselineSchema,
}

impl PgSchemaMigrator {
    pub fn new(baseline: BaselineSchema) -> Self {
        PgSchemaMigrator { baseline }
    }

    pub fn baseline(&self) -> &BaselineSchema {
        &self.baseline
    }
}

#[async_trait]
impl SchemaMigrator for PgSchemaMigrator {
    async fn migrate(&self, database: &TenantDatabase) -> Result<(), InfraError> {
        let opts = PgConnectOptions::from_str(&database.connection_url)?;
        let mut conn = opts.connect().await?;
        let mut tx = conn.begin().await?;

        sqlx::query(&version_table_ddl()).execute(&mut *tx).await?;
        let applied: (bool,) = sqlx::query_as(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE version = $1)",
            VERSION_TABLE
        ))
        .bind(self.baseline.version)
        .fetch_one(&mut *tx)
        .await?;
        if applied.0 {
            tracing::debug!(database = %database.id, version = self.baseline.version, "baseline already applied");
            return Ok(());
        }

        for statement in &self.baseline.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!(
            "INSERT INTO {} (version) VALUES ($1) ON CONFLICT (version) DO NOTHING",
            VERSION_TABLE
        ))
        .bind(self.baseline.version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        conn.close().await?;

        tracing::info!(database = %database.id, version = self.baseline.version, "baseline schema applied");
        Ok(())
    }
}
