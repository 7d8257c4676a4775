//! Current-tenant lookup for the requesting host.

use crate::connection::ConnectionFactory;
use crate::error::AppError;
use crate::extractors::RequestHost;
use crate::resolver::ResolutionStrategy;
use crate::response::success_one_ok;
use crate::state::AppState;
use crate::tenant::TenantId;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    /// Explicit store slug from the route, used when the host does not identify a store.
    pub store: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTenant {
    pub organization_id: TenantId,
    pub name: String,
    pub slug: String,
    pub subdomain: String,
    pub matched_by: ResolutionStrategy,
    pub database: Option<String>,
}

/// GET /api/v1/tenant?store=<slug> — resolve the store and check its database is reachable.
pub async fn current_tenant<F: ConnectionFactory>(
    RequestHost(host): RequestHost,
    State(state): State<AppState<F>>,
    Query(query): Query<TenantQuery>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let resolution = state.resolver.resolve(&host, query.store.as_deref()).await?;
    let tenant_id = &resolution.identity.organization_id;
    let conn = state.connections.get_connection(tenant_id).await?;
    if let Err(e) = state.connections.factory().probe(tenant_id, conn.handle()).await {
        // Drop the dead handle so the next request reconnects.
        state.connections.invalidate(tenant_id).await;
        return Err(e.into());
    }
    let identity = resolution.identity;
    Ok(success_one_ok(CurrentTenant {
        organization_id: identity.organization_id,
        name: identity.name,
        slug: identity.slug,
        subdomain: identity.subdomain,
        matched_by: resolution.matched_by,
        database: resolution.organization.tenant_database.map(|db| db.id),
    }))
}
