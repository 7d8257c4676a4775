//! Tenant lookup and provisioning routes.

use crate::connection::ConnectionFactory;
use crate::handlers::{current_tenant, provisioning_status, retry_provisioning, start_provisioning};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

/// Provisioning bodies are a handful of short strings.
pub const PROVISIONING_BODY_LIMIT: usize = 16 * 1024;

pub fn tenant_routes<F: ConnectionFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/tenant", get(current_tenant::<F>))
        .with_state(state)
}

pub fn provisioning_routes<F: ConnectionFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/provisioning", post(start_provisioning::<F>))
        .route("/provisioning/:organization_id", get(provisioning_status::<F>))
        .route("/provisioning/:organization_id/retry", post(retry_provisioning::<F>))
        .layer(RequestBodyLimitLayer::new(PROVISIONING_BODY_LIMIT))
        .with_state(state)
}
