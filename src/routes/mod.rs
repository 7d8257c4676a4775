pub mod common;
pub mod tenant;

pub use common::common_routes_with_ready;
pub use tenant::{provisioning_routes, tenant_routes};

use crate::connection::ConnectionFactory;
use crate::state::AppState;
use axum::Router;

/// Full application: common routes at the root, tenant and provisioning under `/api/v1`.
pub fn app<F: ConnectionFactory>(state: AppState<F>) -> Router {
    let api = Router::new()
        .merge(tenant_routes(state.clone()))
        .merge(provisioning_routes(state.clone()));
    Router::new()
        .merge(common_routes_with_ready(state))
        .nest("/api/v1", api)
}
