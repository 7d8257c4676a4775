//! Shared application state for all routes.

use crate::connection::{ConnectionFactory, TenantConnectionCache};
use crate::directory::OrganizationDirectory;
use crate::provision::Provisioner;
use crate::resolver::TenantResolver;
use std::sync::Arc;

pub struct AppState<F: ConnectionFactory> {
    pub directory: Arc<dyn OrganizationDirectory>,
    pub resolver: Arc<TenantResolver>,
    /// Process-wide; torn down by the server on shutdown.
    pub connections: TenantConnectionCache<F>,
    pub provisioner: Arc<Provisioner>,
    /// Region used when a provisioning request names none.
    pub default_region: String,
}

impl<F: ConnectionFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        AppState {
            directory: Arc::clone(&self.directory),
            resolver: Arc::clone(&self.resolver),
            connections: self.connections.clone(),
            provisioner: Arc::clone(&self.provisioner),
            default_region: self.default_region.clone(),
        }
    }
}
