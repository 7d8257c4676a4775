//! Tenant context: the active tenant and its connection for one session, recomputed
//! when the hostname or route slug changes.

use crate::connection::{ConnectionFactory, SharedConnection, TenantConnectionCache};
use crate::error::TenantError;
use crate::resolver::strategy::ResolutionStrategy;
use crate::resolver::TenantResolver;
use crate::tenant::{TenantId, TenantIdentity};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Identity-affecting inputs of a request or session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RequestTarget {
    pub hostname: String,
    pub route_slug: Option<String>,
}

impl RequestTarget {
    pub fn host(hostname: impl Into<String>) -> Self {
        RequestTarget {
            hostname: hostname.into(),
            route_slug: None,
        }
    }

    pub fn with_route_slug(mut self, slug: impl Into<String>) -> Self {
        self.route_slug = Some(slug.into());
        self
    }
}

/// What downstream features see. A tenant is present only together with its connection.
pub struct TenantSnapshot<H> {
    tenant: Option<TenantIdentity>,
    matched_by: Option<ResolutionStrategy>,
    connection: Option<SharedConnection<H>>,
    loading: bool,
    error: Option<TenantError>,
}

impl<H> Clone for TenantSnapshot<H> {
    fn clone(&self) -> Self {
        TenantSnapshot {
            tenant: self.tenant.clone(),
            matched_by: self.matched_by,
            connection: self.connection.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

impl<H> TenantSnapshot<H> {
    pub fn idle() -> Self {
        TenantSnapshot {
            tenant: None,
            matched_by: None,
            connection: None,
            loading: false,
            error: None,
        }
    }

    pub fn loading() -> Self {
        TenantSnapshot {
            loading: true,
            ..Self::idle()
        }
    }

    pub fn ready(tenant: TenantIdentity, matched_by: ResolutionStrategy, connection: SharedConnection<H>) -> Self {
        TenantSnapshot {
            tenant: Some(tenant),
            matched_by: Some(matched_by),
            connection: Some(connection),
            loading: false,
            error: None,
        }
    }

    pub fn failed(error: TenantError) -> Self {
        TenantSnapshot {
            error: Some(error),
            ..Self::idle()
        }
    }

    pub fn tenant(&self) -> Option<&TenantIdentity> {
        self.tenant.as_ref()
    }

    pub fn matched_by(&self) -> Option<ResolutionStrategy> {
        self.matched_by
    }

    pub fn connection(&self) -> Option<&SharedConnection<H>> {
        self.connection.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&TenantError> {
        self.error.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.tenant.is_some() && self.connection.is_some()
    }
}

#[derive(Default)]
struct Current {
    target: Option<RequestTarget>,
    /// Tenant whose cache entry this context may hold.
    tenant: Option<TenantId>,
}

pub struct TenantContext<F: ConnectionFactory> {
    resolver: Arc<TenantResolver>,
    cache: TenantConnectionCache<F>,
    current: Mutex<Current>,
    tx: watch::Sender<TenantSnapshot<F::Handle>>,
}

impl<F: ConnectionFactory> TenantContext<F> {
    pub fn new(resolver: Arc<TenantResolver>, cache: TenantConnectionCache<F>) -> Self {
        let (tx, _) = watch::channel(TenantSnapshot::idle());
        TenantContext {
            resolver,
            cache,
            current: Mutex::new(Current::default()),
            tx,
        }
    }

    pub fn snapshot(&self) -> TenantSnapshot<F::Handle> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TenantSnapshot<F::Handle>> {
        self.tx.subscribe()
    }

    /// Recompute for `target`. Unchanged inputs keep the current snapshot.
    pub async fn update(&self, target: RequestTarget) -> TenantSnapshot<F::Handle> {
        let mut current = self.current.lock().await;
        if current.target.as_ref() == Some(&target) {
            let snapshot = self.snapshot();
            if snapshot.is_ready() {
                return snapshot;
            }
        }
        current.target = Some(target.clone());
        self.recompute(&mut current, &target).await
    }

    /// Recompute with the current inputs, e.g. after a provisioning job completed.
    pub async fn refresh(&self) -> TenantSnapshot<F::Handle> {
        let mut current = self.current.lock().await;
        match current.target.clone() {
            Some(target) => self.recompute(&mut current, &target).await,
            None => self.snapshot(),
        }
    }

    /// Release the held connection and return to idle.
    pub async fn close(&self) {
        let mut current = self.current.lock().await;
        self.release(&mut current).await;
        current.target = None;
        self.tx.send_replace(TenantSnapshot::idle());
    }

    async fn recompute(&self, current: &mut Current, target: &RequestTarget) -> TenantSnapshot<F::Handle> {
        self.tx.send_replace(TenantSnapshot::loading());

        let resolution = match self
            .resolver
            .resolve(&target.hostname, target.route_slug.as_deref())
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!(host = %target.hostname, error = %e, "tenant context degraded");
                self.release(current).await;
                return self.publish(TenantSnapshot::failed(e.into()));
            }
        };

        let tenant_id = resolution.identity.organization_id.clone();
        if current.tenant.as_ref() != Some(&tenant_id) {
            self.release(current).await;
            tracing::info!(
                tenant_id = %tenant_id,
                matched_by = %resolution.matched_by,
                "tenant context switched"
            );
        }
        current.tenant = Some(tenant_id.clone());

        match self.cache.get_connection(&tenant_id).await {
            Ok(conn) => self.publish(TenantSnapshot::ready(resolution.identity, resolution.matched_by, conn)),
            Err(e) => {
                tracing::warn!(tenant_id = %tenant_id, error = %e, "tenant connection unavailable");
                self.publish(TenantSnapshot::failed(e.into()))
            }
        }
    }

    async fn release(&self, current: &mut Current) {
        if let Some(previous) = current.tenant.take() {
            self.cache.invalidate(&previous).await;
        }
    }

    fn publish(&self, snapshot: TenantSnapshot<F::Handle>) -> TenantSnapshot<F::Handle> {
        self.tx.send_replace(snapshot.clone());
        snapshot
    }
}
