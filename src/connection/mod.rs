//! Process-wide tenant connection cache with single-flight acquisition and explicit invalidation.

pub mod gate;
pub mod postgres;
pub mod retry;

pub use gate::TenantDatabaseGate;
pub use postgres::PgConnectionFactory;
pub use retry::RetryPolicy;

use crate::error::ConnectionError;
use crate::tenant::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Creates and releases the live handle for one tenant database.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    async fn connect(&self, tenant_id: &TenantId) -> Result<Self::Handle, ConnectionError>;

    async fn release(&self, tenant_id: &TenantId, handle: &Self::Handle);

    /// Liveness check on a cached handle.
    async fn probe(&self, _tenant_id: &TenantId, _handle: &Self::Handle) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// A cached handle plus its bookkeeping. Owned by the cache; callers get shared references.
#[derive(Debug)]
pub struct TenantConnection<H> {
    tenant_id: TenantId,
    handle: H,
    created_at: DateTime<Utc>,
    last_used_ms: AtomicI64,
}

impl<H> TenantConnection<H> {
    fn new(tenant_id: TenantId, handle: H) -> Self {
        let now = Utc::now();
        TenantConnection {
            tenant_id,
            handle,
            created_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_used_ms.load(Ordering::Relaxed)).unwrap_or(self.created_at)
    }

    fn touch(&self) {
        self.last_used_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

pub type SharedConnection<H> = Arc<TenantConnection<H>>;

type Acquisition<H> = Option<Result<SharedConnection<H>, ConnectionError>>;

enum Slot<H> {
    /// One acquisition in flight; every caller waits on the same channel.
    Acquiring {
        generation: u64,
        rx: watch::Receiver<Acquisition<H>>,
    },
    Ready(SharedConnection<H>),
}

enum Settled<H> {
    Cached(SharedConnection<H>),
    Discarded(H, ConnectionError),
    Failed(ConnectionError),
}

struct Inner<F: ConnectionFactory> {
    factory: F,
    retry: RetryPolicy,
    slots: Mutex<HashMap<TenantId, Slot<F::Handle>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> Inner<F> {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<TenantId, Slot<F::Handle>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connect_with_retry(&self, tenant_id: &TenantId) -> Result<F::Handle, ConnectionError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.factory.connect(tenant_id).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "tenant connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop an acquiring slot whose leader is gone, unless a newer acquisition replaced it.
    fn abandon(&self, tenant_id: &TenantId, generation: u64) {
        let mut slots = self.lock_slots();
        let stale = matches!(
            slots.get(tenant_id),
            Some(Slot::Acquiring { generation: g, .. }) if *g == generation
        );
        if stale {
            slots.remove(tenant_id);
            tracing::warn!(tenant_id = %tenant_id, "tenant connection acquisition abandoned");
        }
    }

    /// Leader side of single-flight: connect, settle the slot, then wake every waiter.
    async fn acquire(
        self: Arc<Self>,
        tenant_id: TenantId,
        generation: u64,
        tx: watch::Sender<Acquisition<F::Handle>>,
    ) {
        let result = self.connect_with_retry(&tenant_id).await;

        let settled = {
            let mut slots = self.lock_slots();
            let current = matches!(
                slots.get(&tenant_id),
                Some(Slot::Acquiring { generation: g, .. }) if *g == generation
            );
            match result {
                Ok(handle) if current => {
                    let conn = Arc::new(TenantConnection::new(tenant_id.clone(), handle));
                    slots.insert(tenant_id.clone(), Slot::Ready(Arc::clone(&conn)));
                    Settled::Cached(conn)
                }
                Ok(handle) => {
                    let err = if self.closed.load(Ordering::SeqCst) {
                        ConnectionError::ShuttingDown
                    } else {
                        ConnectionError::Superseded(tenant_id.to_string())
                    };
                    Settled::Discarded(handle, err)
                }
                Err(e) => {
                    if current {
                        slots.remove(&tenant_id);
                    }
                    Settled::Failed(e)
                }
            }
        };

        let published = match settled {
            Settled::Cached(conn) => {
                tracing::info!(tenant_id = %tenant_id, "tenant connection created");
                Ok(conn)
            }
            Settled::Discarded(handle, err) => {
                tracing::info!(tenant_id = %tenant_id, "tenant connection invalidated during acquisition, releasing");
                self.factory.release(&tenant_id, &handle).await;
                Err(err)
            }
            Settled::Failed(err) => {
                tracing::warn!(tenant_id = %tenant_id, error = %err, "tenant connection acquisition failed");
                Err(err)
            }
        };
        tx.send_replace(Some(published));
    }
}

/// Maps tenant id to at most one live handle.
///
/// Cloning shares the same cache. Build one per process (or per test) and tear it
/// down with [`TenantConnectionCache::shutdown`].
pub struct TenantConnectionCache<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Clone for TenantConnectionCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> TenantConnectionCache<F> {
    pub fn new(factory: F, retry: RetryPolicy) -> Self {
        TenantConnectionCache {
            inner: Arc::new(Inner {
                factory,
                retry,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Cached handle for `tenant_id`, creating it on first use. Concurrent callers for an
    /// uncached tenant share one acquisition and all observe its result.
    pub async fn get_connection(&self, tenant_id: &TenantId) -> Result<SharedConnection<F::Handle>, ConnectionError> {
        let (generation, mut rx) = {
            let mut slots = self.inner.lock_slots();
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::ShuttingDown);
            }
            match slots.get(tenant_id) {
                Some(Slot::Ready(conn)) => {
                    conn.touch();
                    tracing::trace!(tenant_id = %tenant_id, "tenant connection reused");
                    return Ok(Arc::clone(conn));
                }
                Some(Slot::Acquiring { generation, rx }) => (*generation, rx.clone()),
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let (tx, rx) = watch::channel(None);
                    slots.insert(
                        tenant_id.clone(),
                        Slot::Acquiring {
                            generation,
                            rx: rx.clone(),
                        },
                    );
                    // Spawned so that a dropped caller cannot strand the other waiters.
                    tokio::spawn(Arc::clone(&self.inner).acquire(tenant_id.clone(), generation, tx));
                    (generation, rx)
                }
            }
        };

        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        let result = match result {
            Some(result) => result,
            None => {
                // The leader died (panic or runtime shutdown) before publishing.
                self.inner.abandon(tenant_id, generation);
                Err(ConnectionError::AcquisitionFailed {
                    tenant_id: tenant_id.to_string(),
                    message: "acquisition ended without a result".into(),
                })
            }
        };
        if let Ok(conn) = &result {
            conn.touch();
        }
        result
    }

    /// Remove the entry and release its handle. An acquisition in flight is discarded
    /// when it completes. Returns whether an entry existed.
    pub async fn invalidate(&self, tenant_id: &TenantId) -> bool {
        let removed = self.inner.lock_slots().remove(tenant_id);
        match removed {
            Some(Slot::Ready(conn)) => {
                tracing::info!(tenant_id = %tenant_id, "tenant connection invalidated");
                self.inner.factory.release(tenant_id, conn.handle()).await;
                true
            }
            Some(Slot::Acquiring { .. }) => {
                tracing::info!(tenant_id = %tenant_id, "in-flight tenant connection invalidated");
                true
            }
            None => false,
        }
    }

    /// Tenants with a ready handle, sorted.
    pub fn cached_tenants(&self) -> Vec<TenantId> {
        let slots = self.inner.lock_slots();
        let mut ids: Vec<TenantId> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release every handle and refuse further acquisitions.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(TenantId, Slot<F::Handle>)> = self.inner.lock_slots().drain().collect();
        let mut released = 0usize;
        for (tenant_id, slot) in drained {
            if let Slot::Ready(conn) = slot {
                self.inner.factory.release(&tenant_id, conn.handle()).await;
                released += 1;
            }
        }
        tracing::info!(released, "tenant connection cache shut down");
    }
}
