//! Router Registry - one routing context per broadcast
//!
//! Concurrent first use of a broadcast id is collapsed onto a single creation:
//! the creation runs in its own task and every caller awaits the same shared
//! result. The in-flight marker is removed by a drop guard inside that task, so
//! it is cleared on success, failure and panic alike.

use crate::backend::SfuRouter;
use crate::error::{SfuError, SfuResult};
use crate::pool::{WorkerDeathListener, WorkerPool};
use crate::rtp::CodecCapability;
use crate::types::{BroadcastId, WorkerId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn, Instrument};

type PendingRouter = Shared<BoxFuture<'static, SfuResult<Arc<dyn SfuRouter>>>>;

pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    codecs: Vec<CodecCapability>,
    routers: DashMap<BroadcastId, Arc<dyn SfuRouter>>,
    in_flight: Arc<DashMap<BroadcastId, PendingRouter>>,
}

/// Removes the in-flight marker for a broadcast when dropped
struct InFlightGuard {
    in_flight: Arc<DashMap<BroadcastId, PendingRouter>>,
    broadcast_id: BroadcastId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.broadcast_id);
    }
}

impl RouterRegistry {
    /// Create a registry backed by `pool` and subscribe it to worker deaths.
    pub fn new(pool: Arc<WorkerPool>, codecs: Vec<CodecCapability>) -> Arc<Self> {
        let registry = Arc::new(Self {
            pool: Arc::clone(&pool),
            codecs,
            routers: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        pool.add_death_listener(weak);

        registry
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Return the broadcast's router, creating it on first use.
    pub async fn get_or_create_router(
        self: &Arc<Self>,
        broadcast_id: &BroadcastId,
    ) -> SfuResult<Arc<dyn SfuRouter>> {
        if let Some(router) = self.live_router(broadcast_id) {
            return Ok(router);
        }

        let pending = match self.in_flight.entry(broadcast_id.clone()) {
            Entry::Occupied(entry) => {
                debug!(broadcast_id = %broadcast_id, "Joining in-flight router creation");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // A creation may have finished between the fast path and taking the entry
                if let Some(router) = self.live_router(broadcast_id) {
                    return Ok(router);
                }

                let registry = Arc::clone(self);
                let id = broadcast_id.clone();
                let span = tracing::info_span!("router_create", broadcast_id = %id);
                let task = tokio::spawn(async move { registry.create_router(id).await }.instrument(span));

                let pending: PendingRouter = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(SfuError::Internal(format!("router creation task failed: {e}")))
                    })
                }
                .boxed()
                .shared();

                entry.insert(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Lookup only; never creates.
    pub fn get_router(&self, broadcast_id: &BroadcastId) -> SfuResult<Arc<dyn SfuRouter>> {
        self.live_router(broadcast_id)
            .ok_or_else(|| SfuError::RouterNotFound(broadcast_id.to_string()))
    }

    /// Close and forget the broadcast's router. No-op if there is none.
    pub async fn close_router(&self, broadcast_id: &BroadcastId) {
        let pending = self.in_flight.get(broadcast_id).map(|p| p.clone());
        if let Some(pending) = pending {
            let _ = pending.await;
        }

        match self.routers.remove(broadcast_id) {
            Some((_, router)) => {
                router.close().await;
                info!(broadcast_id = %broadcast_id, router_id = %router.id(), "Closed router");
            }
            None => debug!(broadcast_id = %broadcast_id, "close_router: no router registered"),
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<BroadcastId> = self.broadcast_ids();
        for id in ids {
            self.close_router(&id).await;
        }
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    #[must_use]
    pub fn broadcast_ids(&self) -> Vec<BroadcastId> {
        self.routers.iter().map(|entry| entry.key().clone()).collect()
    }

    fn live_router(&self, broadcast_id: &BroadcastId) -> Option<Arc<dyn SfuRouter>> {
        let router = self.routers.get(broadcast_id).map(|r| Arc::clone(r.value()))?;
        if router.is_closed() {
            self.routers
                .remove_if(broadcast_id, |_, r| r.id() == router.id());
            return None;
        }
        Some(router)
    }

    async fn create_router(
        self: Arc<Self>,
        broadcast_id: BroadcastId,
    ) -> SfuResult<Arc<dyn SfuRouter>> {
        let _guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            broadcast_id: broadcast_id.clone(),
        };

        let worker = self.pool.next_worker()?;
        let router = worker.create_router(&self.codecs).await?;

        // The worker may have died while the router was being built
        if router.is_closed() || worker.death_signal().is_cancelled() {
            warn!(
                broadcast_id = %broadcast_id,
                worker_id = %worker.id(),
                "Router lost its worker during creation, discarding"
            );
            router.close().await;
            return Err(SfuError::Router(format!(
                "worker {} died while creating router",
                worker.id()
            )));
        }

        self.routers.insert(broadcast_id.clone(), Arc::clone(&router));
        self.watch_router(broadcast_id.clone(), &router);

        info!(
            broadcast_id = %broadcast_id,
            router_id = %router.id(),
            worker_id = %router.worker_id(),
            "Created router"
        );

        Ok(router)
    }

    /// Evict the entry as soon as the router closes, whoever closed it.
    fn watch_router(self: &Arc<Self>, broadcast_id: BroadcastId, router: &Arc<dyn SfuRouter>) {
        let registry = Arc::downgrade(self);
        let closed = router.closed_signal();
        let router_id = router.id().clone();

        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(registry) = registry.upgrade() {
                if registry
                    .routers
                    .remove_if(&broadcast_id, |_, r| r.id() == &router_id)
                    .is_some()
                {
                    debug!(broadcast_id = %broadcast_id, router_id = %router_id, "Evicted closed router");
                }
            }
        });
    }
}

#[async_trait]
impl WorkerDeathListener for RouterRegistry {
    async fn on_worker_death(&self, worker_id: &WorkerId) {
        let owned: Vec<BroadcastId> = self
            .routers
            .iter()
            .filter(|entry| entry.value().worker_id() == worker_id)
            .map(|entry| entry.key().clone())
            .collect();

        for broadcast_id in owned {
            if let Some((_, router)) = self
                .routers
                .remove_if(&broadcast_id, |_, r| r.worker_id() == worker_id)
            {
                router.close().await;
                warn!(
                    broadcast_id = %broadcast_id,
                    router_id = %router.id(),
                    worker_id = %worker_id,
                    "Evicted router owned by dead worker"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::rtp::default_codec_capabilities;
    use crate::testing::LoopbackSfu;
    use std::time::Duration;

    async fn setup() -> (Arc<LoopbackSfu>, Arc<RouterRegistry>) {
        let sfu = LoopbackSfu::new();
        let config = PoolConfig {
            desired_workers: 2,
            exit_on_exhaustion: false,
            fatal_grace: Duration::from_millis(10),
        };
        let pool = WorkerPool::init(sfu.clone(), config).await.unwrap();
        let registry = RouterRegistry::new(pool, default_codec_capabilities());
        (sfu, registry)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_router() {
        let (sfu, registry) = setup().await;
        let id = BroadcastId::from("b1");

        let first = registry.get_or_create_router(&id).await.unwrap();
        let second = registry.get_or_create_router(&id).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(registry.router_count(), 1);
        assert_eq!(sfu.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_creation_is_deduplicated() {
        let (sfu, registry) = setup().await;
        sfu.set_router_delay(Duration::from_millis(50));
        let id = BroadcastId::from("b-cold");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move { registry.get_or_create_router(&id).await })
            })
            .collect();

        let mut router_ids = Vec::new();
        for handle in handles {
            router_ids.push(handle.await.unwrap().unwrap().id().clone());
        }

        router_ids.dedup();
        assert_eq!(router_ids.len(), 1);
        assert_eq!(sfu.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failure_is_shared_and_retriable() {
        let (sfu, registry) = setup().await;
        sfu.set_router_delay(Duration::from_millis(30));
        sfu.fail_next_routers(1);
        let id = BroadcastId::from("b-fail");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move { registry.get_or_create_router(&id).await })
            })
            .collect();

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => panic!("creation should fail"),
                Err(e) => errors.push(e),
            }
        }
        assert!(errors.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.router_count(), 0);

        // Marker was cleared, so a retry goes through
        let router = registry.get_or_create_router(&id).await.unwrap();
        assert!(!router.is_closed());
    }

    #[tokio::test]
    async fn test_close_router_is_idempotent() {
        let (_sfu, registry) = setup().await;
        let id = BroadcastId::from("b2");

        let router = registry.get_or_create_router(&id).await.unwrap();
        registry.close_router(&id).await;
        registry.close_router(&id).await;
        registry.close_router(&BroadcastId::from("never-existed")).await;

        assert!(router.is_closed());
        assert!(matches!(registry.get_router(&id), Err(SfuError::RouterNotFound(_))));
    }

    #[tokio::test]
    async fn test_worker_death_evicts_owned_routers() {
        let (sfu, registry) = setup().await;
        let id = BroadcastId::from("b3");

        let router = registry.get_or_create_router(&id).await.unwrap();
        let dead_worker = router.worker_id().clone();
        sfu.kill_worker(&dead_worker);

        for _ in 0..100 {
            if registry.pool().size() == 2 && registry.router_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(registry.pool().size(), 2);
        assert!(router.is_closed());

        let fresh = registry.get_or_create_router(&id).await.unwrap();
        assert_ne!(fresh.id(), router.id());
        assert_ne!(fresh.worker_id(), &dead_worker);
    }

    #[tokio::test]
    async fn test_externally_closed_router_is_not_returned() {
        let (_sfu, registry) = setup().await;
        let id = BroadcastId::from("b4");

        let router = registry.get_or_create_router(&id).await.unwrap();
        router.close().await;

        let fresh = registry.get_or_create_router(&id).await.unwrap();
        assert_ne!(fresh.id(), router.id());
    }
}
