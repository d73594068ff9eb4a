//! Worker Pool Manager
//!
//! Owns a fixed-size set of SFU worker processes:
//! - Spawns `max(desired, 2)` workers at init
//! - Hands them out round-robin for new routers
//! - Watches each worker's death signal, cascades cleanup to registered
//!   listeners (the router registry) and spawns exactly one replacement
//! - Treats an empty pool that cannot be refilled as fatal

use crate::backend::{SfuBackend, SfuWorker};
use crate::config::PoolConfig;
use crate::error::{SfuError, SfuResult};
use crate::types::WorkerId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const POOL_EVENT_CAPACITY: usize = 64;

/// Notified, before any replacement is spawned, that a worker has died.
#[async_trait]
pub trait WorkerDeathListener: Send + Sync + 'static {
    async fn on_worker_death(&self, worker_id: &WorkerId);
}

/// Lifecycle notifications published by the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerSpawned { worker_id: WorkerId, pid: Option<u32> },
    WorkerDied { worker_id: WorkerId },
    WorkerReplaced { dead: WorkerId, replacement: WorkerId },
    ReplacementFailed { dead: WorkerId, error: String },
    Exhausted,
}

/// Snapshot returned by [`WorkerPool::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub size: usize,
    pub desired: usize,
    pub worker_ids: Vec<WorkerId>,
    pub deaths: u64,
    pub replacements: u64,
}

pub struct WorkerPool {
    backend: Arc<dyn SfuBackend>,
    config: PoolConfig,
    workers: RwLock<Vec<Arc<dyn SfuWorker>>>,
    cursor: AtomicUsize,
    listeners: RwLock<Vec<Weak<dyn WorkerDeathListener>>>,
    events: broadcast::Sender<PoolEvent>,
    shutdown: CancellationToken,
    deaths: AtomicU64,
    replacements: AtomicU64,
}

impl WorkerPool {
    /// Spawn the initial workers.
    ///
    /// Fails with [`SfuError::PoolExhausted`] only if not a single worker
    /// could be started; a partially filled pool logs and carries on.
    pub async fn init(backend: Arc<dyn SfuBackend>, config: PoolConfig) -> SfuResult<Arc<Self>> {
        let (events, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        let pool = Arc::new(Self {
            backend,
            config,
            workers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            listeners: RwLock::new(Vec::new()),
            events,
            shutdown: CancellationToken::new(),
            deaths: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
        });

        let target = pool.config.effective_size();
        let results =
            futures::future::join_all((0..target).map(|_| pool.spawn_worker())).await;

        let mut spawned = 0usize;
        for result in results {
            match result {
                Ok(_) => spawned += 1,
                Err(e) => warn!(error = %e, "Failed to spawn initial worker"),
            }
        }

        if spawned == 0 {
            error!(desired = target, "Could not spawn any SFU worker");
            return Err(SfuError::PoolExhausted);
        }

        if spawned < target {
            warn!(spawned, desired = target, "Worker pool started below desired size");
        } else {
            info!(size = spawned, "Worker pool initialized");
        }

        Ok(pool)
    }

    /// Round-robin over live workers. Never waits for a worker to appear.
    pub fn next_worker(&self) -> SfuResult<Arc<dyn SfuWorker>> {
        let workers = self.workers.read();
        let live: Vec<&Arc<dyn SfuWorker>> = workers
            .iter()
            .filter(|w| !w.death_signal().is_cancelled())
            .collect();

        if live.is_empty() {
            return Err(SfuError::PoolExhausted);
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(Arc::clone(live[index]))
    }

    pub fn add_death_listener(&self, listener: Weak<dyn WorkerDeathListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.read().len()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let worker_ids = self.workers.read().iter().map(|w| w.id().clone()).collect::<Vec<_>>();
        PoolStatus {
            size: worker_ids.len(),
            desired: self.config.effective_size(),
            worker_ids,
            deaths: self.deaths.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }

    /// Close every worker. Deaths observed after this point are expected and ignored.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.write());
        info!(count = workers.len(), "Shutting down worker pool");
        for worker in workers {
            worker.close().await;
        }
    }

    async fn spawn_worker(self: &Arc<Self>) -> SfuResult<WorkerId> {
        let worker = self.backend.create_worker().await?;
        let worker_id = worker.id().clone();
        let pid = worker.pid();

        if self.shutdown.is_cancelled() {
            worker.close().await;
            return Err(SfuError::Worker("pool is shutting down".to_string()));
        }

        self.workers.write().push(Arc::clone(&worker));
        self.watch(worker);

        debug!(worker_id = %worker_id, ?pid, "Spawned SFU worker");
        let _ = self.events.send(PoolEvent::WorkerSpawned {
            worker_id: worker_id.clone(),
            pid,
        });

        Ok(worker_id)
    }

    fn watch(self: &Arc<Self>, worker: Arc<dyn SfuWorker>) {
        let pool = Arc::downgrade(self);
        let death = worker.death_signal();
        let shutdown = self.shutdown.clone();
        let worker_id = worker.id().clone();
        let span = tracing::info_span!("worker_watch", worker_id = %worker_id);

        tokio::spawn(
            async move {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = death.cancelled() => {}
                }
                if let Some(pool) = pool.upgrade() {
                    pool.handle_worker_death(worker_id).await;
                }
            }
            .instrument(span),
        );
    }

    async fn handle_worker_death(self: &Arc<Self>, worker_id: WorkerId) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let removed = {
            let mut workers = self.workers.write();
            let before = workers.len();
            workers.retain(|w| w.id() != &worker_id);
            workers.len() != before
        };
        if !removed {
            debug!(worker_id = %worker_id, "Worker already removed from pool");
            return;
        }

        self.deaths.fetch_add(1, Ordering::Relaxed);
        error!(
            worker_id = %worker_id,
            remaining = self.size(),
            "SFU worker died unexpectedly"
        );
        let _ = self.events.send(PoolEvent::WorkerDied {
            worker_id: worker_id.clone(),
        });

        let listeners: Vec<Arc<dyn WorkerDeathListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_worker_death(&worker_id).await;
        }

        match self.spawn_worker().await {
            Ok(replacement) => {
                self.replacements.fetch_add(1, Ordering::Relaxed);
                info!(
                    dead = %worker_id,
                    replacement = %replacement,
                    size = self.size(),
                    "Replaced dead SFU worker"
                );
                let _ = self.events.send(PoolEvent::WorkerReplaced {
                    dead: worker_id,
                    replacement,
                });
            }
            Err(e) => {
                error!(dead = %worker_id, error = %e, "Failed to replace dead SFU worker");
                let _ = self.events.send(PoolEvent::ReplacementFailed {
                    dead: worker_id,
                    error: e.to_string(),
                });
                if self.size() == 0 {
                    self.on_exhausted();
                }
            }
        }
    }

    fn on_exhausted(&self) {
        error!("Worker pool is empty and could not be refilled");
        let _ = self.events.send(PoolEvent::Exhausted);

        if self.config.exit_on_exhaustion {
            let grace = self.config.fatal_grace;
            error!(grace_ms = grace.as_millis() as u64, "Terminating process after grace delay");
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                std::process::exit(1);
            });
        }
    }
}
