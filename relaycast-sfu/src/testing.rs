//! In-memory SFU used by tests across the workspace
//!
//! Workers, routers, endpoints and consumers are plain structs with
//! cancellation tokens standing in for process and router lifetimes. Killing a
//! worker closes every router it hosts, like the real SFU does.

use crate::backend::{RelayConsumer, RelayEndpoint, RelayEndpointOptions, SfuBackend, SfuRouter, SfuWorker};
use crate::error::{SfuError, SfuResult};
use crate::rtp::{CodecCapability, RawRtpParameters};
use crate::types::{ConsumerId, EndpointId, MediaKind, ProducerId, RouterId, WorkerId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Shared {
    workers: DashMap<WorkerId, Arc<LoopbackWorker>>,
    producers: DashMap<ProducerId, RawRtpParameters>,
    key_frame_requests: DashMap<ProducerId, usize>,
    bound_ports: DashSet<u16>,
    open_endpoints: AtomicUsize,
    open_consumers: AtomicUsize,
    workers_created: AtomicUsize,
    routers_created: AtomicUsize,
    fail_workers: AtomicUsize,
    fail_routers: AtomicUsize,
    router_delay: Mutex<Option<Duration>>,
    next_pid: AtomicU32,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Loopback implementation of [`SfuBackend`]
pub struct LoopbackSfu {
    shared: Arc<Shared>,
}

impl LoopbackSfu {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shared = Shared {
            next_pid: AtomicU32::new(10_000),
            ..Default::default()
        };
        Arc::new(Self { shared: Arc::new(shared) })
    }

    /// Make a producer known to every router, with the parameters its consumers report.
    pub fn add_producer(&self, producer_id: &ProducerId, params: RawRtpParameters) {
        self.shared.producers.insert(producer_id.clone(), params);
    }

    /// Register an H264 video producer and an Opus audio producer.
    pub fn add_default_producers(&self, video: &ProducerId, audio: &ProducerId) {
        self.add_producer(
            video,
            RawRtpParameters {
                mime_type: "video/H264".to_string(),
                clock_rate: 90_000,
                payload_type: 102,
                ssrc: Some(11_111),
                channels: None,
                fmtp: Some("packetization-mode=1;profile-level-id=42e01f".to_string()),
            },
        );
        self.add_producer(
            audio,
            RawRtpParameters {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                payload_type: 111,
                ssrc: Some(22_222),
                channels: Some(2),
                fmtp: None,
            },
        );
    }

    /// Simulate an unexpected process exit.
    pub fn kill_worker(&self, worker_id: &WorkerId) {
        if let Some((_, worker)) = self.shared.workers.remove(worker_id) {
            worker.terminate();
        }
    }

    pub fn fail_next_workers(&self, count: usize) {
        self.shared.fail_workers.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_routers(&self, count: usize) {
        self.shared.fail_routers.store(count, Ordering::SeqCst);
    }

    pub fn set_router_delay(&self, delay: Duration) {
        *self.shared.router_delay.lock() = Some(delay);
    }

    #[must_use]
    pub fn workers_created(&self) -> usize {
        self.shared.workers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.shared.routers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.workers.len()
    }

    #[must_use]
    pub fn open_endpoints(&self) -> usize {
        self.shared.open_endpoints.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.shared.open_consumers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn key_frame_requests(&self, producer_id: &ProducerId) -> usize {
        self.shared
            .key_frame_requests
            .get(producer_id)
            .map_or(0, |n| *n)
    }
}

#[async_trait]
impl SfuBackend for LoopbackSfu {
    async fn create_worker(&self) -> SfuResult<Arc<dyn SfuWorker>> {
        tokio::task::yield_now().await;
        if take_failure(&self.shared.fail_workers) {
            return Err(SfuError::Worker("injected worker spawn failure".to_string()));
        }

        let worker = Arc::new(LoopbackWorker {
            id: WorkerId::new(format!("worker-{}", nanoid::nanoid!(8))),
            pid: self.shared.next_pid.fetch_add(1, Ordering::SeqCst),
            death: CancellationToken::new(),
            routers: Mutex::new(Vec::new()),
            shared: Arc::clone(&self.shared),
        });
        self.shared.workers.insert(worker.id.clone(), Arc::clone(&worker));
        self.shared.workers_created.fetch_add(1, Ordering::SeqCst);
        Ok(worker)
    }
}

pub struct LoopbackWorker {
    id: WorkerId,
    pid: u32,
    death: CancellationToken,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    shared: Arc<Shared>,
}

impl LoopbackWorker {
    fn terminate(&self) {
        let routers = std::mem::take(&mut *self.routers.lock());
        for router in routers {
            router.mark_closed();
        }
        self.death.cancel();
    }
}

#[async_trait]
impl SfuWorker for LoopbackWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn death_signal(&self) -> CancellationToken {
        self.death.clone()
    }

    async fn create_router(&self, codecs: &[CodecCapability]) -> SfuResult<Arc<dyn SfuRouter>> {
        let delay = *self.shared.router_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.shared.fail_routers) {
            return Err(SfuError::Router("injected router creation failure".to_string()));
        }
        if self.death.is_cancelled() {
            return Err(SfuError::Closed(format!("worker {} is dead", self.id)));
        }

        let router = Arc::new(LoopbackRouter {
            id: RouterId::new(format!("router-{}", nanoid::nanoid!(8))),
            worker_id: self.id.clone(),
            codecs: codecs.to_vec(),
            closed: CancellationToken::new(),
            shared: Arc::clone(&self.shared),
        });
        self.routers.lock().push(Arc::clone(&router));
        self.shared.routers_created.fetch_add(1, Ordering::SeqCst);
        Ok(router)
    }

    async fn close(&self) {
        self.shared.workers.remove(&self.id);
        self.terminate();
    }
}

pub struct LoopbackRouter {
    id: RouterId,
    worker_id: WorkerId,
    codecs: Vec<CodecCapability>,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

impl LoopbackRouter {
    fn mark_closed(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl SfuRouter for LoopbackRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn codecs(&self) -> &[CodecCapability] {
        &self.codecs
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.shared.producers.contains_key(producer_id)
    }

    async fn create_relay_endpoint(
        &self,
        options: RelayEndpointOptions,
    ) -> SfuResult<Arc<dyn RelayEndpoint>> {
        if self.is_closed() {
            return Err(SfuError::Closed(format!("router {} is closed", self.id)));
        }
        if !self.shared.bound_ports.insert(options.port) {
            return Err(SfuError::Transport(format!("port {} already in use", options.port)));
        }
        self.shared.open_endpoints.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackEndpoint {
            id: EndpointId::new(format!("endpoint-{}", nanoid::nanoid!(8))),
            port: options.port,
            closed: CancellationToken::new(),
            router_closed: self.closed.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn request_key_frame(&self, producer_id: &ProducerId) -> SfuResult<()> {
        if !self.has_producer(producer_id) {
            return Err(SfuError::ProducerNotFound(producer_id.to_string()));
        }
        *self
            .shared
            .key_frame_requests
            .entry(producer_id.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn close(&self) {
        self.mark_closed();
    }
}

pub struct LoopbackEndpoint {
    id: EndpointId,
    port: u16,
    closed: CancellationToken,
    router_closed: CancellationToken,
    shared: Arc<Shared>,
}

#[async_trait]
impl RelayEndpoint for LoopbackEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        kind: MediaKind,
    ) -> SfuResult<Arc<dyn RelayConsumer>> {
        if self.closed.is_cancelled() || self.router_closed.is_cancelled() {
            return Err(SfuError::Closed(format!("endpoint {} is closed", self.id)));
        }
        let params = self
            .shared
            .producers
            .get(producer_id)
            .map(|p| p.clone())
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;

        self.shared.open_consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackConsumer {
            id: ConsumerId::new(format!("consumer-{}", nanoid::nanoid!(8))),
            producer_id: producer_id.clone(),
            kind,
            params,
            closed: CancellationToken::new(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.shared.bound_ports.remove(&self.port);
            self.shared.open_endpoints.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    params: RawRtpParameters,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

#[async_trait]
impl RelayConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RawRtpParameters {
        self.params.clone()
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.shared.open_consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
