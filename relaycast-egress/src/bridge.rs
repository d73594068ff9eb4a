//! Fan-out bridge
//!
//! Taps a broadcast's composite audio/video producers through plain RTP relay
//! endpoints and feeds them to supervised encoder processes.
//!
//! A pipeline is built in this order:
//! 1. Reserve a port block and open two relay endpoints (video, audio) that
//!    wait for the external side instead of discovering it
//! 2. Consume both producers on those endpoints
//! 3. Write the SDP descriptor the encoder reads
//! 4. Request a keyframe now and every `keyframe_interval` after that
//! 5. Wait `keyframe_wait` so the encoder starts on a decodable frame
//! 6. Hand the encoder job(s) to the [`EgressSupervisor`]
//!
//! With [`EgressStrategy::SharedFanout`] there is one tap and one tee encoder
//! for all destinations. With [`EgressStrategy::PerDestination`] every
//! destination has its own tap and encoder.
//!
//! Destination and profile changes only restart the encoder stage; the SFU
//! side is left alone so there is no second keyframe wait.

use crate::descriptor::{DescriptorFile, MediaDescription, StreamDescriptor};
use crate::encoder::EncodeJob;
use crate::error::{EgressError, EgressResult};
use crate::ports::{PortAllocator, PortLease};
use crate::supervisor::EgressSupervisor;
use crate::types::{validate_destinations, Destination, DestinationId, EgressKey, EgressStrategy, EgressTarget};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relaycast_abr::BitrateProfile;
use relaycast_sfu::{
    BroadcastId, MediaCodec, MediaKind, ProducerId, RelayConsumer, RelayEndpoint,
    RelayEndpointOptions, RouterRegistry, RtpStreamParams, SfuError, SfuRouter,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const BRIDGE_EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Address the relay endpoints bind and the descriptors point at
    pub listen_ip: IpAddr,
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,
    pub keyframe_interval: Duration,
    /// Pause between the first keyframe request and the encoder launch
    pub keyframe_wait: Duration,
    pub strategy: EgressStrategy,
    /// Where SDP descriptors are written
    pub artifact_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtp_port_min: 20_000,
            rtp_port_max: 20_999,
            keyframe_interval: Duration::from_secs(2),
            keyframe_wait: Duration::from_secs(1),
            strategy: EgressStrategy::default(),
            artifact_dir: std::env::temp_dir().join("relaycast"),
        }
    }
}

/// Everything needed to build a pipeline
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub broadcast_id: BroadcastId,
    pub video_producer: ProducerId,
    pub audio_producer: ProducerId,
    pub destinations: Vec<Destination>,
    /// Falls back to the bridge's configured strategy
    pub strategy: Option<EgressStrategy>,
    /// `None` passes H264 through untranscoded
    pub profile: Option<BitrateProfile>,
}

impl PipelineRequest {
    pub fn new(
        broadcast_id: BroadcastId,
        video_producer: ProducerId,
        audio_producer: ProducerId,
        destinations: Vec<Destination>,
    ) -> Self {
        Self {
            broadcast_id,
            video_producer,
            audio_producer,
            destinations,
            strategy: None,
            profile: None,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: EgressStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: BitrateProfile) -> Self {
        self.profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    /// The router was closed underneath the pipeline, usually by a worker death
    RouterClosed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    PipelineStarted {
        broadcast_id: BroadcastId,
        strategy: EgressStrategy,
        destinations: Vec<DestinationId>,
    },
    DestinationsUpdated {
        broadcast_id: BroadcastId,
        destinations: Vec<DestinationId>,
    },
    ProfileApplied {
        broadcast_id: BroadcastId,
        profile: String,
    },
    PipelineClosed {
        broadcast_id: BroadcastId,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub broadcast_id: BroadcastId,
    pub strategy: EgressStrategy,
    pub destinations: Vec<DestinationId>,
    pub profile: Option<String>,
    pub targets: Vec<EgressTarget>,
    /// (video, audio) RTP port of every tap
    pub rtp_ports: Vec<(u16, u16)>,
    pub created_at: DateTime<Utc>,
}

/// Relay endpoints, consumers and descriptor feeding one encoder
struct MediaTap {
    video_endpoint: Arc<dyn RelayEndpoint>,
    audio_endpoint: Arc<dyn RelayEndpoint>,
    video_consumer: Arc<dyn RelayConsumer>,
    audio_consumer: Arc<dyn RelayConsumer>,
    video_codec: MediaCodec,
    descriptor: DescriptorFile,
    ports: PortLease,
}

/// What has been opened so far, released if the tap cannot be completed
#[derive(Default)]
struct PartialTap {
    endpoints: Vec<Arc<dyn RelayEndpoint>>,
    consumers: Vec<Arc<dyn RelayConsumer>>,
}

impl PartialTap {
    async fn release(self) {
        for consumer in self.consumers {
            consumer.close().await;
        }
        for endpoint in self.endpoints {
            endpoint.close().await;
        }
    }
}

impl MediaTap {
    async fn open(
        router: &Arc<dyn SfuRouter>,
        video_producer: &ProducerId,
        audio_producer: &ProducerId,
        ports: PortLease,
        config: &BridgeConfig,
    ) -> EgressResult<Self> {
        let mut partial = PartialTap::default();
        let result = Self::build(&mut partial, router, video_producer, audio_producer, ports, config).await;
        if result.is_err() {
            partial.release().await;
        }
        result
    }

    async fn build(
        partial: &mut PartialTap,
        router: &Arc<dyn SfuRouter>,
        video_producer: &ProducerId,
        audio_producer: &ProducerId,
        ports: PortLease,
        config: &BridgeConfig,
    ) -> EgressResult<Self> {
        let options = |port| RelayEndpointOptions {
            listen_ip: config.listen_ip,
            port,
            comedia: true,
            rtcp_mux: false,
        };

        let video_endpoint = router.create_relay_endpoint(options(ports.video_port())).await?;
        partial.endpoints.push(Arc::clone(&video_endpoint));
        let audio_endpoint = router.create_relay_endpoint(options(ports.audio_port())).await?;
        partial.endpoints.push(Arc::clone(&audio_endpoint));

        let video_consumer = video_endpoint.consume(video_producer, MediaKind::Video).await?;
        partial.consumers.push(Arc::clone(&video_consumer));
        let audio_consumer = audio_endpoint.consume(audio_producer, MediaKind::Audio).await?;
        partial.consumers.push(Arc::clone(&audio_consumer));

        let video = RtpStreamParams::try_from(video_consumer.rtp_parameters())?;
        let audio = RtpStreamParams::try_from(audio_consumer.rtp_parameters())?;
        let video_codec = video.codec;

        let descriptor = StreamDescriptor::new(
            config.listen_ip,
            MediaDescription {
                params: video,
                port: video_endpoint.local_port(),
            },
            MediaDescription {
                params: audio,
                port: audio_endpoint.local_port(),
            },
        )?;
        let descriptor = DescriptorFile::write(&config.artifact_dir, &descriptor)?;

        Ok(Self {
            video_endpoint,
            audio_endpoint,
            video_consumer,
            audio_consumer,
            video_codec,
            descriptor,
            ports,
        })
    }

    async fn close(self) {
        self.video_consumer.close().await;
        self.audio_consumer.close().await;
        self.video_endpoint.close().await;
        self.audio_endpoint.close().await;
        let path = self.descriptor.path_buf();
        if let Err(e) = self.descriptor.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove stream descriptor");
        }
        drop(self.ports);
    }
}

struct PipelineInner {
    destinations: Vec<Destination>,
    profile: Option<BitrateProfile>,
    taps: BTreeMap<EgressTarget, MediaTap>,
    closed: bool,
}

struct Pipeline {
    broadcast_id: BroadcastId,
    strategy: EgressStrategy,
    video_producer: ProducerId,
    audio_producer: ProducerId,
    router: Arc<dyn SfuRouter>,
    /// Stops the keyframe timer and the router watch
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    fn key(&self, target: &EgressTarget) -> EgressKey {
        EgressKey::new(self.broadcast_id.clone(), target.clone())
    }

    fn job(&self, target: &EgressTarget, tap: &MediaTap, inner: &PipelineInner) -> EncodeJob {
        let destinations = match target {
            EgressTarget::Fanout => inner.destinations.clone(),
            EgressTarget::Destination(id) => inner
                .destinations
                .iter()
                .filter(|d| &d.id == id)
                .cloned()
                .collect(),
        };
        EncodeJob {
            key: self.key(target),
            descriptor_path: tap.descriptor.path_buf(),
            video_codec: tap.video_codec,
            destinations,
            profile: inner.profile.clone(),
        }
    }

    fn info(&self, inner: &PipelineInner) -> PipelineInfo {
        PipelineInfo {
            broadcast_id: self.broadcast_id.clone(),
            strategy: self.strategy,
            destinations: inner.destinations.iter().map(|d| d.id.clone()).collect(),
            profile: inner.profile.as_ref().map(|p| p.name.clone()),
            targets: inner.taps.keys().cloned().collect(),
            rtp_ports: inner
                .taps
                .values()
                .map(|t| (t.ports.video_port(), t.ports.audio_port()))
                .collect(),
            created_at: self.created_at,
        }
    }

    fn targets_for(&self, destinations: &[Destination]) -> Vec<EgressTarget> {
        match self.strategy {
            EgressStrategy::SharedFanout => vec![EgressTarget::Fanout],
            EgressStrategy::PerDestination => destinations
                .iter()
                .map(|d| EgressTarget::Destination(d.id.clone()))
                .collect(),
        }
    }
}

pub struct FanoutBridge {
    registry: Arc<RouterRegistry>,
    supervisor: Arc<EgressSupervisor>,
    config: BridgeConfig,
    ports: PortAllocator,
    pipelines: DashMap<BroadcastId, Arc<Pipeline>>,
    events: broadcast::Sender<BridgeEvent>,
    weak_self: Weak<Self>,
}

impl FanoutBridge {
    pub fn new(
        registry: Arc<RouterRegistry>,
        supervisor: Arc<EgressSupervisor>,
        config: BridgeConfig,
    ) -> EgressResult<Arc<Self>> {
        let ports = PortAllocator::new(config.rtp_port_min, config.rtp_port_max)?;
        std::fs::create_dir_all(&config.artifact_dir)?;
        let (events, _) = broadcast::channel(BRIDGE_EVENT_CAPACITY);

        Ok(Arc::new_cyclic(|weak_self| Self {
            registry,
            supervisor,
            config,
            ports,
            pipelines: DashMap::new(),
            events,
            weak_self: weak_self.clone(),
        }))
    }

    #[must_use]
    pub const fn supervisor(&self) -> &Arc<EgressSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn has_pipeline(&self, broadcast_id: &BroadcastId) -> bool {
        self.pipelines.contains_key(broadcast_id)
    }

    #[must_use]
    pub fn pipeline_ids(&self) -> Vec<BroadcastId> {
        self.pipelines.iter().map(|p| p.key().clone()).collect()
    }

    #[must_use]
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }

    pub async fn pipeline_info(&self, broadcast_id: &BroadcastId) -> Option<PipelineInfo> {
        let pipeline = self.pipelines.get(broadcast_id).map(|p| Arc::clone(p.value()))?;
        let inner = pipeline.inner.lock().await;
        Some(pipeline.info(&inner))
    }

    /// Build and register a pipeline. Everything opened is released again if any step fails.
    pub async fn create_pipeline(&self, request: PipelineRequest) -> EgressResult<PipelineInfo> {
        validate_destinations(&request.destinations)?;
        let broadcast_id = request.broadcast_id.clone();
        let router = self.registry.get_router(&broadcast_id)?;
        for producer in [&request.video_producer, &request.audio_producer] {
            if !router.has_producer(producer) {
                return Err(SfuError::ProducerNotFound(producer.to_string()).into());
            }
        }

        let pipeline = Arc::new(Pipeline {
            broadcast_id: broadcast_id.clone(),
            strategy: request.strategy.unwrap_or(self.config.strategy),
            video_producer: request.video_producer,
            audio_producer: request.audio_producer,
            router,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
            inner: Mutex::new(PipelineInner {
                destinations: request.destinations,
                profile: request.profile,
                taps: BTreeMap::new(),
                closed: false,
            }),
        });

        let mut inner = pipeline.inner.lock().await;
        match self.pipelines.entry(broadcast_id.clone()) {
            Entry::Occupied(_) => return Err(EgressError::PipelineExists(broadcast_id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&pipeline));
            }
        }

        if let Err(e) = self.build(&pipeline, &mut inner).await {
            warn!(broadcast_id = %broadcast_id, error = %e, "Pipeline setup failed; rolling back");
            self.release(&pipeline, &mut inner).await;
            self.pipelines
                .remove_if(&broadcast_id, |_, current| Arc::ptr_eq(current, &pipeline));
            return Err(e);
        }

        let info = pipeline.info(&inner);
        drop(inner);

        self.spawn_router_watch(Arc::clone(&pipeline));
        info!(
            broadcast_id = %broadcast_id,
            strategy = %info.strategy,
            destinations = info.destinations.len(),
            "Pipeline started"
        );
        let _ = self.events.send(BridgeEvent::PipelineStarted {
            broadcast_id,
            strategy: info.strategy,
            destinations: info.destinations.clone(),
        });
        Ok(info)
    }

    /// Tear a pipeline down. Returns false, without error, if there was none.
    pub async fn stop_pipeline(&self, broadcast_id: &BroadcastId) -> bool {
        let Some((_, pipeline)) = self.pipelines.remove(broadcast_id) else {
            info!(broadcast_id = %broadcast_id, "No pipeline registered; nothing to stop");
            return false;
        };
        self.close(&pipeline, CloseReason::Requested).await;
        true
    }

    /// Replace the destination set, restarting only the encoder stage.
    pub async fn update_destinations(
        &self,
        broadcast_id: &BroadcastId,
        destinations: Vec<Destination>,
    ) -> EgressResult<PipelineInfo> {
        validate_destinations(&destinations)?;
        let pipeline = self.get(broadcast_id)?;
        let mut inner = pipeline.inner.lock().await;
        if inner.closed {
            return Err(EgressError::PipelineNotFound(broadcast_id.to_string()));
        }
        self.apply_destinations(&pipeline, &mut inner, destinations).await
    }

    pub async fn add_destination(
        &self,
        broadcast_id: &BroadcastId,
        destination: Destination,
    ) -> EgressResult<PipelineInfo> {
        let pipeline = self.get(broadcast_id)?;
        let mut inner = pipeline.inner.lock().await;
        if inner.closed {
            return Err(EgressError::PipelineNotFound(broadcast_id.to_string()));
        }
        if inner.destinations.iter().any(|d| d.id == destination.id) {
            return Err(EgressError::StreamExists(
                EgressKey::destination(broadcast_id.clone(), destination.id).to_string(),
            ));
        }

        let mut destinations = inner.destinations.clone();
        destinations.push(destination);
        validate_destinations(&destinations)?;
        self.apply_destinations(&pipeline, &mut inner, destinations).await
    }

    /// Drop one destination. Removing the last one stops the whole pipeline.
    ///
    /// Returns whether a destination was removed. An unknown broadcast or
    /// destination, or a pipeline torn down meanwhile, leaves everything as is.
    pub async fn remove_destination(
        &self,
        broadcast_id: &BroadcastId,
        destination_id: &DestinationId,
    ) -> EgressResult<bool> {
        let Ok(pipeline) = self.get(broadcast_id) else {
            debug!(broadcast_id = %broadcast_id, destination_id = %destination_id, "No pipeline registered; nothing to remove");
            return Ok(false);
        };
        let mut inner = pipeline.inner.lock().await;
        if inner.closed || !inner.destinations.iter().any(|d| &d.id == destination_id) {
            debug!(broadcast_id = %broadcast_id, destination_id = %destination_id, "Destination not attached; nothing to remove");
            return Ok(false);
        }

        let remaining: Vec<Destination> = inner
            .destinations
            .iter()
            .filter(|d| &d.id != destination_id)
            .cloned()
            .collect();

        if remaining.is_empty() {
            drop(inner);
            info!(broadcast_id = %broadcast_id, "Last destination removed; stopping pipeline");
            self.pipelines
                .remove_if(broadcast_id, |_, current| Arc::ptr_eq(current, &pipeline));
            self.close(&pipeline, CloseReason::Requested).await;
            return Ok(true);
        }

        self.apply_destinations(&pipeline, &mut inner, remaining).await?;
        Ok(true)
    }

    /// Restart the encoder stage with a new encoding profile.
    pub async fn apply_profile(
        &self,
        broadcast_id: &BroadcastId,
        profile: BitrateProfile,
    ) -> EgressResult<()> {
        let pipeline = self.get(broadcast_id)?;
        let mut inner = pipeline.inner.lock().await;
        if inner.closed {
            return Err(EgressError::PipelineNotFound(broadcast_id.to_string()));
        }
        if inner.profile.as_ref() == Some(&profile) {
            return Ok(());
        }
        inner.profile = Some(profile.clone());

        let jobs: Vec<(EgressKey, EncodeJob)> = inner
            .taps
            .iter()
            .map(|(target, tap)| (pipeline.key(target), pipeline.job(target, tap, &inner)))
            .collect();
        for (key, job) in jobs {
            match self.supervisor.reconfigure(&key, job).await {
                Ok(()) => {}
                Err(EgressError::StreamNotFound(_)) => {
                    debug!(key = %key, "No egress process to reconfigure");
                }
                Err(e) => return Err(e),
            }
        }

        info!(broadcast_id = %broadcast_id, profile = %profile, "Applied bitrate profile");
        let _ = self.events.send(BridgeEvent::ProfileApplied {
            broadcast_id: broadcast_id.clone(),
            profile: profile.name,
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        for broadcast_id in self.pipeline_ids() {
            if let Some((_, pipeline)) = self.pipelines.remove(&broadcast_id) {
                self.close(&pipeline, CloseReason::Shutdown).await;
            }
        }
    }

    fn get(&self, broadcast_id: &BroadcastId) -> EgressResult<Arc<Pipeline>> {
        self.pipelines
            .get(broadcast_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| EgressError::PipelineNotFound(broadcast_id.to_string()))
    }

    async fn open_tap(&self, pipeline: &Pipeline) -> EgressResult<MediaTap> {
        let ports = self.ports.allocate()?;
        MediaTap::open(
            &pipeline.router,
            &pipeline.video_producer,
            &pipeline.audio_producer,
            ports,
            &self.config,
        )
        .await
    }

    async fn request_key_frame(&self, pipeline: &Pipeline) {
        if let Err(e) = pipeline.router.request_key_frame(&pipeline.video_producer).await {
            warn!(broadcast_id = %pipeline.broadcast_id, error = %e, "Keyframe request failed");
        }
    }

    async fn build(&self, pipeline: &Arc<Pipeline>, inner: &mut PipelineInner) -> EgressResult<()> {
        for target in pipeline.targets_for(&inner.destinations) {
            let tap = self.open_tap(pipeline).await?;
            inner.taps.insert(target, tap);
        }

        self.request_key_frame(pipeline).await;
        self.spawn_keyframe_timer(pipeline);
        tokio::time::sleep(self.config.keyframe_wait).await;

        if pipeline.router.is_closed() {
            return Err(SfuError::Closed(format!("router for {} closed during setup", pipeline.broadcast_id)).into());
        }

        let current: &PipelineInner = inner;
        let jobs: Vec<EncodeJob> = current
            .taps
            .iter()
            .map(|(target, tap)| pipeline.job(target, tap, current))
            .collect();
        for job in jobs {
            self.supervisor.start(job).await?;
        }
        Ok(())
    }

    /// Move a pipeline onto a new destination set.
    ///
    /// Taps and encoders for new targets come up before anything is torn down.
    /// If that fails they are released again and the pipeline keeps its
    /// previous destinations.
    async fn apply_destinations(
        &self,
        pipeline: &Arc<Pipeline>,
        inner: &mut PipelineInner,
        destinations: Vec<Destination>,
    ) -> EgressResult<PipelineInfo> {
        let wanted = pipeline.targets_for(&destinations);

        let mut opened = Vec::new();
        for target in wanted.iter().filter(|t| !inner.taps.contains_key(*t)) {
            match self.open_tap(pipeline).await {
                Ok(tap) => opened.push((target.clone(), tap)),
                Err(e) => {
                    for (_, tap) in opened {
                        tap.close().await;
                    }
                    return Err(e);
                }
            }
        }
        let added: Vec<EgressTarget> = opened.iter().map(|(target, _)| target.clone()).collect();
        if !added.is_empty() {
            self.request_key_frame(pipeline).await;
        }

        let previous = std::mem::replace(&mut inner.destinations, destinations);
        inner.taps.extend(opened);
        for target in &added {
            let Some(tap) = inner.taps.get(target) else {
                continue;
            };
            let job = pipeline.job(target, tap, inner);
            if let Err(e) = self.supervisor.start(job).await {
                warn!(broadcast_id = %pipeline.broadcast_id, error = %e, "Destination change failed; keeping previous destinations");
                for target in &added {
                    self.supervisor.stop(&pipeline.key(target)).await;
                    if let Some(tap) = inner.taps.remove(target) {
                        tap.close().await;
                    }
                }
                inner.destinations = previous;
                return Err(e);
            }
        }

        let removed: Vec<EgressTarget> = inner
            .taps
            .keys()
            .filter(|t| !wanted.contains(t))
            .cloned()
            .collect();
        for target in removed {
            self.supervisor.stop(&pipeline.key(&target)).await;
            if let Some(tap) = inner.taps.remove(&target) {
                tap.close().await;
            }
        }

        for target in wanted.iter().filter(|t| !added.contains(t)) {
            let key = pipeline.key(target);
            let Some(tap) = inner.taps.get(target) else {
                continue;
            };

            let job = pipeline.job(target, tap, inner);
            let unchanged = match target {
                EgressTarget::Fanout => previous == inner.destinations,
                EgressTarget::Destination(_) => {
                    previous.iter().filter(|d| job.destinations.contains(d)).count()
                        == job.destinations.len()
                }
            };
            if unchanged {
                continue;
            }
            if self.supervisor.contains(&key) {
                self.supervisor.reconfigure(&key, job).await?;
            } else {
                self.supervisor.start(job).await?;
            }
        }

        let info = pipeline.info(inner);
        info!(
            broadcast_id = %pipeline.broadcast_id,
            destinations = info.destinations.len(),
            "Destinations updated"
        );
        let _ = self.events.send(BridgeEvent::DestinationsUpdated {
            broadcast_id: pipeline.broadcast_id.clone(),
            destinations: info.destinations.clone(),
        });
        Ok(info)
    }

    /// Stop encoders and release every tap. Returns false if already released.
    async fn release(&self, pipeline: &Pipeline, inner: &mut PipelineInner) -> bool {
        pipeline.cancel.cancel();
        if inner.closed {
            return false;
        }
        inner.closed = true;

        let taps = std::mem::take(&mut inner.taps);
        for (target, tap) in taps {
            self.supervisor.stop(&pipeline.key(&target)).await;
            tap.close().await;
        }
        true
    }

    async fn close(&self, pipeline: &Pipeline, reason: CloseReason) {
        let mut inner = pipeline.inner.lock().await;
        if !self.release(pipeline, &mut inner).await {
            return;
        }
        drop(inner);

        info!(broadcast_id = %pipeline.broadcast_id, ?reason, "Pipeline stopped");
        let _ = self.events.send(BridgeEvent::PipelineClosed {
            broadcast_id: pipeline.broadcast_id.clone(),
            reason,
        });
    }

    fn spawn_keyframe_timer(&self, pipeline: &Pipeline) {
        let router = Arc::clone(&pipeline.router);
        let producer = pipeline.video_producer.clone();
        let cancel = pipeline.cancel.clone();
        let period = self.config.keyframe_interval;
        let span = tracing::info_span!("keyframe_timer", broadcast_id = %pipeline.broadcast_id);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = router.request_key_frame(&producer).await {
                        debug!(error = %e, "Periodic keyframe request failed");
                    }
                }
            }
            .instrument(span),
        );
    }

    fn spawn_router_watch(&self, pipeline: Arc<Pipeline>) {
        let bridge = self.weak_self.clone();
        let router_closed = pipeline.router.closed_signal();
        let span = tracing::info_span!("router_watch", broadcast_id = %pipeline.broadcast_id);

        tokio::spawn(
            async move {
                tokio::select! {
                    () = pipeline.cancel.cancelled() => return,
                    () = router_closed.cancelled() => {}
                }
                let Some(bridge) = bridge.upgrade() else {
                    return;
                };
                warn!("Router closed under a live pipeline; tearing it down");
                bridge
                    .pipelines
                    .remove_if(&pipeline.broadcast_id, |_, current| Arc::ptr_eq(current, &pipeline));
                bridge.close(&pipeline, CloseReason::RouterClosed).await;
            }
            .instrument(span),
        );
    }
}
