//! Orchestration façade
//!
//! [`Relaycast`] owns every component for the lifetime of the service and is
//! the only surface the broadcast-orchestration layer talks to. A background
//! task forwards ABR adjustments to the bridge and republishes every
//! component event as one [`RelaycastEvent`] stream.

use crate::config::Config;
use crate::error::{Error, Result};
use relaycast_abr::{
    AdaptiveBitrateController, Adjustment, AdjustmentEvent, BitrateLadder, ControllerSnapshot,
    NetworkProbe, NetworkSample,
};
use relaycast_egress::{
    BridgeEvent, CloseReason, Destination, DestinationId, EgressError, EgressEvent, EgressKey,
    EgressStats, EgressStrategy, EncoderLauncher, FanoutBridge, EgressSupervisor, FfmpegLauncher,
    PipelineInfo, PipelineRequest,
};
use relaycast_sfu::{
    default_codec_capabilities, BroadcastId, PoolEvent, PoolStatus, RouterRegistry, SfuBackend,
    SfuRouter, WorkerPool,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

const EVENT_CAPACITY: usize = 512;

/// Everything observable about the service, tagged by origin
#[derive(Debug, Clone)]
pub enum RelaycastEvent {
    Pool(PoolEvent),
    Bridge(BridgeEvent),
    Egress(EgressEvent),
    Adjustment(AdjustmentEvent),
}

pub struct Relaycast {
    config: Config,
    pool: Arc<WorkerPool>,
    registry: Arc<RouterRegistry>,
    supervisor: Arc<EgressSupervisor>,
    bridge: Arc<FanoutBridge>,
    abr: Arc<AdaptiveBitrateController>,
    events: broadcast::Sender<RelaycastEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Relaycast {
    /// Validate `config`, spawn the worker pool and wire the components together.
    pub async fn start(
        config: Config,
        backend: Arc<dyn SfuBackend>,
        launcher: Arc<dyn EncoderLauncher>,
        probe: Option<Arc<dyn NetworkProbe>>,
    ) -> Result<Arc<Self>> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(Error::Config(problems.join("; ")));
        }
        let policy = config.retry_policy();
        policy.validate()?;

        let pool = WorkerPool::init(backend, config.pool_config()).await?;
        let registry = RouterRegistry::new(Arc::clone(&pool), default_codec_capabilities());
        let supervisor = EgressSupervisor::new(launcher, policy);
        let bridge = FanoutBridge::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            config.bridge_config(),
        )?;
        let probe = if config.abr.enabled { probe } else { None };
        let abr = AdaptiveBitrateController::new(BitrateLadder::default(), config.abr_config(), probe)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let service = Arc::new(Self {
            config,
            pool,
            registry,
            supervisor,
            bridge,
            abr,
            events,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        service.spawn_event_router();

        info!(
            workers = service.pool.size(),
            strategy = %service.config.bridge.strategy,
            abr = service.config.abr.enabled,
            "Relaycast started"
        );
        Ok(service)
    }

    /// [`Self::start`] with the `ffmpeg` launcher built from `config.encoder`.
    pub async fn with_ffmpeg(
        config: Config,
        backend: Arc<dyn SfuBackend>,
        probe: Option<Arc<dyn NetworkProbe>>,
    ) -> Result<Arc<Self>> {
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder_config()));
        Self::start(config, backend, launcher, probe).await
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RouterRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn bridge(&self) -> &Arc<FanoutBridge> {
        &self.bridge
    }

    #[must_use]
    pub const fn supervisor(&self) -> &Arc<EgressSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub const fn abr(&self) -> &Arc<AdaptiveBitrateController> {
        &self.abr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelaycastEvent> {
        self.events.subscribe()
    }

    pub async fn get_or_create_router(&self, broadcast_id: &BroadcastId) -> Result<Arc<dyn SfuRouter>> {
        self.ensure_running()?;
        Ok(self.registry.get_or_create_router(broadcast_id).await?)
    }

    pub async fn close_router(&self, broadcast_id: &BroadcastId) {
        self.registry.close_router(broadcast_id).await;
    }

    /// Build the egress pipeline for a broadcast whose router and producers exist.
    ///
    /// With ABR enabled and no explicit profile, the broadcast is put under
    /// control and starts on the controller's initial profile.
    pub async fn start_pipeline(&self, mut request: PipelineRequest) -> Result<PipelineInfo> {
        self.ensure_running()?;
        let broadcast_id = request.broadcast_id.clone();

        let mut abr_started = false;
        if self.config.abr.enabled {
            abr_started = !self.abr.is_running(&broadcast_id);
            let profile = match request.profile.as_ref() {
                Some(profile) => self.abr.start(&broadcast_id, Some(&profile.name))?,
                None => self.abr.start(&broadcast_id, None)?,
            };
            request.profile = Some(profile);
        }

        match self.bridge.create_pipeline(request).await {
            Ok(info) => Ok(info),
            Err(e) => {
                if abr_started {
                    self.abr.stop(&broadcast_id);
                }
                Err(e.into())
            }
        }
    }

    /// Tear a pipeline down. Returns false, without error, if there was none.
    pub async fn stop_pipeline(&self, broadcast_id: &BroadcastId) -> bool {
        self.abr.stop(broadcast_id);
        self.bridge.stop_pipeline(broadcast_id).await
    }

    pub async fn update_destinations(
        &self,
        broadcast_id: &BroadcastId,
        destinations: Vec<Destination>,
    ) -> Result<PipelineInfo> {
        Ok(self.bridge.update_destinations(broadcast_id, destinations).await?)
    }

    /// Add one destination to a running pipeline.
    pub async fn start_egress(
        &self,
        broadcast_id: &BroadcastId,
        destination: Destination,
    ) -> Result<PipelineInfo> {
        Ok(self.bridge.add_destination(broadcast_id, destination).await?)
    }

    /// Remove one destination; removing the last destination ends the pipeline.
    ///
    /// Returns whether anything was removed. Stopping a destination that is
    /// not attached, or on a broadcast without a pipeline, is a no-op.
    pub async fn stop_egress(
        &self,
        broadcast_id: &BroadcastId,
        destination_id: &DestinationId,
    ) -> Result<bool> {
        let removed = self.bridge.remove_destination(broadcast_id, destination_id).await?;
        if !self.bridge.has_pipeline(broadcast_id) {
            self.abr.stop(broadcast_id);
        }
        Ok(removed)
    }

    /// Manual restart of the process serving a destination.
    ///
    /// Returns `Ok(false)` while a restart is already pending. With a shared
    /// fan-out encoder this restarts the encoder for every destination.
    pub async fn retry_egress(
        &self,
        broadcast_id: &BroadcastId,
        destination_id: &DestinationId,
    ) -> Result<bool> {
        let key = self.egress_key(broadcast_id, destination_id).await?;
        Ok(self.supervisor.retry(&key).await?)
    }

    /// Stats of the process delivering to `destination_id`: its own process, or
    /// the shared fan-out encoder that includes it.
    #[must_use]
    pub fn get_stream_stats(
        &self,
        broadcast_id: &BroadcastId,
        destination_id: &DestinationId,
    ) -> Option<EgressStats> {
        self.supervisor
            .stats(&EgressKey::destination(broadcast_id.clone(), destination_id.clone()))
            .or_else(|| {
                self.supervisor
                    .stats(&EgressKey::fanout(broadcast_id.clone()))
                    .filter(|stats| stats.destinations.contains(destination_id))
            })
    }

    #[must_use]
    pub fn get_all_stream_stats(&self, broadcast_id: &BroadcastId) -> Vec<EgressStats> {
        self.supervisor.all_stats(broadcast_id)
    }

    #[must_use]
    pub fn get_pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    #[must_use]
    pub fn get_adjustment_history(&self, broadcast_id: &BroadcastId) -> Vec<Adjustment> {
        self.abr.history(broadcast_id)
    }

    pub fn get_abr_state(&self, broadcast_id: &BroadcastId) -> Result<ControllerSnapshot> {
        Ok(self.abr.state(broadcast_id)?)
    }

    pub async fn pipeline_info(&self, broadcast_id: &BroadcastId) -> Option<PipelineInfo> {
        self.bridge.pipeline_info(broadcast_id).await
    }

    /// Operator override of the bitrate profile, applied to the encoder before returning.
    pub async fn set_profile(
        &self,
        broadcast_id: &BroadcastId,
        profile_name: &str,
        reason: Option<&str>,
    ) -> Result<AdjustmentEvent> {
        let event = self.abr.set_profile(broadcast_id, profile_name, reason)?;
        apply_current_profile(&self.bridge, &self.abr, broadcast_id).await?;
        Ok(event)
    }

    /// Push a network sample for a broadcast; any resulting adjustment is
    /// applied to the encoder before returning.
    pub async fn record_network_sample(
        &self,
        broadcast_id: &BroadcastId,
        sample: NetworkSample,
    ) -> Result<Option<AdjustmentEvent>> {
        let adjustment = self.abr.record_sample(broadcast_id, sample)?;
        if adjustment.is_some() {
            apply_current_profile(&self.bridge, &self.abr, broadcast_id).await?;
        }
        Ok(adjustment)
    }

    /// Release everything a broadcast holds, including failed egress records.
    pub async fn end_broadcast(&self, broadcast_id: &BroadcastId) {
        self.abr.stop(broadcast_id);
        self.bridge.stop_pipeline(broadcast_id).await;
        self.supervisor.stop_broadcast(broadcast_id).await;
        self.registry.close_router(broadcast_id).await;
        info!(broadcast_id = %broadcast_id, "Broadcast ended");
    }

    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down relaycast");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.abr.stop_all();
        self.bridge.shutdown().await;
        self.supervisor.shutdown().await;
        self.registry.close_all().await;
        self.pool.shutdown().await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn egress_key(
        &self,
        broadcast_id: &BroadcastId,
        destination_id: &DestinationId,
    ) -> Result<EgressKey> {
        let info = self
            .bridge
            .pipeline_info(broadcast_id)
            .await
            .ok_or_else(|| EgressError::PipelineNotFound(broadcast_id.to_string()))?;
        if !info.destinations.contains(destination_id) {
            return Err(EgressError::StreamNotFound(
                EgressKey::destination(broadcast_id.clone(), destination_id.clone()).to_string(),
            )
            .into());
        }
        Ok(match info.strategy {
            EgressStrategy::SharedFanout => EgressKey::fanout(broadcast_id.clone()),
            EgressStrategy::PerDestination => {
                EgressKey::destination(broadcast_id.clone(), destination_id.clone())
            }
        })
    }

    fn spawn_event_router(&self) {
        let mut pool_events = self.pool.subscribe();
        let mut bridge_events = self.bridge.subscribe();
        let mut egress_events = self.supervisor.subscribe();
        let mut adjustments = self.abr.subscribe();
        let bridge = Arc::clone(&self.bridge);
        let abr = Arc::clone(&self.abr);
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = pool_events.recv() => forward(event, RelaycastEvent::Pool),
                        event = bridge_events.recv() => forward(event, RelaycastEvent::Bridge),
                        event = egress_events.recv() => forward(event, RelaycastEvent::Egress),
                        event = adjustments.recv() => forward(event, RelaycastEvent::Adjustment),
                    };
                    let event = match event {
                        Routed::Event(event) => event,
                        Routed::Skip => continue,
                        Routed::Closed => break,
                    };

                    match &event {
                        RelaycastEvent::Adjustment(adjustment) => {
                            if let Err(e) =
                                apply_current_profile(&bridge, &abr, &adjustment.broadcast_id).await
                            {
                                warn!(
                                    broadcast_id = %adjustment.broadcast_id,
                                    error = %e,
                                    "Failed to apply bitrate adjustment"
                                );
                            }
                        }
                        RelaycastEvent::Bridge(BridgeEvent::PipelineClosed {
                            broadcast_id,
                            reason: CloseReason::RouterClosed,
                        }) => abr.stop(broadcast_id),
                        _ => {}
                    }

                    let _ = events.send(event);
                }
                debug!("Event router stopped");
            }
            .instrument(tracing::info_span!("event_router")),
        );
    }
}

enum Routed {
    Event(RelaycastEvent),
    Skip,
    /// A component dropped its sender; the service is going away
    Closed,
}

fn forward<T>(received: std::result::Result<T, RecvError>, wrap: fn(T) -> RelaycastEvent) -> Routed {
    match received {
        Ok(event) => Routed::Event(wrap(event)),
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "Event router lagged behind");
            Routed::Skip
        }
        Err(RecvError::Closed) => Routed::Closed,
    }
}

/// Move the pipeline onto the controller's current profile.
///
/// Adjustments are applied both inline and from the event stream; reading the
/// profile at apply time makes a late or repeated delivery a no-op.
async fn apply_current_profile(
    bridge: &FanoutBridge,
    abr: &AdaptiveBitrateController,
    broadcast_id: &BroadcastId,
) -> Result<()> {
    let Ok(profile) = abr.current_profile(broadcast_id) else {
        debug!(broadcast_id = %broadcast_id, "Broadcast no longer under ABR control");
        return Ok(());
    };
    match bridge.apply_profile(broadcast_id, profile).await {
        Ok(()) | Err(EgressError::PipelineNotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
