//! Adaptive Bitrate (ABR) controller
//!
//! Walks the bitrate ladder one rung at a time based on network samples:
//! - Downgrade after `downgrade_after` consecutive bad samples (default 3)
//! - Upgrade after `upgrade_after` consecutive good samples (default 5)
//! - A sample that is neither clearly good nor clearly bad resets both streaks
//!
//! Quick to protect a struggling stream, slow to put it back at risk.
//! Every change lands in a bounded per-broadcast history and is published as an
//! [`AdjustmentEvent`] for whoever restarts the encoder.

use crate::config::AbrConfig;
use crate::error::{AbrError, AbrResult};
use crate::ladder::{BitrateLadder, BitrateProfile};
use crate::quality::{judge, NetworkSample, QualityTier, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use relaycast_sfu::BroadcastId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};

const ADJUSTMENT_EVENT_CAPACITY: usize = 128;

/// Source of periodic network samples for a broadcast
#[async_trait]
pub trait NetworkProbe: Send + Sync + 'static {
    /// `None` when no fresh measurement is available yet.
    async fn sample(&self, broadcast_id: &BroadcastId) -> Option<NetworkSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentDirection {
    Downgrade,
    Upgrade,
    Manual,
}

/// One entry of the adjustment history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub at: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub direction: AdjustmentDirection,
    pub reason: String,
}

/// Published whenever a broadcast's profile changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentEvent {
    pub broadcast_id: BroadcastId,
    pub profile: BitrateProfile,
    pub adjustment: Adjustment,
}

/// Hysteresis state of one broadcast
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hysteresis {
    pub profile_index: usize,
    pub consecutive_good: u32,
    pub consecutive_bad: u32,
}

/// A step the hysteresis decided to take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: usize,
    pub to: usize,
    pub direction: AdjustmentDirection,
}

impl Hysteresis {
    #[must_use]
    pub const fn at(profile_index: usize) -> Self {
        Self {
            profile_index,
            consecutive_good: 0,
            consecutive_bad: 0,
        }
    }

    /// Feed one verdict; returns the step to apply, if any.
    pub fn observe(
        &mut self,
        verdict: Verdict,
        ladder: &BitrateLadder,
        downgrade_after: u32,
        upgrade_after: u32,
    ) -> Option<Step> {
        match verdict {
            Verdict::Bad => {
                self.consecutive_good = 0;
                self.consecutive_bad += 1;
                if self.consecutive_bad < downgrade_after {
                    return None;
                }
                self.consecutive_bad = 0;
                let to = ladder.lower(self.profile_index)?;
                let step = Step {
                    from: self.profile_index,
                    to,
                    direction: AdjustmentDirection::Downgrade,
                };
                self.profile_index = to;
                Some(step)
            }
            Verdict::Good => {
                self.consecutive_bad = 0;
                self.consecutive_good += 1;
                if self.consecutive_good < upgrade_after {
                    return None;
                }
                self.consecutive_good = 0;
                let to = ladder.higher(self.profile_index)?;
                let step = Step {
                    from: self.profile_index,
                    to,
                    direction: AdjustmentDirection::Upgrade,
                };
                self.profile_index = to;
                Some(step)
            }
            Verdict::Stable => {
                self.consecutive_good = 0;
                self.consecutive_bad = 0;
                None
            }
        }
    }
}

/// Read-only view of a broadcast under control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub broadcast_id: BroadcastId,
    pub profile: BitrateProfile,
    pub hysteresis: Hysteresis,
    pub last_tier: Option<QualityTier>,
    pub history_len: usize,
}

struct ControllerState {
    hysteresis: Hysteresis,
    last_tier: Option<QualityTier>,
    history: VecDeque<Adjustment>,
}

struct BroadcastControl {
    state: Mutex<ControllerState>,
    cancel: CancellationToken,
}

pub struct AdaptiveBitrateController {
    ladder: BitrateLadder,
    config: AbrConfig,
    initial_index: usize,
    probe: Option<Arc<dyn NetworkProbe>>,
    broadcasts: DashMap<BroadcastId, Arc<BroadcastControl>>,
    events: broadcast::Sender<AdjustmentEvent>,
}

impl AdaptiveBitrateController {
    /// Without a probe, samples must be pushed through [`Self::record_sample`].
    pub fn new(
        ladder: BitrateLadder,
        config: AbrConfig,
        probe: Option<Arc<dyn NetworkProbe>>,
    ) -> AbrResult<Arc<Self>> {
        config.validate()?;
        let initial_index = ladder.index_of(&config.initial_profile)?;
        let (events, _) = broadcast::channel(ADJUSTMENT_EVENT_CAPACITY);

        Ok(Arc::new(Self {
            ladder,
            config,
            initial_index,
            probe,
            broadcasts: DashMap::new(),
            events,
        }))
    }

    #[must_use]
    pub fn ladder(&self) -> &BitrateLadder {
        &self.ladder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdjustmentEvent> {
        self.events.subscribe()
    }

    /// Put a broadcast under control. Already-controlled broadcasts keep their state.
    pub fn start(
        self: &Arc<Self>,
        broadcast_id: &BroadcastId,
        initial_profile: Option<&str>,
    ) -> AbrResult<BitrateProfile> {
        let index = match initial_profile {
            Some(name) => self.ladder.index_of(name)?,
            None => self.initial_index,
        };

        if let Some(existing) = self.broadcasts.get(broadcast_id) {
            let current = existing.state.lock().hysteresis.profile_index;
            debug!(broadcast_id = %broadcast_id, "ABR already running for broadcast");
            return self.profile_at(current);
        }

        let control = Arc::new(BroadcastControl {
            state: Mutex::new(ControllerState {
                hysteresis: Hysteresis::at(index),
                last_tier: None,
                history: VecDeque::with_capacity(self.config.history_capacity),
            }),
            cancel: CancellationToken::new(),
        });
        self.broadcasts.insert(broadcast_id.clone(), Arc::clone(&control));

        if let Some(probe) = &self.probe {
            self.spawn_sampler(broadcast_id.clone(), Arc::clone(probe), control.cancel.clone());
        }

        let profile = self.profile_at(index)?;
        info!(broadcast_id = %broadcast_id, profile = %profile, "ABR started");
        Ok(profile)
    }

    /// Stop controlling a broadcast. No-op if it was not started.
    pub fn stop(&self, broadcast_id: &BroadcastId) {
        if let Some((_, control)) = self.broadcasts.remove(broadcast_id) {
            control.cancel.cancel();
            info!(broadcast_id = %broadcast_id, "ABR stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<BroadcastId> = self.broadcasts.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Feed one sample; returns the adjustment it triggered, if any.
    pub fn record_sample(
        &self,
        broadcast_id: &BroadcastId,
        sample: NetworkSample,
    ) -> AbrResult<Option<AdjustmentEvent>> {
        let control = self.control(broadcast_id)?;
        let (tier, verdict) = judge(&sample, &self.config.thresholds);

        let mut state = control.state.lock();
        state.last_tier = Some(tier);
        let step = state.hysteresis.observe(
            verdict,
            &self.ladder,
            self.config.downgrade_after,
            self.config.upgrade_after,
        );

        trace!(
            broadcast_id = %broadcast_id,
            tier = %tier,
            ?verdict,
            good = state.hysteresis.consecutive_good,
            bad = state.hysteresis.consecutive_bad,
            "ABR sample"
        );

        let Some(step) = step else {
            return Ok(None);
        };

        let reason = describe(step.direction, tier, &sample, &self.config);
        let event = self.record(broadcast_id, &mut state, step.from, step.to, step.direction, reason)?;
        Ok(Some(event))
    }

    /// Jump straight to a named profile, bypassing the one-rung rule.
    ///
    /// Both streaks restart from zero, so the next automatic move still needs
    /// its full run of consecutive samples.
    pub fn set_profile(
        &self,
        broadcast_id: &BroadcastId,
        profile_name: &str,
        reason: Option<&str>,
    ) -> AbrResult<AdjustmentEvent> {
        let control = self.control(broadcast_id)?;
        let to = self.ladder.index_of(profile_name)?;

        let mut state = control.state.lock();
        let from = state.hysteresis.profile_index;
        state.hysteresis = Hysteresis::at(to);

        let reason = reason.map_or_else(|| "manual override".to_string(), str::to_string);
        self.record(broadcast_id, &mut state, from, to, AdjustmentDirection::Manual, reason)
    }

    pub fn current_profile(&self, broadcast_id: &BroadcastId) -> AbrResult<BitrateProfile> {
        let control = self.control(broadcast_id)?;
        let index = control.state.lock().hysteresis.profile_index;
        self.profile_at(index)
    }

    pub fn state(&self, broadcast_id: &BroadcastId) -> AbrResult<ControllerSnapshot> {
        let control = self.control(broadcast_id)?;
        let state = control.state.lock();
        Ok(ControllerSnapshot {
            broadcast_id: broadcast_id.clone(),
            profile: self.profile_at(state.hysteresis.profile_index)?,
            hysteresis: state.hysteresis.clone(),
            last_tier: state.last_tier,
            history_len: state.history.len(),
        })
    }

    /// Oldest first. Empty for broadcasts that are not under control.
    #[must_use]
    pub fn history(&self, broadcast_id: &BroadcastId) -> Vec<Adjustment> {
        self.broadcasts
            .get(broadcast_id)
            .map(|c| c.state.lock().history.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_running(&self, broadcast_id: &BroadcastId) -> bool {
        self.broadcasts.contains_key(broadcast_id)
    }

    fn control(&self, broadcast_id: &BroadcastId) -> AbrResult<Arc<BroadcastControl>> {
        self.broadcasts
            .get(broadcast_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| AbrError::NotStarted(broadcast_id.to_string()))
    }

    fn profile_at(&self, index: usize) -> AbrResult<BitrateProfile> {
        self.ladder
            .get(index)
            .cloned()
            .ok_or_else(|| AbrError::UnknownProfile(format!("ladder index {index}")))
    }

    fn record(
        &self,
        broadcast_id: &BroadcastId,
        state: &mut ControllerState,
        from: usize,
        to: usize,
        direction: AdjustmentDirection,
        reason: String,
    ) -> AbrResult<AdjustmentEvent> {
        let from_profile = self.profile_at(from)?;
        let to_profile = self.profile_at(to)?;

        let adjustment = Adjustment {
            at: Utc::now(),
            from: from_profile.name.clone(),
            to: to_profile.name.clone(),
            direction,
            reason,
        };

        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(adjustment.clone());

        info!(
            broadcast_id = %broadcast_id,
            from = %adjustment.from,
            to = %adjustment.to,
            ?direction,
            reason = %adjustment.reason,
            "Bitrate profile adjusted"
        );

        let event = AdjustmentEvent {
            broadcast_id: broadcast_id.clone(),
            profile: to_profile,
            adjustment,
        };
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    fn spawn_sampler(
        self: &Arc<Self>,
        broadcast_id: BroadcastId,
        probe: Arc<dyn NetworkProbe>,
        cancel: CancellationToken,
    ) {
        let controller = Arc::downgrade(self);
        let period = self.config.sample_interval;
        let span = tracing::info_span!("abr_sampler", broadcast_id = %broadcast_id);

        tokio::spawn(
            async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let Some(sample) = probe.sample(&broadcast_id).await else {
                        trace!("No network sample available");
                        continue;
                    };
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    if let Err(e) = controller.record_sample(&broadcast_id, sample) {
                        debug!(error = %e, "Sampler stopping");
                        break;
                    }
                }
            }
            .instrument(span),
        );
    }
}

fn describe(
    direction: AdjustmentDirection,
    tier: QualityTier,
    sample: &NetworkSample,
    config: &AbrConfig,
) -> String {
    let streak = match direction {
        AdjustmentDirection::Downgrade => format!("{} consecutive bad samples", config.downgrade_after),
        AdjustmentDirection::Upgrade => format!("{} consecutive good samples", config.upgrade_after),
        AdjustmentDirection::Manual => "manual override".to_string(),
    };
    format!(
        "{streak} (quality {tier}, loss {:.1}%, drops {:.1}%, rtt {}ms)",
        sample.packet_loss * 100.0,
        sample.drop_rate * 100.0,
        sample.rtt_ms
    )
}
