//! Egress supervisor
//!
//! Keeps one encoder process alive per [`EgressKey`], restarting it with
//! capped exponential backoff when it fails.
//!
//! # State machine
//!
//! - Failure while STREAMING (or a failed restart): the consecutive failure
//!   count goes up by one. Below `max_retries` the process moves to
//!   RECONNECTING and a restart is scheduled after
//!   `min(base * 2^(count - 1), cap)`; at `max_retries` it moves to FAILED and
//!   nothing further is scheduled.
//! - A successful restart returns to STREAMING.
//! - A process that ran for at least `stability_window` before failing starts
//!   counting from zero again.
//! - `stop` moves any state to STOPPED and forgets the key.
//!
//! Failures are never returned to the caller once a process has been accepted;
//! they land in [`EgressStats`] and on the event channel.

use crate::encoder::{EncodeJob, EncoderExit, EncoderHandle, EncoderLauncher};
use crate::error::{EgressError, EgressResult};
use crate::types::{DestinationId, EgressKey, EgressState, EgressTarget};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use relaycast_sfu::BroadcastId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(60);

/// Keeps `2^n` from overflowing
const MAX_EXPONENT: u32 = 16;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stability_window: Duration,
}

impl RetryPolicy {
    /// Delay before the restart that follows failure number `failures` (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn validate(&self) -> EgressResult<()> {
        if self.max_retries == 0 {
            return Err(EgressError::Config("max_retries must be at least 1".to_string()));
        }
        if self.max_delay < self.base_delay {
            return Err(EgressError::Config(
                "max retry delay must not be below the base delay".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            stability_window: DEFAULT_STABILITY_WINDOW,
        }
    }
}

/// Consistent snapshot of one supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressStats {
    pub broadcast_id: BroadcastId,
    pub target: EgressTarget,
    pub state: EgressState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
    pub destinations: Vec<DestinationId>,
    pub profile: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressEvent {
    Started {
        key: EgressKey,
        pid: Option<u32>,
    },
    StateChanged {
        key: EgressKey,
        from: EgressState,
        to: EgressState,
    },
    RetryScheduled {
        key: EgressKey,
        attempt: u32,
        delay: Duration,
    },
    Failed {
        key: EgressKey,
        error: String,
    },
    Stopped {
        key: EgressKey,
    },
}

impl EgressEvent {
    #[must_use]
    pub const fn key(&self) -> &EgressKey {
        match self {
            Self::Started { key, .. }
            | Self::StateChanged { key, .. }
            | Self::RetryScheduled { key, .. }
            | Self::Failed { key, .. }
            | Self::Stopped { key } => key,
        }
    }
}

struct Record {
    state: EgressState,
    retry_count: u32,
    last_error: Option<String>,
    job: EncodeJob,
    /// Bumped whenever `job` is swapped; a launch of an older version is discarded.
    job_version: u64,
    handle: Option<EncoderHandle>,
    /// Bumped on every launch and intentional kill; stale monitors compare against it.
    generation: u64,
    launching: bool,
    retry_timer: Option<CancellationToken>,
    running_since: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl Record {
    fn new(job: EncodeJob) -> Self {
        Self {
            state: EgressState::Streaming,
            retry_count: 0,
            last_error: None,
            job,
            job_version: 0,
            handle: None,
            generation: 0,
            launching: true,
            retry_timer: None,
            running_since: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    fn set_state(&mut self, state: EgressState) -> EgressState {
        let from = self.state;
        self.state = state;
        self.updated_at = Utc::now();
        from
    }
}

struct Supervised {
    key: EgressKey,
    record: Mutex<Record>,
}

enum FailureOutcome {
    Retry {
        from: EgressState,
        attempt: u32,
        delay: Duration,
        timer: CancellationToken,
    },
    Failed {
        from: EgressState,
        error: String,
    },
}

pub struct EgressSupervisor {
    launcher: Arc<dyn EncoderLauncher>,
    policy: RetryPolicy,
    entries: DashMap<EgressKey, Arc<Supervised>>,
    events: broadcast::Sender<EgressEvent>,
    weak_self: Weak<Self>,
}

impl EgressSupervisor {
    #[must_use]
    pub fn new(launcher: Arc<dyn EncoderLauncher>, policy: RetryPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            launcher,
            policy,
            entries: DashMap::new(),
            events,
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EgressEvent> {
        self.events.subscribe()
    }

    /// Launch and supervise a process for `job.key`.
    ///
    /// A fan-out encoder that fails its first launch is reported as an error and
    /// not retained; a FAILED record it was replacing stays in place. A per-destination encoder is accepted either way; a failed
    /// first launch enters the retry schedule and shows up in its stats.
    pub async fn start(&self, job: EncodeJob) -> EgressResult<EgressStats> {
        let key = job.key.clone();
        let supervised = Arc::new(Supervised {
            key: key.clone(),
            record: Mutex::new(Record::new(job.clone())),
        });

        let previous = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().record.lock().state.is_terminal() {
                    return Err(EgressError::StreamExists(key.to_string()));
                }
                Some(occupied.insert(Arc::clone(&supervised)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&supervised));
                None
            }
        };

        match self.launcher.launch(&job).await {
            Err(e) if key.target == EgressTarget::Fanout => {
                supervised.record.lock().set_state(EgressState::Stopped);
                match previous {
                    Some(previous) => {
                        if let Some(mut current) = self.entries.get_mut(&key) {
                            if Arc::ptr_eq(current.value(), &supervised) {
                                *current = previous;
                            }
                        }
                    }
                    None => {
                        self.entries
                            .remove_if(&key, |_, current| Arc::ptr_eq(current, &supervised));
                    }
                }
                error!(key = %key, error = %e, "Fan-out encoder failed to launch");
                return Err(e);
            }
            result => self.settle_launch(&supervised, result, 0).await,
        }

        Ok(self.snapshot(&supervised))
    }

    /// Stop and forget a process. Returns false if nothing was registered.
    pub async fn stop(&self, key: &EgressKey) -> bool {
        let Some((_, supervised)) = self.entries.remove(key) else {
            debug!(key = %key, "No egress process to stop");
            return false;
        };

        let (from, handle) = {
            let mut record = supervised.record.lock();
            record.generation += 1;
            if let Some(timer) = record.retry_timer.take() {
                timer.cancel();
            }
            let from = record.set_state(EgressState::Stopped);
            (from, record.handle.take())
        };

        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        if matches!(from, EgressState::Streaming | EgressState::Reconnecting) {
            self.emit(EgressEvent::StateChanged {
                key: key.clone(),
                from,
                to: EgressState::Stopped,
            });
        }
        self.emit(EgressEvent::Stopped { key: key.clone() });
        info!(key = %key, "Egress stopped");
        true
    }

    /// Operator-triggered restart with a fresh retry budget.
    ///
    /// Returns `Ok(false)` without touching anything while a restart is already
    /// pending. Otherwise any pending timer is cleared, the failure count reset
    /// and a new process launched immediately.
    pub async fn retry(&self, key: &EgressKey) -> EgressResult<bool> {
        let supervised = self.get(key)?;

        let (job, version, old, from) = {
            let mut record = supervised.record.lock();
            if record.state == EgressState::Reconnecting || record.launching {
                debug!(key = %key, "Retry rejected: restart already in progress");
                return Ok(false);
            }
            if let Some(timer) = record.retry_timer.take() {
                timer.cancel();
            }
            record.retry_count = 0;
            record.generation += 1;
            record.launching = true;
            record.running_since = None;
            let from = record.set_state(EgressState::Reconnecting);
            (record.job.clone(), record.job_version, record.handle.take(), from)
        };

        self.emit(EgressEvent::StateChanged {
            key: key.clone(),
            from,
            to: EgressState::Reconnecting,
        });
        info!(key = %key, "Manual egress retry");

        if let Some(old) = old {
            old.shutdown().await;
        }
        self.launch_and_settle(&supervised, job, version).await;
        Ok(true)
    }

    /// Swap the job of a process (new destinations or profile) and restart it.
    ///
    /// The restart is not a failure and leaves the failure count alone. A
    /// process waiting for its next attempt just picks up the new job then,
    /// and a launch already in flight is replaced as soon as it returns.
    pub async fn reconfigure(&self, key: &EgressKey, mut job: EncodeJob) -> EgressResult<()> {
        let supervised = self.get(key)?;
        job.key = key.clone();

        let (old, from, version) = {
            let mut record = supervised.record.lock();
            record.job = job.clone();
            record.job_version += 1;
            record.updated_at = Utc::now();
            let state = record.state;
            match state {
                EgressState::Reconnecting => return Ok(()),
                _ if record.launching => return Ok(()),
                EgressState::Stopped => return Err(EgressError::StreamNotFound(key.to_string())),
                EgressState::Streaming => {}
                EgressState::Failed => {
                    record.retry_count = 0;
                    record.set_state(EgressState::Reconnecting);
                }
            }
            record.generation += 1;
            record.launching = true;
            record.running_since = None;
            (record.handle.take(), record.state, record.job_version)
        };

        if from == EgressState::Reconnecting {
            self.emit(EgressEvent::StateChanged {
                key: key.clone(),
                from: EgressState::Failed,
                to: EgressState::Reconnecting,
            });
        }
        info!(key = %key, destinations = job.destinations.len(), "Restarting encoder with new configuration");

        if let Some(old) = old {
            old.shutdown().await;
        }
        self.launch_and_settle(&supervised, job, version).await;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self, key: &EgressKey) -> Option<EgressStats> {
        self.entries.get(key).map(|s| self.snapshot(s.value()))
    }

    /// Every process of a broadcast, ordered by target
    #[must_use]
    pub fn all_stats(&self, broadcast_id: &BroadcastId) -> Vec<EgressStats> {
        let mut stats: Vec<EgressStats> = self
            .entries
            .iter()
            .filter(|e| &e.key().broadcast_id == broadcast_id)
            .map(|e| self.snapshot(e.value()))
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    #[must_use]
    pub fn contains(&self, key: &EgressKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self, broadcast_id: &BroadcastId) -> Vec<EgressKey> {
        self.entries
            .iter()
            .filter(|e| &e.key().broadcast_id == broadcast_id)
            .map(|e| e.key().clone())
            .collect()
    }

    pub async fn stop_broadcast(&self, broadcast_id: &BroadcastId) -> usize {
        let mut stopped = 0;
        for key in self.keys(broadcast_id) {
            if self.stop(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn shutdown(&self) {
        let keys: Vec<EgressKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    fn get(&self, key: &EgressKey) -> EgressResult<Arc<Supervised>> {
        self.entries
            .get(key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| EgressError::StreamNotFound(key.to_string()))
    }

    fn snapshot(&self, supervised: &Supervised) -> EgressStats {
        let record = supervised.record.lock();
        EgressStats {
            broadcast_id: supervised.key.broadcast_id.clone(),
            target: supervised.key.target.clone(),
            state: record.state,
            retry_count: record.retry_count,
            max_retries: self.policy.max_retries,
            last_error: record.last_error.clone(),
            pid: record.handle.as_ref().and_then(EncoderHandle::pid),
            destinations: record.job.destinations.iter().map(|d| d.id.clone()).collect(),
            profile: record.job.profile.as_ref().map(|p| p.name.clone()),
            started_at: record.started_at,
            updated_at: record.updated_at,
        }
    }

    fn emit(&self, event: EgressEvent) {
        let _ = self.events.send(event);
    }

    async fn launch_and_settle(&self, supervised: &Arc<Supervised>, job: EncodeJob, version: u64) {
        let result = self.launcher.launch(&job).await;
        self.settle_launch(supervised, result, version).await;
    }

    /// Record the outcome of a launch of job `version`, launching again for as
    /// long as the job was swapped while the previous launch was in flight.
    async fn settle_launch(
        &self,
        supervised: &Arc<Supervised>,
        mut result: EgressResult<EncoderHandle>,
        mut version: u64,
    ) {
        loop {
            let newer = match result {
                Ok(handle) => self.on_launched(supervised, handle, version),
                Err(e) => self.on_launch_failed(supervised, e.to_string(), version),
            };
            let Some((job, next_version)) = newer else {
                return;
            };
            debug!(key = %supervised.key, version = next_version, "Configuration changed during launch; relaunching");
            version = next_version;
            result = self.launcher.launch(&job).await;
        }
    }

    /// The current job if it is newer than `version`; `launching` stays set.
    fn newer_job(record: &Record, version: u64) -> Option<(EncodeJob, u64)> {
        (record.job_version != version).then(|| (record.job.clone(), record.job_version))
    }

    fn on_launched(
        &self,
        supervised: &Arc<Supervised>,
        handle: EncoderHandle,
        version: u64,
    ) -> Option<(EncodeJob, u64)> {
        let key = &supervised.key;
        let (from, generation) = {
            let mut record = supervised.record.lock();
            if record.state == EgressState::Stopped {
                record.launching = false;
                drop(record);
                debug!(key = %key, "Stopped while launching; discarding new encoder");
                handle.terminate();
                return None;
            }
            if let Some(newer) = Self::newer_job(&record, version) {
                drop(record);
                handle.terminate();
                return Some(newer);
            }
            record.launching = false;
            record.generation += 1;
            record.handle = Some(handle.clone());
            record.running_since = Some(Instant::now());
            record.started_at = Some(Utc::now());
            (record.set_state(EgressState::Streaming), record.generation)
        };

        info!(key = %key, pid = ?handle.pid(), "Encoder running");
        self.emit(EgressEvent::Started {
            key: key.clone(),
            pid: handle.pid(),
        });
        if from != EgressState::Streaming {
            self.emit(EgressEvent::StateChanged {
                key: key.clone(),
                from,
                to: EgressState::Streaming,
            });
        }

        self.spawn_monitor(Arc::clone(supervised), generation, handle);
        None
    }

    fn on_launch_failed(
        &self,
        supervised: &Arc<Supervised>,
        error: String,
        version: u64,
    ) -> Option<(EncodeJob, u64)> {
        let outcome = {
            let mut record = supervised.record.lock();
            if record.state == EgressState::Stopped {
                record.launching = false;
                return None;
            }
            if let Some(newer) = Self::newer_job(&record, version) {
                return Some(newer);
            }
            record.launching = false;
            self.record_failure(&mut record, error)
        };
        self.settle(supervised, outcome);
        None
    }

    fn on_exit(&self, supervised: &Arc<Supervised>, generation: u64, exit: EncoderExit) {
        let outcome = {
            let mut record = supervised.record.lock();
            if record.generation != generation || record.state != EgressState::Streaming {
                return;
            }
            warn!(key = %supervised.key, code = ?exit.code, reason = %exit.reason, "Encoder exited unexpectedly");
            self.record_failure(&mut record, EgressError::EncoderRuntime(exit.reason).to_string())
        };
        self.settle(supervised, outcome);
    }

    fn record_failure(&self, record: &mut Record, error: String) -> FailureOutcome {
        if let Some(since) = record.running_since.take() {
            if since.elapsed() >= self.policy.stability_window {
                record.retry_count = 0;
            }
        }
        record.handle = None;
        record.last_error = Some(error.clone());

        let failures = record.retry_count.saturating_add(1);
        record.retry_count = failures;

        if failures >= self.policy.max_retries {
            let from = record.set_state(EgressState::Failed);
            return FailureOutcome::Failed { from, error };
        }

        let timer = CancellationToken::new();
        record.retry_timer = Some(timer.clone());
        let from = record.set_state(EgressState::Reconnecting);
        FailureOutcome::Retry {
            from,
            attempt: failures + 1,
            delay: self.policy.delay_for(failures),
            timer,
        }
    }

    fn settle(&self, supervised: &Arc<Supervised>, outcome: FailureOutcome) {
        let key = &supervised.key;
        match outcome {
            FailureOutcome::Retry {
                from,
                attempt,
                delay,
                timer,
            } => {
                if from != EgressState::Reconnecting {
                    self.emit(EgressEvent::StateChanged {
                        key: key.clone(),
                        from,
                        to: EgressState::Reconnecting,
                    });
                }
                info!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Egress restart scheduled");
                self.emit(EgressEvent::RetryScheduled {
                    key: key.clone(),
                    attempt,
                    delay,
                });
                self.spawn_retry_timer(Arc::clone(supervised), delay, timer);
            }
            FailureOutcome::Failed { from, error } => {
                error!(key = %key, max_retries = self.policy.max_retries, error = %error, "Egress failed permanently");
                self.emit(EgressEvent::StateChanged {
                    key: key.clone(),
                    from,
                    to: EgressState::Failed,
                });
                self.emit(EgressEvent::Failed {
                    key: key.clone(),
                    error,
                });
            }
        }
    }

    fn spawn_monitor(&self, supervised: Arc<Supervised>, generation: u64, handle: EncoderHandle) {
        let supervisor = self.weak_self.clone();
        let span = tracing::info_span!("egress_monitor", key = %supervised.key, generation);
        tokio::spawn(
            async move {
                let exit = handle.exited().await;
                if exit.requested {
                    return;
                }
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.on_exit(&supervised, generation, exit);
                }
            }
            .instrument(span),
        );
    }

    fn spawn_retry_timer(&self, supervised: Arc<Supervised>, delay: Duration, timer: CancellationToken) {
        let supervisor = self.weak_self.clone();
        let span = tracing::info_span!("egress_retry", key = %supervised.key);
        tokio::spawn(
            async move {
                tokio::select! {
                    () = timer.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.relaunch(&supervised).await;
                }
            }
            .instrument(span),
        );
    }

    async fn relaunch(&self, supervised: &Arc<Supervised>) {
        let (job, version) = {
            let mut record = supervised.record.lock();
            if record.state != EgressState::Reconnecting || record.launching {
                return;
            }
            record.launching = true;
            record.retry_timer = None;
            (record.job.clone(), record.job_version)
        };
        debug!(key = %supervised.key, "Restarting encoder");
        self.launch_and_settle(supervised, job, version).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use crate::types::Destination;
    use relaycast_sfu::MediaCodec;
    use std::path::PathBuf;

    fn job(key: &EgressKey) -> EncodeJob {
        EncodeJob {
            key: key.clone(),
            descriptor_path: PathBuf::from("/tmp/relaycast-test.sdp"),
            video_codec: MediaCodec::H264,
            destinations: vec![Destination::new("yt", "youtube", "rtmp://a.rtmp.youtube.com/live2", "k")],
            profile: None,
        }
    }

    fn supervisor(launcher: &Arc<FakeLauncher>) -> Arc<EgressSupervisor> {
        EgressSupervisor::new(launcher.clone(), RetryPolicy::default())
    }

    fn destination_key(id: &str) -> EgressKey {
        EgressKey::destination("b1".into(), id.into())
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_failed() {
        let launcher = FakeLauncher::new();
        launcher.set_fail_always(true);
        let supervisor = supervisor(&launcher);
        let mut events = supervisor.subscribe();
        let key = destination_key("yt");
        let started = Instant::now();

        let stats = supervisor.start(job(&key)).await.unwrap();
        assert_eq!(stats.state, EgressState::Reconnecting);
        assert_eq!(stats.retry_count, 1);

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                EgressEvent::RetryScheduled { delay, .. } => delays.push(delay.as_millis() as u64),
                EgressEvent::Failed { .. } => break,
                _ => {}
            }
        }

        assert_eq!(delays, vec![2000, 4000, 8000, 16000]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
        assert_eq!(launcher.launches(), 5);

        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Failed);
        assert_eq!(stats.retry_count, 5);
        assert_eq!(stats.max_retries, 5);
        assert!(stats.last_error.is_some());

        // No sixth attempt, ever
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(launcher.launches(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rejected_while_reconnecting() {
        let launcher = FakeLauncher::new();
        launcher.fail_next(1);
        let supervisor = supervisor(&launcher);
        let key = destination_key("yt");

        supervisor.start(job(&key)).await.unwrap();
        assert!(!supervisor.retry(&key).await.unwrap());
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Reconnecting);
        assert_eq!(stats.retry_count, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.retry_count, 1);

        assert!(supervisor.retry(&key).await.unwrap());
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.retry_count, 0);
        assert_eq!(launcher.live_processes(), 1);
    }

    #[tokio::test]
    async fn test_retry_unknown_stream() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let result = supervisor.retry(&destination_key("nope")).await;
        assert!(matches!(result, Err(EgressError::StreamNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_restarts_process() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = destination_key("yt");

        supervisor.start(job(&key)).await.unwrap();
        let mut events = supervisor.subscribe();
        assert!(launcher.crash(&key));

        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let started = matches!(event, EgressEvent::Started { .. });
            seen.push(event);
            if started {
                break;
            }
        }
        assert!(seen.contains(&EgressEvent::StateChanged {
            key: key.clone(),
            from: EgressState::Streaming,
            to: EgressState::Reconnecting,
        }));

        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.retry_count, 1);
        assert!(stats.last_error.unwrap().contains("crash"));
        assert_eq!(launcher.live_processes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_run_resets_failure_count() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = destination_key("yt");
        supervisor.start(job(&key)).await.unwrap();

        launcher.crash(&key);
        tokio::time::sleep(Duration::from_secs(3)).await;
        launcher.crash(&key);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(supervisor.stats(&key).unwrap().retry_count, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        launcher.crash(&key);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.retry_count, 1);
        assert_eq!(stats.state, EgressState::Reconnecting);
    }

    #[tokio::test]
    async fn test_fanout_launch_failure_is_returned() {
        let launcher = FakeLauncher::new();
        launcher.fail_next(1);
        let supervisor = supervisor(&launcher);
        let key = EgressKey::fanout("b1".into());

        let result = supervisor.start(job(&key)).await;
        assert!(matches!(result, Err(EgressError::EncoderLaunch(_))));
        assert!(supervisor.stats(&key).is_none());
        assert_eq!(launcher.live_processes(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = destination_key("yt");

        supervisor.start(job(&key)).await.unwrap();
        assert!(matches!(
            supervisor.start(job(&key)).await,
            Err(EgressError::StreamExists(_))
        ));
        assert_eq!(launcher.live_processes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_timer() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = destination_key("yt");

        supervisor.start(job(&key)).await.unwrap();
        assert!(supervisor.stop(&key).await);
        assert_eq!(launcher.live_processes(), 0);
        assert!(supervisor.stats(&key).is_none());
        assert!(!supervisor.stop(&key).await);

        launcher.set_fail_always(true);
        supervisor.start(job(&key)).await.unwrap();
        assert!(supervisor.stop(&key).await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_one_process() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = EgressKey::fanout("b1".into());
        supervisor.start(job(&key)).await.unwrap();

        let mut updated = job(&key);
        updated
            .destinations
            .push(Destination::new("tw", "twitch", "rtmp://live.twitch.tv/app", "k2"));
        supervisor.reconfigure(&key, updated).await.unwrap();

        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.live_processes(), 1);
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.retry_count, 0);
        assert_eq!(stats.destinations.len(), 2);
        assert_eq!(launcher.last_job(&key).unwrap().destinations.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_during_relaunch_uses_new_job() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = EgressKey::fanout("b1".into());
        supervisor.start(job(&key)).await.unwrap();

        launcher.set_launch_delay(Duration::from_secs(1));
        launcher.crash(&key);
        // Restart fires at 2s and is still launching at 2.5s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(launcher.launches(), 2);

        let mut updated = job(&key);
        updated
            .destinations
            .push(Destination::new("tw", "twitch", "rtmp://live.twitch.tv/app", "k2"));
        supervisor.reconfigure(&key, updated).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(launcher.launches(), 3);
        assert_eq!(launcher.live_for(&key), 1);
        assert_eq!(launcher.last_job(&key).unwrap().destinations.len(), 2);

        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.destinations.len(), 2);
        assert_eq!(stats.retry_count, 1);

        // The discarded launch is not supervised
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(launcher.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fanout_survives_failed_restart() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let key = EgressKey::fanout("b1".into());
        supervisor.start(job(&key)).await.unwrap();

        launcher.set_fail_always(true);
        launcher.crash(&key);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(supervisor.stats(&key).unwrap().state, EgressState::Failed);

        let result = supervisor.start(job(&key)).await;
        assert!(matches!(result, Err(EgressError::EncoderLaunch(_))));
        let stats = supervisor.stats(&key).unwrap();
        assert_eq!(stats.state, EgressState::Failed);
        assert_eq!(stats.retry_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_fail_independently() {
        let launcher = FakeLauncher::new();
        let supervisor = supervisor(&launcher);
        let healthy = destination_key("yt");
        let broken = destination_key("tw");
        launcher.set_failing(&broken, true);

        supervisor.start(job(&healthy)).await.unwrap();
        supervisor.start(job(&broken)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(supervisor.stats(&broken).unwrap().state, EgressState::Failed);
        let stats = supervisor.stats(&healthy).unwrap();
        assert_eq!(stats.state, EgressState::Streaming);
        assert_eq!(stats.retry_count, 0);

        let all = supervisor.all_stats(&"b1".into());
        assert_eq!(all.len(), 2);
        assert_eq!(supervisor.stop_broadcast(&"b1".into()).await, 2);
        assert_eq!(launcher.live_processes(), 0);
    }
}
