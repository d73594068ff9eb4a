//! Encoder launcher double for tests across the workspace
//!
//! "Processes" are tasks waiting on a cancellation token. They can be crashed
//! on demand and every launch is recorded for inspection.

use crate::encoder::{EncodeJob, EncoderExit, EncoderHandle, EncoderLauncher};
use crate::error::{EgressError, EgressResult};
use crate::types::EgressKey;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct FakeProcess {
    key: EgressKey,
    crash: CancellationToken,
}

#[derive(Default)]
struct Shared {
    processes: DashMap<u32, FakeProcess>,
    launches: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    failing_keys: DashSet<EgressKey>,
    jobs: Mutex<Vec<EncodeJob>>,
    launch_delay: Mutex<Duration>,
    next_pid: AtomicU32,
}

/// In-memory [`EncoderLauncher`]
pub struct FakeLauncher {
    shared: Arc<Shared>,
}

impl FakeLauncher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let shared = Shared {
            next_pid: AtomicU32::new(50_000),
            ..Default::default()
        };
        Arc::new(Self { shared: Arc::new(shared) })
    }

    /// Fail the next `count` launches, whatever their key.
    pub fn fail_next(&self, count: usize) {
        self.shared.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.shared.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Fail every launch for one key.
    pub fn set_failing(&self, key: &EgressKey, fail: bool) {
        if fail {
            self.shared.failing_keys.insert(key.clone());
        } else {
            self.shared.failing_keys.remove(key);
        }
    }

    /// Time every launch takes before it succeeds or fails.
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.shared.launch_delay.lock() = delay;
    }

    /// Make every live process for `key` exit on its own. Returns false if none was running.
    pub fn crash(&self, key: &EgressKey) -> bool {
        let mut crashed = false;
        for process in self.shared.processes.iter().filter(|p| &p.key == key) {
            process.crash.cancel();
            crashed = true;
        }
        crashed
    }

    #[must_use]
    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_processes(&self) -> usize {
        self.shared.processes.len()
    }

    #[must_use]
    pub fn live_for(&self, key: &EgressKey) -> usize {
        self.shared.processes.iter().filter(|p| &p.key == key).count()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<EncodeJob> {
        self.shared.jobs.lock().clone()
    }

    #[must_use]
    pub fn last_job(&self, key: &EgressKey) -> Option<EncodeJob> {
        self.shared.jobs.lock().iter().rev().find(|j| &j.key == key).cloned()
    }

    fn should_fail(&self, key: &EgressKey) -> bool {
        self.shared.fail_always.load(Ordering::SeqCst)
            || self.shared.failing_keys.contains(key)
            || self
                .shared
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl EncoderLauncher for FakeLauncher {
    async fn launch(&self, job: &EncodeJob) -> EgressResult<EncoderHandle> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        self.shared.jobs.lock().push(job.clone());

        let delay = *self.shared.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(&job.key) {
            return Err(EgressError::EncoderLaunch("injected launch failure".to_string()));
        }

        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let crash = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.shared.processes.insert(
            pid,
            FakeProcess {
                key: job.key.clone(),
                crash: crash.clone(),
            },
        );

        let shared = Arc::clone(&self.shared);
        let terminate = cancel.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                () = terminate.cancelled() => EncoderExit {
                    code: None,
                    reason: "terminated".to_string(),
                    requested: true,
                },
                () = crash.cancelled() => EncoderExit {
                    code: Some(1),
                    reason: "simulated encoder crash".to_string(),
                    requested: false,
                },
            };
            shared.processes.remove(&pid);
            let _ = exit_tx.send(Some(exit));
        });

        Ok(EncoderHandle::new(Some(pid), cancel, exit_rx))
    }
}
