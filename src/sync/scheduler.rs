//! Periodic sync triggering.
//!
//! One background task per role fires once per interval at a random point
//! inside the trailing flex window, skips ticks while the transport is
//! unreachable and retries failed attempts a bounded number of times.

use crate::config::Config;
use crate::sync::coordinator::{SyncAttempt, SyncCoordinator};
use crate::sync::status::SyncRole;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shortest delay between periodic attempts, whatever the configuration.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Timing policy of a periodic sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Width of the window before each interval boundary in which the
    /// attempt may fire.
    pub flex: Duration,
    pub max_retries: u32,
    /// Retry `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60 * 60),
            flex: Duration::from_secs(30 * 60),
            max_retries: 3,
            retry_backoff: Duration::from_secs(30),
        }
    }
}

impl ScheduleConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.sync_interval,
            flex: config.sync_flex,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        }
    }

    /// Delay until the next periodic attempt, never below [`MIN_INTERVAL`].
    pub fn next_delay(&self) -> Duration {
        let interval = self.interval.max(MIN_INTERVAL);
        let flex = self.flex.min(interval);
        let base = interval - flex;
        let flex_ms = u64::try_from(flex.as_millis()).unwrap_or(u64::MAX);
        let delay = if flex_ms == 0 {
            base
        } else {
            base.saturating_add(Duration::from_millis(rand::rng().random_range(0..=flex_ms)))
        };
        delay.max(MIN_INTERVAL)
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_backoff.saturating_mul(retry)
    }
}

/// Handle to a running periodic sync. Clones refer to the same task.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    role: SyncRole,
    cancel: Arc<watch::Sender<bool>>,
    task: Arc<JoinHandle<()>>,
}

impl ScheduleHandle {
    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Stop the periodic task. An attempt already running is not
    /// interrupted.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Owns the periodic tasks and the manual trigger for one coordinator.
pub struct SyncScheduler {
    coordinator: Arc<SyncCoordinator>,
    config: ScheduleConfig,
    handles: Mutex<HashMap<SyncRole, ScheduleHandle>>,
}

impl SyncScheduler {
    pub fn new(coordinator: Arc<SyncCoordinator>, config: ScheduleConfig) -> Self {
        Self {
            coordinator,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Start the periodic task for `role`. If one is already running, the
    /// existing handle is returned and no second task is started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, role: SyncRole) -> ScheduleHandle {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = handles.get(&role) {
            if !existing.is_cancelled() && !existing.is_finished() {
                debug!(%role, "periodic sync already scheduled");
                return existing.clone();
            }
        }

        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run_periodic(
            Arc::clone(&self.coordinator),
            self.config,
            role,
            cancelled,
        ));
        let handle = ScheduleHandle {
            role,
            cancel: Arc::new(cancel),
            task: Arc::new(task),
        };
        handles.insert(role, handle.clone());

        info!(
            %role,
            interval_secs = self.config.interval.as_secs(),
            flex_secs = self.config.flex.as_secs(),
            "scheduled periodic sync"
        );
        handle
    }

    /// Cancel the periodic task for `role`, if any.
    pub fn cancel(&self, role: SyncRole) -> bool {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&role);
        match removed {
            Some(handle) => {
                handle.cancel();
                info!(%role, "cancelled periodic sync");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<ScheduleHandle> = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in drained {
            handle.cancel();
        }
    }

    /// Manual trigger. Shares the single-flight guard with the periodic
    /// task and is never retried.
    pub async fn sync_now(&self, role: SyncRole) -> SyncAttempt {
        self.coordinator.sync_once(role).await
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_periodic(
    coordinator: Arc<SyncCoordinator>,
    config: ScheduleConfig,
    role: SyncRole,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        let delay = config.next_delay();
        debug!(%role, delay_secs = delay.as_secs(), "next periodic sync");
        if !wait_or_cancel(delay, &mut cancelled).await {
            break;
        }

        if !coordinator.transport().is_available().await {
            info!(%role, "transport unavailable, skipping periodic sync");
            continue;
        }

        let mut retries = 0;
        loop {
            let attempt = coordinator.sync_once(role).await;
            if !attempt.is_error() || retries >= config.max_retries {
                break;
            }
            retries += 1;
            let backoff = config.backoff(retries);
            warn!(%role, retry = retries, backoff_secs = backoff.as_secs(), "sync failed, retrying");
            if !wait_or_cancel(backoff, &mut cancelled).await {
                return;
            }
        }
    }
    debug!(%role, "periodic sync stopped");
}

/// Sleep for `delay`. Returns false if cancelled first.
async fn wait_or_cancel(delay: Duration, cancelled: &mut watch::Receiver<bool>) -> bool {
    if *cancelled.borrow() {
        return false;
    }
    let elapsed = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancelled.wait_for(|c| *c) => false,
    };
    elapsed && !*cancelled.borrow()
}
