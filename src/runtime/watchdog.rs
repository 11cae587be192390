//! Heartbeat-based stuck-job detection.
//!
//! The job runner tracks each batch operation; the sweeper runs on the
//! configured interval and declares a batch stuck when its heartbeat has
//! gone silent too long or the project has been running past its overall
//! budget. With auto-cancel enabled, a stuck batch's cancellation token
//! fires so the cooperative pipeline unwinds. Tracking ends when the
//! scoped handle drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::config::WatchdogConfig;

static GENERATION: AtomicU64 = AtomicU64::new(0);

struct TrackedBatch {
    generation: u64,
    started_at: Instant,
    last_heartbeat: Instant,
    offset: usize,
    total: usize,
    phase: String,
    cancel: CancellationToken,
    stuck: bool,
}

/// Stuck-batch supervisor.
pub struct Watchdog {
    config: WatchdogConfig,
    tracked: Arc<DashMap<Uuid, TrackedBatch>>,
}

/// Scoped registration; dropping it removes the tracking entry.
///
/// Tracking the next batch before dropping the previous handle replaces the
/// entry in place, so the project's overall duration clock keeps running
/// across batches.
pub struct TrackHandle {
    project_id: Uuid,
    generation: u64,
    tracked: Arc<DashMap<Uuid, TrackedBatch>>,
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        // Only remove the entry this handle created; a newer batch may
        // already own the slot.
        self.tracked
            .remove_if(&self.project_id, |_, batch| batch.generation == self.generation);
    }
}

impl Watchdog {
    /// Create a watchdog with the given thresholds.
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            tracked: Arc::new(DashMap::new()),
        }
    }

    /// Begin tracking a batch operation for a project.
    ///
    /// Re-tracking a live project replaces the batch entry but keeps the
    /// original start time so the overall duration bound still applies.
    pub fn track(
        &self,
        project_id: Uuid,
        offset: usize,
        total: usize,
        cancel: CancellationToken,
    ) -> TrackHandle {
        let now = Instant::now();
        let generation = GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        // Both the duration clock and a stuck verdict outlive batch
        // handovers; only the heartbeat resets.
        let (started_at, stuck) = self
            .tracked
            .get(&project_id)
            .map(|existing| (existing.started_at, existing.stuck))
            .unwrap_or((now, false));

        self.tracked.insert(
            project_id,
            TrackedBatch {
                generation,
                started_at,
                last_heartbeat: now,
                offset,
                total,
                phase: String::new(),
                cancel,
                stuck,
            },
        );

        TrackHandle {
            project_id,
            generation,
            tracked: Arc::clone(&self.tracked),
        }
    }

    /// Refresh a project's heartbeat.
    pub fn heartbeat(&self, project_id: Uuid) {
        if let Some(mut entry) = self.tracked.get_mut(&project_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Record the project's current phase.
    pub fn update_phase(&self, project_id: Uuid, phase: &str) {
        if let Some(mut entry) = self.tracked.get_mut(&project_id) {
            entry.phase = phase.to_string();
        }
    }

    /// Whether the sweeper has declared the project stuck.
    pub fn is_stuck(&self, project_id: Uuid) -> bool {
        self.tracked
            .get(&project_id)
            .map(|entry| entry.stuck)
            .unwrap_or(false)
    }

    /// One sweep over the tracked batches; returns the ids marked stuck.
    pub fn sweep(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let heartbeat_limit = Duration::from_secs(self.config.max_heartbeat_interval_seconds);
        let duration_limit = Duration::from_secs(self.config.max_project_duration_seconds);

        let mut newly_stuck = Vec::new();
        for mut entry in self.tracked.iter_mut() {
            if entry.stuck {
                continue;
            }
            let silent = now.duration_since(entry.last_heartbeat);
            let running = now.duration_since(entry.started_at);

            let reason = if silent > heartbeat_limit {
                Some(format!("no heartbeat for {}s", silent.as_secs()))
            } else if running > duration_limit {
                Some(format!("running for {}s", running.as_secs()))
            } else {
                None
            };

            if let Some(reason) = reason {
                let project_id = *entry.key();
                warn!(
                    project = %project_id,
                    phase = %entry.phase,
                    offset = entry.offset,
                    total = entry.total,
                    "batch stuck: {reason}"
                );
                entry.stuck = true;
                if self.config.auto_cancel_stuck {
                    entry.cancel.cancel();
                }
                newly_stuck.push(project_id);
            }
        }
        newly_stuck
    }

    /// Run the sweeper until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.check_interval_seconds);
        debug!(interval = interval.as_secs(), "watchdog sweeper running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    self.sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auto_cancel: bool) -> WatchdogConfig {
        WatchdogConfig {
            check_interval_seconds: 30,
            max_heartbeat_interval_seconds: 120,
            max_project_duration_seconds: 3600,
            auto_cancel_stuck: auto_cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_heartbeat_marks_stuck() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();
        let _handle = watchdog.track(project_id, 0, 100, CancellationToken::new());

        tokio::time::advance(Duration::from_secs(121)).await;
        let stuck = watchdog.sweep();
        assert_eq!(stuck, vec![project_id]);
        assert!(watchdog.is_stuck(project_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_batch_alive() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();
        let _handle = watchdog.track(project_id, 0, 100, CancellationToken::new());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(60)).await;
            watchdog.heartbeat(project_id);
        }
        assert!(watchdog.sweep().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_duration_overrun() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();
        let _handle = watchdog.track(project_id, 0, 100, CancellationToken::new());

        // Heartbeats keep coming, but the project overruns its hour.
        for _ in 0..37 {
            tokio::time::advance(Duration::from_secs(100)).await;
            watchdog.heartbeat(project_id);
        }
        let stuck = watchdog.sweep();
        assert_eq!(stuck, vec![project_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_cancel_fires_token() {
        let watchdog = Watchdog::new(config(true));
        let project_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let _handle = watchdog.track(project_id, 0, 100, cancel.clone());

        tokio::time::advance(Duration::from_secs(121)).await;
        watchdog.sweep();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_handle_drop_untracks() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();
        {
            let _handle = watchdog.track(project_id, 0, 100, CancellationToken::new());
            assert!(watchdog.tracked.contains_key(&project_id));
        }
        assert!(!watchdog.tracked.contains_key(&project_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_batches_keep_duration_clock() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();

        let mut handle = watchdog.track(project_id, 0, 100, CancellationToken::new());
        for offset in [16usize, 32, 48] {
            tokio::time::advance(Duration::from_secs(1000)).await;
            // New batch tracked before the previous handle drops.
            handle = watchdog.track(project_id, offset, 100, CancellationToken::new());
        }
        let _ = &handle;

        // 3000 seconds in with fresh heartbeats: not stuck yet.
        assert!(watchdog.sweep().is_empty());

        // Another 700 seconds crosses the one-hour overall bound even though
        // the latest batch heartbeat is recent.
        tokio::time::advance(Duration::from_secs(700)).await;
        watchdog.heartbeat(project_id);
        assert_eq!(watchdog.sweep(), vec![project_id]);
    }

    #[tokio::test]
    async fn test_old_handle_drop_does_not_untrack_new_batch() {
        let watchdog = Watchdog::new(config(false));
        let project_id = Uuid::new_v4();

        let first = watchdog.track(project_id, 0, 100, CancellationToken::new());
        let _second = watchdog.track(project_id, 16, 100, CancellationToken::new());
        drop(first);

        assert!(watchdog.tracked.contains_key(&project_id));
    }
}
