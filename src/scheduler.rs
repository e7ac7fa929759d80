//! Hourly Sync Scheduler
//!
//! A background task that asks the sync engine for one sync per interval.
//!
//! ## Behavior
//! - First tick fires immediately after `start`, then once per hour
//! - Settings are re-read on every tick, so toggling auto sync or the display
//!   target takes effect on the next tick without a restart
//! - Ticks while auto sync is disabled do nothing
//! - A tick that finds a sync already running is skipped
//! - Ticks missed while a sync ran long are not replayed in a burst
//! - `stop` never cuts a sync short: a tick already running finishes and
//!   records its status, then the task exits

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SettingsStore;
use crate::error::SyncError;
use crate::sync::SyncEngine;

/// Fixed interval between scheduled syncs.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    settings: Arc<SettingsStore>,
    period: Duration,
    /// Background task and its shutdown signal, present while running
    handle: Mutex<Option<Running>>,
}

struct Running {
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, settings: Arc<SettingsStore>) -> Self {
        Self {
            engine,
            settings,
            period: SYNC_INTERVAL,
            handle: Mutex::new(None),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Starts the background task.
    ///
    /// The first tick fires immediately. Must be called from within a tokio
    /// runtime.
    ///
    /// # Returns
    /// * `true` - A new task was spawned
    /// * `false` - The scheduler was already running
    pub fn start(&self) -> bool {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let engine = self.engine.clone();
        let settings = self.settings.clone();
        let period = self.period;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = signal.notified() => break,
                }
                tick(&engine, &settings).await;
            }
            tracing::debug!("scheduler task exited");
        });
        *guard = Some(Running { task, shutdown });
        tracing::info!(period_secs = period.as_secs(), "scheduler started");
        true
    }

    /// Stops the background task. Returns false if it was not running.
    ///
    /// A sync started by the current tick runs to completion; no further
    /// ticks fire.
    pub fn stop(&self) -> bool {
        let running = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(running) => {
                // notify_one stores a permit, so a task busy in a tick sees it next loop.
                running.shutdown.notify_one();
                tracing::info!("scheduler stopped");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick(engine: &SyncEngine, settings: &SettingsStore) {
    let settings = settings.get();
    if !settings.auto_enabled {
        tracing::debug!("auto sync disabled, skipping tick");
        return;
    }
    if engine.is_running() {
        tracing::debug!("sync already in progress, skipping tick");
        return;
    }

    match engine.sync(settings.apply_all).await {
        Ok(status) => match status.last_error {
            Some(error) => tracing::warn!("scheduled sync failed: {error}"),
            None => tracing::info!(
                result = status.last_result.as_deref().unwrap_or(""),
                "scheduled sync complete"
            ),
        },
        Err(SyncError::Busy) => tracing::debug!("sync already in progress, skipping tick"),
        Err(e) => tracing::warn!("scheduled sync error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unreachable, Harness};

    // Failing metadata keeps each sync on the async path, so paused time
    // advances deterministically between ticks.
    fn harness() -> Harness {
        let h = Harness::new(&["DP-1"]);
        h.metadata.fail_with(unreachable);
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_sync_per_interval() {
        let h = harness();
        let scheduler = Scheduler::new(h.engine.clone(), h.settings.clone());
        assert!(scheduler.start());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.metadata.calls(), 1);

        tokio::time::sleep(SYNC_INTERVAL).await;
        assert_eq!(h.metadata.calls(), 2);

        tokio::time::sleep(SYNC_INTERVAL * 3).await;
        assert_eq!(h.metadata.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_ticks_do_nothing_and_reenable_takes_effect() {
        let h = harness();
        h.settings.update(|s| s.auto_enabled = false).unwrap();
        let scheduler = Scheduler::new(h.engine.clone(), h.settings.clone());
        scheduler.start();

        tokio::time::sleep(SYNC_INTERVAL * 2 + Duration::from_millis(1)).await;
        assert_eq!(h.metadata.calls(), 0);

        h.settings.update(|s| s.auto_enabled = true).unwrap();
        tokio::time::sleep(SYNC_INTERVAL).await;
        assert_eq!(h.metadata.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness();
        let scheduler = Scheduler::new(h.engine.clone(), h.settings.clone());

        assert!(!scheduler.stop());
        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.metadata.calls(), 1);

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        tokio::time::sleep(SYNC_INTERVAL * 2).await;
        assert_eq!(h.metadata.calls(), 1);

        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.metadata.calls(), 2);
    }

    #[tokio::test]
    async fn test_stop_lets_running_sync_finish() {
        let h = Harness::new(&["DP-1"]);
        let gate = h.downloader.gate();
        let mut updates = h.engine.subscribe();
        let scheduler = Scheduler::new(h.engine.clone(), h.settings.clone());
        scheduler.start();

        gate.started.notified().await;
        assert!(scheduler.stop());
        gate.release.notify_one();

        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .expect("sync should complete after stop")
            .unwrap();
        assert!(updates.borrow().is_success());
        assert_eq!(h.desktop.applied(), vec!["DP-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_period() {
        let h = harness();
        let scheduler = Scheduler::new(h.engine.clone(), h.settings.clone())
            .with_period(Duration::from_secs(60));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(h.metadata.calls(), 3);
    }
}
