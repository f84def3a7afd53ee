//! Periodic refresh of readable properties.
//!
//! UIs usually want cached values that follow the instrument without issuing
//! reads themselves. An [`AutoUpdater`] schedules `read_getter` on a set of
//! properties at a fixed cadence. A property whose previous refresh is still
//! queued (slow channel, contention) is skipped for that tick instead of
//! piling up more reads behind it.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::registry::PropertyBase;

/// Background task polling a fixed set of properties.
///
/// Dropping the updater stops polling.
#[derive(Debug)]
pub struct AutoUpdater {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutoUpdater {
    /// Start polling `properties` every `interval`. Write-only properties are ignored.
    pub fn spawn(properties: Vec<Box<dyn PropertyBase>>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let properties: Vec<_> = properties.into_iter().filter(|p| p.can_get()).collect();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(count = properties.len(), ?interval, "auto-update started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        for property in &properties {
                            if property.refresh_settled() {
                                let _ = property.refresh();
                            } else {
                                trace!(property = %property.name(), "previous refresh still pending");
                            }
                        }
                    }
                }
            }
            debug!("auto-update stopped");
        });

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop polling and wait for the task to end.
    ///
    /// Refreshes already scheduled keep running to completion.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutoUpdater {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
