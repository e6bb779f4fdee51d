//! Periodic driver of the retry sweep

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::SweepReport;
use crate::engine::{panic_message, Orchestrator};

/// Wakes the retry sweep on a fixed interval
///
/// A tick is skipped while a sweep is still running or when no ticket is
/// due. Errors are logged and the loop carries on.
pub struct RetryScheduler {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let interval = orchestrator.config().retry_sweep_interval;
        Self {
            orchestrator,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One scheduler tick; `None` when the sweep was not woken
    pub async fn tick(&self) -> Option<SweepReport> {
        if self.orchestrator.inner.sweeper.is_running() {
            debug!("retry sweep still running");
            return None;
        }

        match self.orchestrator.store().has_due_tickets(Utc::now()).await {
            Ok(false) => return None,
            Ok(true) => {}
            Err(e) => {
                error!(error = %e, "failed to check for due retry tickets");
                return None;
            }
        }

        match self.orchestrator.sweep_retries().await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "retry sweep failed");
                None
            }
        }
    }

    /// Run until `shutdown_rx` flips to true
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                            error!(panic = %panic_message(panic.as_ref()), "retry sweep panicked");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("retry scheduler: shutdown requested");
                            break;
                        }
                    }
                }
            }

            debug!("retry scheduler exited");
        })
    }
}
