//! The expiration reaper.
//!
//! A background task started by [`BindingManager::start`] that periodically
//! asks the store for bindings past their valid lifetime and expires them.
//! [`BindingManager::stop`] signals it over a watch channel and waits for it:
//! a run that has already started finishes its batch, later runs never
//! start.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::binding::IaType;
use crate::error::{Error, Result};
use crate::manager::{BindingManager, TransitionOutcome};
use crate::policy;

/// Counts from one reaper run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Expired bindings returned by the store.
    pub found: usize,
    /// Bindings deleted or reset.
    pub expired: usize,
    /// Bindings that were no longer expired when their turn came.
    pub skipped: usize,
    /// Bindings whose transition failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
struct ReaperSchedule {
    startup_delay: Duration,
    run_period: Duration,
}

/// Handle to a running reaper task.
#[derive(Debug)]
pub(crate) struct Reaper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    fn spawn(manager: Weak<BindingManager>, ia_type: IaType, schedule: ReaperSchedule) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reaper_loop(manager, ia_type, schedule, shutdown_rx));
        Self { shutdown, handle }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            warn!("Binding reaper task ended abnormally: {}", error);
        }
    }
}

async fn reaper_loop(
    manager: Weak<BindingManager>,
    ia_type: IaType,
    schedule: ReaperSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(schedule.startup_delay) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = tokio::time::interval(schedule.run_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        debug!("Looking for expired bindings of type {}...", ia_type);
        manager.expire_bindings().await;
    }

    debug!("Binding reaper for {} exited", ia_type);
}

impl BindingManager {
    /// Starts the reaper using the startup delay and run period policies.
    ///
    /// Starting an already running manager logs a warning and keeps the
    /// existing schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if either policy is missing or the run
    /// period is zero.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let startup_delay = self.policy.duration(policy::REAPER_STARTUP_DELAY)?;
        let run_period = self.policy.duration(policy::REAPER_RUN_PERIOD)?;
        if run_period.is_zero() {
            return Err(Error::Policy(format!(
                "{} must be greater than zero",
                policy::REAPER_RUN_PERIOD
            )));
        }

        let mut reaper = self.reaper_slot().lock().await;
        if reaper.is_some() {
            warn!("Binding reaper for {} already running", self.ia_type());
            return Ok(());
        }

        *reaper = Some(Reaper::spawn(
            Arc::downgrade(self),
            self.ia_type(),
            ReaperSchedule {
                startup_delay,
                run_period,
            },
        ));
        info!(
            "Binding reaper for {} started (startup delay {:?}, run period {:?})",
            self.ia_type(),
            startup_delay,
            run_period
        );
        Ok(())
    }

    /// Stops the reaper, letting a run in progress finish. No-op if it is
    /// not running.
    pub async fn stop(&self) {
        let reaper = self.reaper_slot().lock().await.take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
            info!("Binding reaper for {} stopped", self.ia_type());
        }
    }

    pub async fn is_running(&self) -> bool {
        self.reaper_slot().lock().await.is_some()
    }

    /// Runs one expiration pass now.
    ///
    /// A failing binding does not stop the pass; a failing store query ends
    /// it and leaves the batch to the next run.
    pub async fn expire_bindings(&self) -> ReapSummary {
        let ia_type = self.ia_type();
        let mut summary = ReapSummary::default();

        let expired = match self.store.find_expired(ia_type, Utc::now()).await {
            Ok(expired) => expired,
            Err(error) => {
                error!("Failed to query expired bindings of type {}: {}", ia_type, error);
                return summary;
            }
        };

        if expired.is_empty() {
            debug!("No expired bindings of type {}", ia_type);
            return summary;
        }

        info!(
            "Found {} identities with expired bindings of type {}",
            expired.len(),
            ia_type
        );

        for ia in &expired {
            for binding in &ia.addresses {
                summary.found += 1;
                match self.expire(ia, binding).await {
                    TransitionOutcome::Deleted | TransitionOutcome::Updated => summary.expired += 1,
                    TransitionOutcome::Skipped => summary.skipped += 1,
                    TransitionOutcome::Failed => summary.failed += 1,
                }
            }
        }

        info!(
            "Reaper run for {}: {} expired, {} skipped, {} failed",
            ia_type, summary.expired, summary.skipped, summary.failed
        );
        summary
    }
}
