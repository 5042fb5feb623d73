//! Campaign poller: periodic scan of the store for work.
//!
//! Each tick promotes due `scheduled` campaigns to `active`, then hands every
//! active campaign to the dispatch scheduler, oldest start time first.
//! Campaigns that already have a live job are skipped by the claim.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use wablast_core::error::WablastError;
use wablast_core::types::CampaignStatus;

use crate::dispatch::DispatchScheduler;
use crate::tracker::ProgressTracker;

pub struct CampaignPoller {
    scheduler: Arc<DispatchScheduler>,
    tracker: Arc<ProgressTracker>,
    interval: Duration,
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub promoted: usize,
    pub dispatched: usize,
    pub already_running: usize,
}

impl CampaignPoller {
    pub fn new(
        scheduler: Arc<DispatchScheduler>,
        tracker: Arc<ProgressTracker>,
        interval: Duration,
    ) -> Self {
        Self { scheduler, tracker, interval }
    }

    /// One scan. Store errors are logged and left for the next tick.
    pub async fn tick(&self) -> PollReport {
        let mut report = PollReport::default();
        let store = self.tracker.store();

        match store.list_due_scheduled(Utc::now()).await {
            Ok(due) => {
                for campaign in due {
                    match self
                        .tracker
                        .set_status(campaign.id, CampaignStatus::Active, None)
                        .await
                    {
                        Ok(()) => {
                            tracing::info!("📅 Campaign {} '{}' is due, activating", campaign.id, campaign.name);
                            report.promoted += 1;
                        }
                        Err(e) => tracing::warn!("⚠️ Could not activate campaign {}: {e}", campaign.id),
                    }
                }
            }
            Err(e) => tracing::warn!("⚠️ Poll: listing scheduled campaigns failed: {e}"),
        }

        let active = match store.list_active().await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!("⚠️ Poll: listing active campaigns failed: {e}");
                return report;
            }
        };

        for campaign in active {
            match self.scheduler.dispatch(campaign.id).await {
                Ok(()) => report.dispatched += 1,
                Err(WablastError::ClaimConflict(id)) => {
                    tracing::debug!("Campaign {id} already has a live job");
                    report.already_running += 1;
                }
                Err(e) => tracing::warn!("⚠️ Dispatch of campaign {} failed: {e}", campaign.id),
            }
        }

        if report.promoted + report.dispatched > 0 {
            tracing::debug!(
                "🔄 Poll: {} promoted, {} dispatched, {} running",
                report.promoted,
                report.dispatched,
                report.already_running
            );
        }
        report
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("⏰ Campaign poller started (every {:?})", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("⏰ Campaign poller stopped");
    }
}
