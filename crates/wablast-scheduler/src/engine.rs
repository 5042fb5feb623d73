//! Campaign engine: owns the job registry and the poll loop.
//!
//! `start()` spawns the poller; `stop()` halts it, closes the registry to
//! new claims, tells every live job to shut down, and drains them within
//! the configured grace period. Both are idempotent. Operator commands go through the store first and then nudge
//! the live job, so a UI writing the store directly gets the same result.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use wablast_core::config::WablastConfig;
use wablast_core::error::{Result, WablastError};
use wablast_core::traits::{CampaignStore, ConnectionDirectory, MessagingGateway};
use wablast_core::types::{CampaignId, CampaignStatus, ConnectionInstance};

use crate::dispatch::DispatchScheduler;
use crate::lanes::LaneStats;
use crate::poller::CampaignPoller;
use crate::registry::{Control, JobInfo, JobRegistry};
use crate::tracker::{ProgressEvent, ProgressTracker, STOPPED_REASON};

pub const PAUSED_REASON: &str = "paused by operator";

struct PollLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct CampaignEngine {
    config: WablastConfig,
    directory: Arc<dyn ConnectionDirectory>,
    registry: Arc<JobRegistry>,
    tracker: Arc<ProgressTracker>,
    scheduler: Arc<DispatchScheduler>,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl CampaignEngine {
    pub fn new(
        config: WablastConfig,
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn ConnectionDirectory>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let tracker = Arc::new(ProgressTracker::new(
            store,
            Duration::from_millis(config.engine.store_grace_ms),
            Duration::from_millis(config.engine.store_retry_ms),
        ));
        let scheduler = Arc::new(DispatchScheduler::new(
            &config,
            registry.clone(),
            tracker.clone(),
            directory.clone(),
            gateway,
        ));
        Self {
            config,
            directory,
            registry,
            tracker,
            scheduler,
            poll_loop: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut slot = self.poll_loop.lock().await;
        if slot.is_some() {
            tracing::debug!("Engine already running");
            return false;
        }
        self.registry.reopen().await;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let poller = CampaignPoller::new(
            self.scheduler.clone(),
            self.tracker.clone(),
            self.config.engine.poll_interval(),
        );
        let task = tokio::spawn(poller.run(shutdown_rx));
        *slot = Some(PollLoop { shutdown, task });
        tracing::info!("🚀 Campaign engine started");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.poll_loop.lock().await.is_some()
    }

    /// Stop polling and drain live jobs. Jobs still running after the
    /// shutdown grace are aborted; their campaigns stay `active`.
    pub async fn stop(&self) {
        if let Some(poll_loop) = self.poll_loop.lock().await.take() {
            let _ = poll_loop.shutdown.send(true);
            if let Err(e) = poll_loop.task.await {
                tracing::warn!("⚠️ Poll loop ended abnormally: {e}");
            }
        }

        self.registry.close().await;
        let grace = Duration::from_millis(self.config.engine.shutdown_grace_ms);
        let jobs = self.registry.signal_all(Control::Shutdown).await;
        if !jobs.is_empty() {
            tracing::info!("⏳ Draining {} dispatch job(s)", jobs.len());
            let aborts: Vec<_> = jobs.iter().map(|(id, h)| (*id, h.abort_handle())).collect();
            let drain = futures::future::join_all(jobs.into_iter().map(|(_, h)| h));
            if tokio::time::timeout(grace, drain).await.is_err() {
                for (id, abort) in aborts {
                    if !abort.is_finished() {
                        tracing::warn!("⚠️ Campaign {id} did not drain within {grace:?}, aborting");
                        abort.abort();
                    }
                }
            }
        }
        // Claims taken just before close may not have a handle yet.
        let stuck = self.registry.drain(grace).await;
        if stuck > 0 {
            tracing::warn!("⚠️ {stuck} claim(s) never released, dropping them");
        }
        tracing::info!("🛑 Campaign engine stopped");
    }

    /// Persist `paused`, then let the live job notice right away.
    pub async fn pause_campaign(&self, id: CampaignId) -> Result<()> {
        self.tracker
            .set_status(id, CampaignStatus::Paused, Some(PAUSED_REASON))
            .await?;
        self.registry.signal(id, Control::Pause).await;
        Ok(())
    }

    /// Persist `active` and wake the job, or dispatch one if none is live.
    ///
    /// `Run` goes out before the store write too: a job still settling a
    /// stop sees it and leaves the campaign alone instead of writing
    /// `paused` over the resume. While the engine is stopped the status is
    /// persisted and the next `start()` picks the campaign up.
    pub async fn resume_campaign(&self, id: CampaignId) -> Result<()> {
        self.registry.signal(id, Control::Run).await;
        self.tracker.set_status(id, CampaignStatus::Active, None).await?;
        if self.registry.signal(id, Control::Run).await {
            return Ok(());
        }
        match self.scheduler.dispatch(id).await {
            Ok(()) | Err(WablastError::ClaimConflict(_)) | Err(WablastError::EngineStopped(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Halt between contacts; the campaign ends up `paused` with a stop
    /// reason and can be re-activated later.
    pub async fn stop_campaign(&self, id: CampaignId) -> Result<()> {
        if self.registry.signal(id, Control::Stop).await {
            return Ok(());
        }
        self.tracker
            .set_status(id, CampaignStatus::Paused, Some(STOPPED_REASON))
            .await
    }

    /// Live progress events. Lagging subscribers silently miss events.
    pub fn progress_stream(&self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        BroadcastStream::new(self.tracker.subscribe()).filter_map(|event| event.ok())
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.registry.snapshot().await
    }

    pub async fn lane_stats(&self) -> Vec<LaneStats> {
        self.scheduler.lane_stats().await
    }

    pub async fn instance(&self, name: &str) -> Result<ConnectionInstance> {
        self.directory.fetch_instance(name).await
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }
}
