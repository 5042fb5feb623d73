//! Dispatch scheduler: runs one job per claimed campaign.
//!
//! A job walks the contact list from its persisted cursor
//! (`sent_messages + failed_messages`), one contact at a time:
//! checkpoint, take the instance lane, check the instance, send, record,
//! pace. Counters only advance after the gateway answered.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use wablast_core::config::{DispatchConfig, WablastConfig};
use wablast_core::error::{Result, WablastError};
use wablast_core::traits::{ConnectionDirectory, MessagingGateway};
use wablast_core::types::{Campaign, CampaignId, CampaignStatus, Contact, MediaType};

use crate::executor::{SendExecutor, SendOutcome, SendRequest};
use crate::lanes::{InstanceLanes, LaneStats};
use crate::pacing::PacingPolicy;
use crate::registry::{Claim, Control, JobRegistry, JobState};
use crate::tracker::{JobOutcome, ProgressTracker};

/// A campaign plus the index of the next contact to message.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    campaign: Campaign,
    cursor: usize,
}

impl DispatchJob {
    /// Resume point is whatever the store already counted.
    pub fn new(campaign: Campaign) -> Self {
        let cursor = campaign.processed() as usize;
        Self { campaign, cursor }
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn limit(&self) -> usize {
        (self.campaign.total_contacts as usize).min(self.campaign.contacts.len())
    }

    pub fn current(&self) -> Option<&Contact> {
        if self.is_done() {
            None
        } else {
            self.campaign.contacts.get(self.cursor)
        }
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.limit()
    }
}

pub struct DispatchScheduler {
    registry: Arc<JobRegistry>,
    tracker: Arc<ProgressTracker>,
    directory: Arc<dyn ConnectionDirectory>,
    executor: SendExecutor,
    pacing: PacingPolicy,
    lanes: InstanceLanes,
    policy: DispatchConfig,
    /// How often a paused job re-reads its persisted status.
    recheck_every: Duration,
}

impl DispatchScheduler {
    pub fn new(
        config: &WablastConfig,
        registry: Arc<JobRegistry>,
        tracker: Arc<ProgressTracker>,
        directory: Arc<dyn ConnectionDirectory>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            registry,
            tracker,
            directory,
            executor: SendExecutor::new(gateway, config.dispatch.clone()),
            pacing: PacingPolicy::new(config.pacing.clone()),
            lanes: InstanceLanes::new(config.dispatch.instance_rate_limit_capacity),
            policy: config.dispatch.clone(),
            recheck_every: config.engine.poll_interval(),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn lane_stats(&self) -> Vec<LaneStats> {
        self.lanes.stats().await
    }

    /// Claim `campaign_id` and spawn its job.
    ///
    /// Fails with `ClaimConflict` when a job for the campaign is already live.
    pub async fn dispatch(self: &Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let claim = self.registry.claim(campaign_id).await?;
        let token = claim.token;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_job(claim).await });
        self.registry.attach(campaign_id, token, handle).await;
        Ok(())
    }

    async fn run_job(self: Arc<Self>, mut claim: Claim) {
        let id = claim.campaign_id;
        let outcome = self.drive(&mut claim).await;

        match &outcome {
            JobOutcome::Completed => {
                claim.state.set(JobState::Completed);
                tracing::info!("✅ Campaign {id} completed");
            }
            JobOutcome::Failed(reason) => {
                claim.state.set(JobState::Failed);
                tracing::error!("❌ Campaign {id} failed: {reason}");
            }
            JobOutcome::Stopped => {
                claim.state.set(JobState::Stopped);
                tracing::info!("⏹️ Campaign {id} stopped");
            }
            JobOutcome::Superseded => {
                claim.state.set(JobState::Idle);
                tracing::debug!("Campaign {id} no longer active, job exits");
            }
            JobOutcome::Interrupted => {
                claim.state.set(JobState::Idle);
                tracing::info!("🛑 Campaign {id} interrupted, will resume on next start");
            }
        }

        if outcome != JobOutcome::Stopped {
            if let Err(e) = self.tracker.finalize(id, &outcome).await {
                tracing::error!("Campaign {id}: failed to persist outcome {outcome:?}: {e}");
            }
            self.registry.release(id, claim.token).await;
            return;
        }

        // A resume that raced the stop leaves `Run` as the last command.
        let tracker = self.tracker.clone();
        self.registry
            .release_with(id, claim.token, |last| async move {
                if last == Control::Run {
                    tracing::info!("▶️ Campaign {id} resumed while stopping, leaving it active");
                    return;
                }
                if let Err(e) = tracker.finalize(id, &JobOutcome::Stopped).await {
                    tracing::error!("Campaign {id}: failed to persist stop: {e}");
                }
            })
            .await;
    }

    async fn drive(&self, claim: &mut Claim) -> JobOutcome {
        let id = claim.campaign_id;
        let campaign = match self.tracker.store().get_campaign(id).await {
            Ok(c) => c,
            Err(WablastError::NotFound(_)) => return JobOutcome::Superseded,
            Err(e) => {
                tracing::warn!("⚠️ Campaign {id}: load failed, leaving it for the next poll: {e}");
                return JobOutcome::Interrupted;
            }
        };
        if campaign.status != CampaignStatus::Active {
            return JobOutcome::Superseded;
        }

        let mut job = DispatchJob::new(campaign);
        claim.state.set(JobState::Sending);
        tracing::info!(
            "🚀 Campaign {} '{}' on '{}' starting at contact {}/{}",
            id,
            job.campaign.name,
            job.campaign.instance,
            job.cursor + 1,
            job.campaign.total_contacts
        );

        loop {
            if let Some(outcome) = self.checkpoint(claim).await {
                return outcome;
            }
            let Some(contact) = job.current() else {
                return JobOutcome::Completed;
            };
            let campaign = &job.campaign;

            let report = {
                let _permit = self.lanes.acquire(&campaign.instance).await;
                if let Err(outcome) = self.ensure_instance_open(&campaign.instance).await {
                    return outcome;
                }
                self.executor
                    .execute(SendRequest {
                        instance: &campaign.instance,
                        kind: campaign.kind,
                        contact,
                        template: &campaign.message,
                        media: campaign.media.as_ref(),
                    })
                    .await
            };

            let recorded = match report.outcome {
                SendOutcome::Sent { message_id } => {
                    tracing::debug!("📤 Campaign {id} → {} ({message_id})", contact.destination);
                    self.tracker.record_sent(id, campaign.total_contacts).await
                }
                SendOutcome::SkippedPermanent { reason } => {
                    self.tracker.record_failed(id, &contact.destination, &reason).await
                }
                SendOutcome::SkippedTransient { reason } => {
                    return JobOutcome::Failed(format!("send failed after retries: {reason}"));
                }
            };
            match recorded {
                Ok(_) => {}
                Err(WablastError::CounterExhausted(_)) => return JobOutcome::Completed,
                Err(WablastError::NotFound(_)) => return JobOutcome::Superseded,
                Err(e) => return JobOutcome::Failed(format!("progress not recorded: {e}")),
            }

            job.advance();
            if job.is_done() {
                return JobOutcome::Completed;
            }
            if let Some(outcome) = self.pace(claim, &job.campaign).await {
                return outcome;
            }
        }
    }

    /// Observe control commands and the persisted status before each contact.
    /// Blocks while the campaign is paused.
    async fn checkpoint(&self, claim: &mut Claim) -> Option<JobOutcome> {
        let id = claim.campaign_id;
        loop {
            let control = *claim.control.borrow_and_update();
            match control {
                Control::Shutdown => return Some(JobOutcome::Interrupted),
                Control::Stop => return Some(JobOutcome::Stopped),
                Control::Run | Control::Pause => {}
            }

            let status = match self.tracker.store().campaign_status(id).await {
                Ok(status) => status,
                Err(WablastError::NotFound(_)) => return Some(JobOutcome::Superseded),
                Err(e) => {
                    tracing::warn!("⚠️ Campaign {id}: status check failed, continuing: {e}");
                    return None;
                }
            };

            match status {
                CampaignStatus::Active => {
                    if claim.state.get() == JobState::Paused {
                        tracing::info!("▶️ Campaign {id} resumed");
                    }
                    claim.state.set(JobState::Sending);
                    return None;
                }
                CampaignStatus::Paused => {
                    if claim.state.get() != JobState::Paused {
                        claim.state.set(JobState::Paused);
                        tracing::info!("⏸️ Campaign {id} paused");
                    }
                    tokio::select! {
                        changed = claim.control.changed() => {
                            if changed.is_err() {
                                return Some(JobOutcome::Interrupted);
                            }
                        }
                        _ = tokio::time::sleep(self.recheck_every) => {}
                    }
                }
                _ => return Some(JobOutcome::Superseded),
            }
        }
    }

    /// Instance must report `open` before each send. Lookup errors are retried
    /// with the dispatch backoff; a definite non-open status is not.
    async fn ensure_instance_open(&self, instance: &str) -> std::result::Result<(), JobOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let lookup =
                tokio::time::timeout(self.policy.request_timeout(), self.directory.get_status(instance))
                    .await
                    .unwrap_or_else(|_| Err(WablastError::Gateway("status lookup timed out".into())));

            match lookup {
                Ok(status) if status.is_open() => return Ok(()),
                Ok(status) => {
                    let unavailable = WablastError::InstanceUnavailable {
                        instance: instance.to_string(),
                        status,
                    };
                    return Err(JobOutcome::Failed(unavailable.to_string()));
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(JobOutcome::Failed(format!(
                        "instance unavailable: '{instance}' status unknown: {e}"
                    )));
                }
                Err(e) => {
                    let delay = self.policy.backoff_for(attempt);
                    tracing::warn!("⚠️ Instance '{instance}' status lookup failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sleep the pacing delay. Any command other than `Run` cuts it short and
    /// hands over to the next checkpoint.
    async fn pace(&self, claim: &mut Claim, campaign: &Campaign) -> Option<JobOutcome> {
        let (media_type, size) = campaign
            .media
            .as_ref()
            .map(|m| (m.media_type, m.size_bytes))
            .unwrap_or((MediaType::Text, 0));
        let mut delay = self.pacing.delay(media_type, size, campaign.interval_ms);
        let jitter = self.pacing.jitter_ms();
        if jitter > 0 {
            let extra = rand::thread_rng().gen_range(0..=jitter);
            delay += Duration::from_millis(extra);
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                changed = claim.control.changed() => {
                    if changed.is_err() {
                        return Some(JobOutcome::Interrupted);
                    }
                    if *claim.control.borrow() != Control::Run {
                        return None;
                    }
                }
            }
        }
    }
}
