//! Live dispatch jobs, keyed by campaign id.
//!
//! A claim is the only way to start a job, and a campaign can hold at most
//! one claim at a time. Each claim carries a fresh token so a finished job
//! can only release its own entry, never a successor's.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use wablast_core::error::{Result, WablastError};
use wablast_core::types::CampaignId;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Command delivered to a running job; observed between contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
    /// Process shutdown: leave the campaign `active` for the next run.
    Shutdown,
}

/// In-memory job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Claimed,
    Sending,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => JobState::Claimed,
            2 => JobState::Sending,
            3 => JobState::Paused,
            4 => JobState::Completed,
            5 => JobState::Failed,
            6 => JobState::Stopped,
            _ => JobState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JobState::Idle => 0,
            JobState::Claimed => 1,
            JobState::Sending => 2,
            JobState::Paused => 3,
            JobState::Completed => 4,
            JobState::Failed => 5,
            JobState::Stopped => 6,
        }
    }
}

/// Shared, lock-free view of a job's state.
#[derive(Debug, Clone)]
pub struct JobStateCell(Arc<AtomicU8>);

impl JobStateCell {
    fn new(state: JobState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> JobState {
        JobState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: JobState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Proof of ownership handed to the job that won the claim.
#[derive(Debug)]
pub struct Claim {
    pub campaign_id: CampaignId,
    pub token: Uuid,
    pub control: watch::Receiver<Control>,
    pub state: JobStateCell,
}

struct JobEntry {
    token: Uuid,
    control: watch::Sender<Control>,
    state: JobStateCell,
    handle: Option<JoinHandle<()>>,
}

/// Snapshot row for one live job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub campaign_id: CampaignId,
    pub token: String,
    pub state: JobState,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<CampaignId, JobEntry>>,
    /// Set while the engine is stopped; claims are refused.
    closed: AtomicBool,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a campaign. Fails with `ClaimConflict` if a job already owns it
    /// and with `EngineStopped` while the registry is closed.
    pub async fn claim(&self, campaign_id: CampaignId) -> Result<Claim> {
        let mut jobs = self.jobs.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(WablastError::EngineStopped(campaign_id));
        }
        if jobs.contains_key(&campaign_id) {
            return Err(WablastError::ClaimConflict(campaign_id));
        }
        let token = Uuid::new_v4();
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let state = JobStateCell::new(JobState::Claimed);
        jobs.insert(
            campaign_id,
            JobEntry { token, control: control_tx, state: state.clone(), handle: None },
        );
        tracing::debug!("🔒 Campaign {campaign_id} claimed ({token})");
        Ok(Claim { campaign_id, token, control: control_rx, state })
    }

    /// Attach the spawned task to its claim.
    pub async fn attach(&self, campaign_id: CampaignId, token: Uuid, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().await;
        // Missing entry: the job already finished and released itself.
        if let Some(entry) = jobs.get_mut(&campaign_id)
            && entry.token == token
        {
            entry.handle = Some(handle);
        }
    }

    /// Drop the claim if `token` still owns it.
    pub async fn release(&self, campaign_id: CampaignId, token: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(&campaign_id).is_some_and(|e| e.token == token) {
            jobs.remove(&campaign_id);
            tracing::debug!("🔓 Campaign {campaign_id} released ({token})");
            true
        } else {
            false
        }
    }

    /// Release the claim after running `settle` with the last command sent to
    /// the job. The registry stays locked throughout, so a concurrent
    /// `signal` either lands before `settle` sees it or finds no job.
    pub async fn release_with<F, Fut>(&self, campaign_id: CampaignId, token: Uuid, settle: F) -> bool
    where
        F: FnOnce(Control) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut jobs = self.jobs.lock().await;
        let last = match jobs.get(&campaign_id) {
            Some(entry) if entry.token == token => *entry.control.borrow(),
            _ => return false,
        };
        settle(last).await;
        jobs.remove(&campaign_id);
        tracing::debug!("🔓 Campaign {campaign_id} released ({token})");
        true
    }

    /// Send a control command to a live job. Returns false if none is running.
    pub async fn signal(&self, campaign_id: CampaignId, control: Control) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(&campaign_id) {
            Some(entry) => entry.control.send(control).is_ok(),
            None => false,
        }
    }

    /// Send `control` to every job and take their task handles for draining.
    pub async fn signal_all(&self, control: Control) -> Vec<(CampaignId, JoinHandle<()>)> {
        let mut jobs = self.jobs.lock().await;
        let mut handles = Vec::new();
        for (id, entry) in jobs.iter_mut() {
            let _ = entry.control.send(control);
            if let Some(handle) = entry.handle.take() {
                handles.push((*id, handle));
            }
        }
        handles
    }

    pub async fn is_claimed(&self, campaign_id: CampaignId) -> bool {
        self.jobs.lock().await.contains_key(&campaign_id)
    }

    pub async fn state(&self, campaign_id: CampaignId) -> Option<JobState> {
        self.jobs.lock().await.get(&campaign_id).map(|e| e.state.get())
    }

    pub async fn snapshot(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, e)| JobInfo { campaign_id: *id, token: e.token.to_string(), state: e.state.get() })
            .collect();
        out.sort_by_key(|j| j.campaign_id);
        out
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Refuse new claims. Entries already claimed stay until released.
    pub async fn close(&self) {
        let _jobs = self.jobs.lock().await;
        self.closed.store(true, Ordering::Release);
    }

    pub async fn reopen(&self) {
        let _jobs = self.jobs.lock().await;
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for every job to release its claim, up to `grace`. Entries still
    /// present afterwards are forgotten; returns how many.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut jobs = self.jobs.lock().await;
            if jobs.is_empty() {
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                let left = jobs.len();
                jobs.clear();
                return left;
            }
            drop(jobs);
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_claim_conflicts() {
        let reg = JobRegistry::new();
        let claim = reg.claim(7).await.unwrap();
        assert!(matches!(reg.claim(7).await, Err(WablastError::ClaimConflict(7))));
        assert!(reg.release(7, claim.token).await);
        assert!(reg.claim(7).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let reg = Arc::new(JobRegistry::new());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.claim(1).await.is_ok() })
            })
            .collect();
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(reg.job_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_successor() {
        let reg = JobRegistry::new();
        let old = reg.claim(3).await.unwrap();
        assert!(reg.release(3, old.token).await);
        let _new = reg.claim(3).await.unwrap();
        assert!(!reg.release(3, old.token).await);
        assert!(reg.is_claimed(3).await);
    }

    #[tokio::test]
    async fn test_signal_reaches_job() {
        let reg = JobRegistry::new();
        let mut claim = reg.claim(9).await.unwrap();
        assert!(reg.signal(9, Control::Pause).await);
        claim.control.changed().await.unwrap();
        assert_eq!(*claim.control.borrow(), Control::Pause);
        assert!(!reg.signal(10, Control::Pause).await);
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_claims() {
        let reg = JobRegistry::new();
        let held = reg.claim(5).await.unwrap();
        reg.close().await;
        assert!(reg.is_closed());
        assert!(matches!(reg.claim(6).await, Err(WablastError::EngineStopped(6))));
        // Existing claims keep working until released.
        assert!(reg.signal(5, Control::Shutdown).await);
        assert!(reg.release(5, held.token).await);

        reg.reopen().await;
        assert!(reg.claim(6).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_unattached_claim() {
        let reg = Arc::new(JobRegistry::new());
        // Claimed but never attached: signal_all has no handle to drain.
        let claim = reg.claim(8).await.unwrap();
        assert!(reg.signal_all(Control::Shutdown).await.is_empty());

        let releaser = {
            let reg = reg.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                reg.release(8, claim.token).await
            })
        };
        assert_eq!(reg.drain(Duration::from_secs(2)).await, 0);
        assert!(releaser.await.unwrap());
        assert_eq!(reg.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_forgets_stuck_claims_after_grace() {
        let reg = JobRegistry::new();
        let _claim = reg.claim(2).await.unwrap();
        assert_eq!(reg.drain(Duration::from_millis(30)).await, 1);
        assert!(!reg.is_claimed(2).await);
    }

    #[tokio::test]
    async fn test_release_with_sees_signal_sent_before_it() {
        let reg = JobRegistry::new();
        let claim = reg.claim(11).await.unwrap();
        reg.signal(11, Control::Stop).await;
        reg.signal(11, Control::Run).await;

        let mut seen = None;
        assert!(reg.release_with(11, claim.token, |last| {
            seen = Some(last);
            async {}
        }).await);
        assert_eq!(seen, Some(Control::Run));
        // Released: a later signal finds no job.
        assert!(!reg.signal(11, Control::Run).await);
    }

    #[tokio::test]
    async fn test_release_with_ignores_stale_token() {
        let reg = JobRegistry::new();
        let old = reg.claim(12).await.unwrap();
        assert!(reg.release(12, old.token).await);
        let _new = reg.claim(12).await.unwrap();
        let mut ran = false;
        assert!(!reg.release_with(12, old.token, |_| {
            ran = true;
            async {}
        }).await);
        assert!(!ran);
        assert!(reg.is_claimed(12).await);
    }

    #[tokio::test]
    async fn test_state_cell_shared() {
        let reg = JobRegistry::new();
        let claim = reg.claim(4).await.unwrap();
        assert_eq!(reg.state(4).await, Some(JobState::Claimed));
        claim.state.set(JobState::Sending);
        assert_eq!(reg.state(4).await, Some(JobState::Sending));
    }
}
