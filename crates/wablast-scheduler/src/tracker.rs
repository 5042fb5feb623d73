//! Progress tracker: the only writer of campaign counters and terminal status.
//!
//! Store writes that fail with `Store`/`StoreUnavailable` are retried for a
//! grace period before the tracker gives up with `StoreUnavailable`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use wablast_core::error::{Result, WablastError};
use wablast_core::traits::CampaignStore;
use wablast_core::types::{CampaignId, CampaignStatus};

/// Published after every persisted change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Sent {
        campaign_id: CampaignId,
        sent_messages: u32,
        total_contacts: u32,
    },
    Skipped {
        campaign_id: CampaignId,
        failed_messages: u32,
        destination: String,
        reason: String,
    },
    StatusChanged {
        campaign_id: CampaignId,
        status: CampaignStatus,
        reason: Option<String>,
    },
}

/// How a dispatch job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every contact processed.
    Completed,
    /// Instance unavailable, retries exhausted, or store gone.
    Failed(String),
    /// Operator stop; re-activatable.
    Stopped,
    /// The persisted status moved on without us (e.g. deleted, edited).
    Superseded,
    /// Process shutdown; status stays `active` so the next run resumes.
    Interrupted,
}

pub const STOPPED_REASON: &str = "stopped by operator";

pub struct ProgressTracker {
    store: Arc<dyn CampaignStore>,
    grace: Duration,
    retry_every: Duration,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn CampaignStore>, grace: Duration, retry_every: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, grace, retry_every, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    /// Count one confirmed send. Returns the new `sent_messages`.
    pub async fn record_sent(&self, id: CampaignId, total_contacts: u32) -> Result<u32> {
        let sent = self
            .with_grace("record sent", || self.store.increment_sent(id))
            .await?;
        self.publish(ProgressEvent::Sent { campaign_id: id, sent_messages: sent, total_contacts });
        Ok(sent)
    }

    /// Count one contact that was attempted but permanently rejected.
    pub async fn record_failed(&self, id: CampaignId, destination: &str, reason: &str) -> Result<u32> {
        let failed = self
            .with_grace("record failed", || self.store.increment_failed(id))
            .await?;
        self.publish(ProgressEvent::Skipped {
            campaign_id: id,
            failed_messages: failed,
            destination: destination.to_string(),
            reason: reason.to_string(),
        });
        Ok(failed)
    }

    /// Persist the status change a job outcome implies, if any.
    pub async fn finalize(&self, id: CampaignId, outcome: &JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Completed => self.set_status(id, CampaignStatus::Completed, None).await,
            JobOutcome::Failed(reason) => {
                self.set_status(id, CampaignStatus::Failed, Some(reason)).await
            }
            JobOutcome::Stopped => {
                self.set_status(id, CampaignStatus::Paused, Some(STOPPED_REASON)).await
            }
            JobOutcome::Superseded | JobOutcome::Interrupted => Ok(()),
        }
    }

    pub async fn set_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.with_grace("set status", || self.store.set_status(id, status, reason))
            .await?;
        self.publish(ProgressEvent::StatusChanged {
            campaign_id: id,
            status,
            reason: reason.map(str::to_string),
        });
        Ok(())
    }

    async fn with_grace<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(WablastError::Store(e) | WablastError::StoreUnavailable(e)) => {
                    if started.elapsed() >= self.grace {
                        tracing::error!("🛑 {what}: store still failing after {:?}: {e}", self.grace);
                        return Err(WablastError::StoreUnavailable(e));
                    }
                    tracing::warn!("⚠️ {what}: store error, retrying: {e}");
                    tokio::time::sleep(self.retry_every).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::CampaignDb;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use wablast_core::types::{Campaign, CampaignKind, CampaignSummary, Contact, NewCampaign};

    fn seed(db: &CampaignDb, contacts: usize) -> CampaignId {
        db.insert_campaign(&NewCampaign {
            name: "t".into(),
            kind: CampaignKind::Individual,
            instance: "sales".into(),
            message: "hi".into(),
            media: None,
            contacts: (0..contacts).map(|i| Contact::new(&format!("551199990{i:04}"), "x")).collect(),
            interval_ms: 0,
            start_time: None,
            status: CampaignStatus::Active,
        })
        .unwrap()
    }

    fn tracker(store: Arc<dyn CampaignStore>) -> ProgressTracker {
        ProgressTracker::new(store, Duration::from_millis(50), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_record_and_events() {
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let id = seed(&db, 3);
        let t = tracker(db.clone());
        let mut rx = t.subscribe();

        assert_eq!(t.record_sent(id, 3).await.unwrap(), 1);
        assert_eq!(t.record_failed(id, "551199990001", "bad number").await.unwrap(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::Sent { campaign_id: id, sent_messages: 1, total_contacts: 3 }
        );
        assert!(matches!(rx.recv().await.unwrap(), ProgressEvent::Skipped { failed_messages: 1, .. }));
    }

    #[tokio::test]
    async fn test_finalize_outcomes() {
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let t = tracker(db.clone());

        let a = seed(&db, 1);
        t.finalize(a, &JobOutcome::Stopped).await.unwrap();
        let c = db.get(a).unwrap();
        assert_eq!(c.status, CampaignStatus::Paused);
        assert_eq!(c.status_reason.as_deref(), Some(STOPPED_REASON));

        let b = seed(&db, 1);
        t.finalize(b, &JobOutcome::Failed("instance unavailable".into())).await.unwrap();
        assert_eq!(db.get(b).unwrap().status, CampaignStatus::Failed);

        let c_id = seed(&db, 1);
        t.finalize(c_id, &JobOutcome::Interrupted).await.unwrap();
        assert_eq!(db.get(c_id).unwrap().status, CampaignStatus::Active);

        t.finalize(c_id, &JobOutcome::Completed).await.unwrap();
        assert_eq!(db.get(c_id).unwrap().status, CampaignStatus::Completed);
    }

    /// Fails the first `fail_first` increments with a store error.
    struct FlakyStore {
        inner: CampaignDb,
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CampaignStore for FlakyStore {
        async fn list_active(&self) -> Result<Vec<CampaignSummary>> {
            self.inner.list_active().await
        }
        async fn list_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<CampaignSummary>> {
            self.inner.list_due_scheduled(now).await
        }
        async fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
            self.inner.get_campaign(id).await
        }
        async fn increment_sent(&self, id: CampaignId) -> Result<u32> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(WablastError::StoreUnavailable("database is locked".into()));
            }
            self.inner.increment_sent(id).await
        }
        async fn increment_failed(&self, id: CampaignId) -> Result<u32> {
            self.inner.increment_failed(id).await
        }
        async fn set_status(
            &self,
            id: CampaignId,
            status: CampaignStatus,
            reason: Option<&str>,
        ) -> Result<()> {
            self.inner.set_status(id, status, reason).await
        }
    }

    #[tokio::test]
    async fn test_store_errors_retried_within_grace() {
        let inner = CampaignDb::open_in_memory().unwrap();
        let id = seed(&inner, 2);
        let store = Arc::new(FlakyStore { inner, fail_first: 2, calls: AtomicU32::new(0) });
        let t = tracker(store.clone());
        assert_eq!(t.record_sent(id, 2).await.unwrap(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_unavailable_after_grace() {
        let inner = CampaignDb::open_in_memory().unwrap();
        let id = seed(&inner, 2);
        let store = Arc::new(FlakyStore { inner, fail_first: u32::MAX, calls: AtomicU32::new(0) });
        let t = tracker(store);
        let err = t.record_sent(id, 2).await.unwrap_err();
        assert!(matches!(err, WablastError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_non_store_errors_not_retried() {
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let t = tracker(db);
        let err = t.record_sent(404, 1).await.unwrap_err();
        assert!(matches!(err, WablastError::NotFound(404)));
    }
}
