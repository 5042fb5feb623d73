//! Collaborator contracts the engine is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Campaign, CampaignId, CampaignStatus, CampaignSummary, ConnectionInstance, ConnectionStatus,
    MediaPayload, SendError,
};

/// Persistent campaign records. Counters only move through the increment
/// operations; status only through `set_status`.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Campaigns in `active`, oldest `start_time` first.
    async fn list_active(&self) -> Result<Vec<CampaignSummary>>;

    /// `scheduled` campaigns whose start time has passed.
    async fn list_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<CampaignSummary>>;

    /// Full record, including contacts and media.
    async fn get_campaign(&self, id: CampaignId) -> Result<Campaign>;

    /// Current status only; re-read by running jobs between contacts.
    async fn campaign_status(&self, id: CampaignId) -> Result<CampaignStatus> {
        Ok(self.get_campaign(id).await?.status)
    }

    /// Atomically bump `sent_messages`; returns the new value.
    async fn increment_sent(&self, id: CampaignId) -> Result<u32>;

    /// Atomically bump `failed_messages`; returns the new value.
    async fn increment_failed(&self, id: CampaignId) -> Result<u32>;

    /// Validated status transition.
    async fn set_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        reason: Option<&str>,
    ) -> Result<()>;
}

/// Where instance liveness comes from.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn get_status(&self, instance: &str) -> Result<ConnectionStatus>;

    /// Full instance record with counters.
    async fn fetch_instance(&self, instance: &str) -> Result<ConnectionInstance> {
        let connection_status = self.get_status(instance).await?;
        Ok(ConnectionInstance {
            name: instance.to_string(),
            connection_status,
            messages: 0,
            contacts: 0,
            chats: 0,
            last_activity: None,
        })
    }
}

/// Outbound message delivery by instance name.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Returns the provider's message id.
    async fn send_text(
        &self,
        instance: &str,
        destination: &str,
        text: &str,
    ) -> std::result::Result<String, SendError>;

    async fn send_media(
        &self,
        instance: &str,
        destination: &str,
        media: &MediaPayload,
        caption: &str,
    ) -> std::result::Result<String, SendError>;
}
