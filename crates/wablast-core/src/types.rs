//! Domain types: campaigns, contacts, media and connection instances.
//!
//! Statuses are closed enums; the lowercase string form only appears at the
//! storage and wire boundaries (`as_str` / `FromStr`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type CampaignId = i64;

/// Who a campaign addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignKind {
    #[default]
    Individual,
    Group,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Individual => "individual",
            CampaignKind::Group => "group",
        }
    }
}

impl FromStr for CampaignKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(CampaignKind::Individual),
            "group" => Ok(CampaignKind::Group),
            other => Err(format!("unknown campaign type '{other}'")),
        }
    }
}

/// Persisted campaign status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    /// No transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    /// Transitions only move forward, except `active ⇄ paused`.
    /// Re-setting the current status is always allowed.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Active)
                | (Scheduled, Active)
                | (Scheduled, Paused)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(format!("unknown campaign status '{other}'")),
        }
    }
}

/// One recipient of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Phone number (individual) or group JID (group).
    pub destination: String,
    #[serde(default)]
    pub name: String,
    /// Template variables, e.g. `tag` → `vip`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Contact {
    pub fn new(destination: &str, name: &str) -> Self {
        Self {
            destination: destination.to_string(),
            name: name.to_string(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    /// Normalized address for the gateway, or `None` if the destination
    /// can never be delivered to.
    pub fn address(&self, kind: CampaignKind) -> Option<String> {
        let raw = self.destination.trim();
        if raw.is_empty() {
            return None;
        }
        match kind {
            CampaignKind::Individual => {
                if raw.contains('@') {
                    return Some(raw.to_string());
                }
                let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
                (digits.len() >= 8).then_some(digits)
            }
            CampaignKind::Group => {
                if raw.ends_with("@g.us") {
                    Some(raw.to_string())
                } else if raw.chars().all(|c| c.is_ascii_digit() || c == '-') {
                    Some(format!("{raw}@g.us"))
                } else {
                    None
                }
            }
        }
    }
}

/// Media kind: drives both the gateway call and the pacing base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Text,
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Text => "text",
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }
}

/// Media attached to a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub media_type: MediaType,
    /// `http(s)://` URL, or a local file path read at send time.
    pub source: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl MediaPayload {
    pub fn is_remote(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }
}

/// A campaign as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub kind: CampaignKind,
    pub status: CampaignStatus,
    /// Instance name the campaign sends through.
    pub instance: String,
    /// Text body, or media caption when `media` is set.
    pub message: String,
    pub media: Option<MediaPayload>,
    pub contacts: Vec<Contact>,
    pub total_contacts: u32,
    pub sent_messages: u32,
    /// Contacts attempted but permanently rejected.
    pub failed_messages: u32,
    /// Configured pause between two sends.
    pub interval_ms: u64,
    pub start_time: DateTime<Utc>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Contacts already processed (sent or permanently rejected).
    pub fn processed(&self) -> u32 {
        self.sent_messages + self.failed_messages
    }

    pub fn summary(&self) -> CampaignSummary {
        CampaignSummary {
            id: self.id,
            name: self.name.clone(),
            instance: self.instance.clone(),
            status: self.status,
            total_contacts: self.total_contacts,
            sent_messages: self.sent_messages,
            failed_messages: self.failed_messages,
            start_time: self.start_time,
        }
    }
}

/// Input for creating a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub kind: CampaignKind,
    pub instance: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub media: Option<MediaPayload>,
    pub contacts: Vec<Contact>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: CampaignStatus,
}

fn default_interval_ms() -> u64 { 3000 }

/// Lightweight listing row: what the poller works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: CampaignId,
    pub name: String,
    pub instance: String,
    pub status: CampaignStatus,
    pub total_contacts: u32,
    pub sent_messages: u32,
    pub failed_messages: u32,
    pub start_time: DateTime<Utc>,
}

/// Live state of a WhatsApp session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Open,
    Close,
    Connecting,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Open => "open",
            ConnectionStatus::Close => "close",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Open)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "connected" => Ok(ConnectionStatus::Open),
            "close" | "closed" => Ok(ConnectionStatus::Close),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "error" => Ok(ConnectionStatus::Error),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(format!("unknown connection status '{other}'")),
        }
    }
}

/// A connection instance as reported by the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInstance {
    pub name: String,
    pub connection_status: ConnectionStatus,
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub contacts: u64,
    #[serde(default)]
    pub chats: u64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Whether a failed send may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendErrorKind {
    /// Network, timeout, 5xx or rate limiting.
    Transient,
    /// Bad destination or payload rejected.
    Permanent,
}

/// Failure returned by a messaging gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: SendErrorKind::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: SendErrorKind::Permanent, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == SendErrorKind::Transient
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SendErrorKind::Transient => "transient",
            SendErrorKind::Permanent => "permanent",
        };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use CampaignStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Draft));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_string_roundtrip_for_storage() {
        for s in ["draft", "scheduled", "active", "paused", "completed", "failed"] {
            let status: CampaignStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("running".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn test_individual_address_strips_formatting() {
        let c = Contact::new("+55 (11) 98765-4321", "Ana");
        assert_eq!(c.address(CampaignKind::Individual).as_deref(), Some("5511987654321"));
        assert_eq!(Contact::new("123", "x").address(CampaignKind::Individual), None);
        assert_eq!(Contact::new("  ", "x").address(CampaignKind::Individual), None);
    }

    #[test]
    fn test_group_address() {
        let c = Contact::new("120363025-1234", "Group");
        assert_eq!(c.address(CampaignKind::Group).as_deref(), Some("120363025-1234@g.us"));
        let jid = Contact::new("120363025@g.us", "Group");
        assert_eq!(jid.address(CampaignKind::Group).as_deref(), Some("120363025@g.us"));
        assert_eq!(Contact::new("not a group", "x").address(CampaignKind::Group), None);
    }

    #[test]
    fn test_connection_status_parse() {
        assert_eq!("OPEN".parse::<ConnectionStatus>().unwrap(), ConnectionStatus::Open);
        assert_eq!("close".parse::<ConnectionStatus>().unwrap(), ConnectionStatus::Close);
        assert!(!ConnectionStatus::Connecting.is_open());
    }

    #[test]
    fn test_send_error_retryable() {
        assert!(SendError::transient("timeout").is_retryable());
        assert!(!SendError::permanent("bad number").is_retryable());
    }
}
