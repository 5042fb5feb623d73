//! Error types for Wablast.

use thiserror::Error;

use crate::types::{CampaignStatus, ConnectionStatus};

pub type Result<T> = std::result::Result<T, WablastError>;

#[derive(Debug, Error)]
pub enum WablastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Campaign {0} not found")]
    NotFound(i64),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Campaign {0} is already claimed by a running job")]
    ClaimConflict(i64),

    #[error("Engine is stopping, campaign {0} not dispatched")]
    EngineStopped(i64),

    #[error("instance unavailable: '{instance}' is {status}")]
    InstanceUnavailable {
        instance: String,
        status: ConnectionStatus,
    },

    #[error("Sent counter for campaign {0} is already at total_contacts")]
    CounterExhausted(i64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
