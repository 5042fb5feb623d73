//! # Wablast Scheduler
//!
//! Campaign execution engine: finds active campaigns, sends one message per
//! contact through the bound WhatsApp instance, and records progress.
//!
//! ## Design Principles
//! - The store is the source of truth: counters, status, cursor
//! - One tokio task per live campaign, one claim per campaign
//! - Counters move only after the gateway confirmed a send
//! - SQLite persistence survives restarts; a restart resumes where it stopped
//!
//! ## Architecture
//! ```text
//! CampaignEngine
//!   ├── CampaignPoller (tokio interval)
//!   │     ├── scheduled + due → active
//!   │     └── active → DispatchScheduler::dispatch (claim or skip)
//!   └── DispatchScheduler
//!         └── job per campaign
//!               ├── checkpoint: control signal + persisted status
//!               ├── ConnectionDirectory: instance must be open
//!               ├── InstanceLanes → SendExecutor → MessagingGateway
//!               ├── ProgressTracker → CampaignStore (+ progress events)
//!               └── PacingPolicy delay (interruptible)
//! ```

pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod lanes;
pub mod pacing;
pub mod persistence;
pub mod poller;
pub mod registry;
pub mod template;
pub mod tracker;

pub use dispatch::{DispatchJob, DispatchScheduler};
pub use engine::CampaignEngine;
pub use executor::{SendExecutor, SendOutcome, SendReport, SendRequest};
pub use lanes::{InstanceLanes, LaneStats};
pub use pacing::PacingPolicy;
pub use persistence::CampaignDb;
pub use poller::{CampaignPoller, PollReport};
pub use registry::{Control, JobInfo, JobRegistry, JobState};
pub use tracker::{JobOutcome, ProgressEvent, ProgressTracker};
