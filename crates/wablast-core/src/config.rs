//! Wablast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WablastError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WablastConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl WablastConfig {
    /// Load config from the default path (~/.wablast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WablastError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WablastError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| WablastError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `WABLAST_GATEWAY_URL` / `WABLAST_GATEWAY_API_KEY` win over the file.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("WABLAST_GATEWAY_URL")
            && !url.is_empty()
        {
            self.gateway.base_url = url;
        }
        if let Ok(key) = std::env::var("WABLAST_GATEWAY_API_KEY")
            && !key.is_empty()
        {
            self.gateway.api_key = key;
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Wablast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wablast")
    }
}

/// Engine lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the poller looks for active campaigns.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long `stop()` waits for jobs before abandoning them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// How long the tracker keeps retrying a failing store write.
    #[serde(default = "default_store_grace_ms")]
    pub store_grace_ms: u64,
    /// Pause between store retries inside the grace period.
    #[serde(default = "default_store_retry_ms")]
    pub store_retry_ms: u64,
}

fn default_poll_interval_ms() -> u64 { 5_000 }
fn default_shutdown_grace_ms() -> u64 { 30_000 }
fn default_store_grace_ms() -> u64 { 30_000 }
fn default_store_retry_ms() -> u64 { 1_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            store_grace_ms: default_store_grace_ms(),
            store_retry_ms: default_store_retry_ms(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry, timeout and per-instance concurrency policy for sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Concurrent sends allowed through one instance across all campaigns.
    #[serde(default = "default_instance_capacity")]
    pub instance_rate_limit_capacity: usize,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_backoff_multiplier() -> u32 { 2 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_instance_capacity() -> usize { 1 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            request_timeout_ms: default_request_timeout_ms(),
            instance_rate_limit_capacity: default_instance_capacity(),
        }
    }
}

impl DispatchConfig {
    /// Backoff before retry number `retry` (1-based): base × multiplier^(retry-1).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier.max(1)).saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Inter-message delay policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Campaign intervals below this are raised to it.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Hard ceiling for any computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_image_base_ms")]
    pub image_base_ms: u64,
    #[serde(default = "default_video_base_ms")]
    pub video_base_ms: u64,
    #[serde(default = "default_audio_base_ms")]
    pub audio_base_ms: u64,
    #[serde(default = "default_document_base_ms")]
    pub document_base_ms: u64,
    /// Added for every MiB beyond the first.
    #[serde(default = "default_per_mib_ms")]
    pub per_mib_ms: u64,
    /// Random extra delay in `[0, jitter_ms]`, applied outside the policy. 0 disables.
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_min_interval_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 15_000 }
fn default_image_base_ms() -> u64 { 1_500 }
fn default_video_base_ms() -> u64 { 3_000 }
fn default_audio_base_ms() -> u64 { 2_000 }
fn default_document_base_ms() -> u64 { 2_000 }
fn default_per_mib_ms() -> u64 { 500 }

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_delay_ms: default_max_delay_ms(),
            image_base_ms: default_image_base_ms(),
            video_base_ms: default_video_base_ms(),
            audio_base_ms: default_audio_base_ms(),
            document_base_ms: default_document_base_ms(),
            per_mib_ms: default_per_mib_ms(),
            jitter_ms: 0,
        }
    }
}

/// Messaging gateway (Evolution-style HTTP API) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_gateway_url() -> String { "http://127.0.0.1:8080".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Campaign store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.wablast/campaigns.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

impl StoreConfig {
    /// `db_path` with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}
