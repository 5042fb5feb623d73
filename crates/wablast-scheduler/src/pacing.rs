//! Pacing policy: how long to wait between two sends of one campaign.
//!
//! Deterministic: the same (media type, size, interval) always gives the same
//! delay. Jitter is added by the caller, not here.

use std::time::Duration;

use wablast_core::config::PacingConfig;
use wablast_core::types::MediaType;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    config: PacingConfig,
}

impl PacingPolicy {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    /// Delay in milliseconds, never above `max_delay_ms`.
    pub fn delay_ms(&self, media_type: MediaType, payload_size_bytes: u64, interval_ms: u64) -> u64 {
        let cfg = &self.config;
        let interval = interval_ms.max(cfg.min_interval_ms);

        let type_base = match media_type {
            MediaType::Text => 0,
            MediaType::Image => cfg.image_base_ms,
            MediaType::Video => cfg.video_base_ms,
            MediaType::Audio => cfg.audio_base_ms,
            MediaType::Document => cfg.document_base_ms,
        };

        let size_term = if media_type == MediaType::Text {
            0
        } else {
            payload_size_bytes
                .saturating_sub(MIB)
                .div_ceil(MIB)
                .saturating_mul(cfg.per_mib_ms)
        };

        interval
            .saturating_add(type_base)
            .saturating_add(size_term)
            .min(cfg.max_delay_ms)
    }

    pub fn delay(&self, media_type: MediaType, payload_size_bytes: u64, interval_ms: u64) -> Duration {
        Duration::from_millis(self.delay_ms(media_type, payload_size_bytes, interval_ms))
    }

    pub fn jitter_ms(&self) -> u64 {
        self.config.jitter_ms
    }
}
