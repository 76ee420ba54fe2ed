//! Extractor configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionPolicy;
use crate::pipeline::PipelineConfig;

/// Configuration for the extractor.
///
/// Every field has a default, so partial JSON/TOML documents deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Number of render host sessions (shards) per batch
    pub max_instances: usize,

    /// Upper bound on references per session; with `max_instances` it caps the
    /// raw batch size
    pub max_per_instance: usize,

    /// Concurrent payload fetches within one session
    pub prefetch_concurrency: usize,

    /// Total fetch attempts per item, first try included
    pub fetch_attempts: u32,

    /// Interval at which outstanding host calls are logged (milliseconds).
    /// Zero disables the watchdog.
    pub watchdog_interval_ms: u64,

    /// Wall-clock budget for a whole batch (milliseconds). When it expires every
    /// running session is force-terminated and the batch reports partial results.
    pub deadline_ms: u64,

    /// How concurrent batches are admitted
    pub admission: AdmissionPolicy,

    /// Extension of design payload references, without the dot
    pub design_extension: String,

    /// Marker between the design name and the thumbnail extension
    /// (`foo.bfd_thumb.png`)
    pub thumbnail_marker: String,

    /// Append-only log of fonts that designs asked to swap
    pub font_log_path: Option<PathBuf>,

    /// Append-only log of thumbnails whose transparency did not match their hint
    pub mismatch_log_path: Option<PathBuf>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            max_per_instance: 75,
            prefetch_concurrency: 5,
            fetch_attempts: 2,
            watchdog_interval_ms: 10_000,
            deadline_ms: 600_000, // 10 minutes
            admission: AdmissionPolicy::SingleFlight,
            design_extension: "bfd".to_string(),
            thumbnail_marker: "_thumb".to_string(),
            font_log_path: None,
            mismatch_log_path: None,
        }
    }
}

impl ExtractorConfig {
    /// Largest raw batch the admission gate accepts.
    pub fn max_batch_size(&self) -> usize {
        self.max_instances.saturating_mul(self.max_per_instance)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl From<&ExtractorConfig> for PipelineConfig {
    fn from(config: &ExtractorConfig) -> Self {
        PipelineConfig {
            prefetch_concurrency: config.prefetch_concurrency.max(1),
            fetch_attempts: config.fetch_attempts.max(1),
            watchdog_interval: Duration::from_millis(config.watchdog_interval_ms),
        }
    }
}
