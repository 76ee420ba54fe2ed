//! The inbound entry point: admit, coordinate, report.

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionGate;
use crate::config::ExtractorConfig;
use crate::coordinator::BatchCoordinator;
use crate::error::{BroadsideError, Result};
use crate::host::RenderHost;
use crate::pipeline::ItemPipeline;
use crate::report::{ExtractionReport, ReportAggregator};

/// Batch design extractor over a render host.
///
/// One extractor is meant to be shared (behind an `Arc`) by every request
/// handler: the admission gate inside it is what keeps concurrent batches
/// within the configured policy.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> broadside::Result<()> {
/// use std::sync::Arc;
/// use broadside::{Extractor, ExtractorConfig, HttpRenderHost, HttpRenderHostConfig};
///
/// let host = HttpRenderHost::new(HttpRenderHostConfig::default());
/// let extractor = Extractor::new(Arc::new(host), ExtractorConfig::default());
///
/// let report = extractor.extract(&["a.bfd", "b.bfd_thumb.png"]).await?;
/// println!("{}", report.summary);
/// # Ok(())
/// # }
/// ```
pub struct Extractor<H: RenderHost> {
    config: ExtractorConfig,
    gate: AdmissionGate,
    coordinator: BatchCoordinator<H>,
    aggregator: ReportAggregator,
    shutdown: CancellationToken,
}

impl<H: RenderHost + 'static> Extractor<H> {
    /// Build an extractor whose side-effect logs are the files named in
    /// `config`, if any.
    pub fn new(host: Arc<H>, config: ExtractorConfig) -> Self {
        let pipeline = ItemPipeline::new((&config).into());
        Self {
            gate: AdmissionGate::new(&config),
            coordinator: BatchCoordinator::new(host, pipeline, config.max_instances),
            aggregator: ReportAggregator::from_config(&config),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Replace the side-effect logs.
    pub fn with_aggregator(mut self, aggregator: ReportAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Cancelling `token` drains any in-flight batch the way an expired
    /// deadline does.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Number of batches currently in flight.
    pub fn active_batches(&self) -> usize {
        self.gate.active()
    }

    /// Extract every design referenced in `raw`.
    ///
    /// # Errors
    /// Admission rejections (`AlreadyRunning`, `TooManyActiveSessions`,
    /// `BatchTooLarge`) and `HostLaunch`. A batch cut short by its deadline is
    /// not an error: the report comes back with `timed_out` set.
    #[tracing::instrument(skip_all, fields(submitted = raw.len()))]
    pub async fn extract<T: AsRef<str> + Sync>(&self, raw: &[T]) -> Result<ExtractionReport> {
        let batch = self.gate.admit(raw).inspect_err(|e| {
            if e.is_admission_rejection() {
                counter!("broadside_admission_rejections_total", "reason" => e.reason())
                    .increment(1);
                tracing::info!(error = %e, "Batch rejected");
            }
        })?;

        let report = self
            .coordinator
            .run(batch, self.config.deadline(), &self.shutdown)
            .await
            .inspect_err(|e| {
                if let BroadsideError::HostLaunch { session_id, .. } = e {
                    tracing::error!(session_id = %session_id, error = %e, "Batch failed");
                }
            })?;

        Ok(self.aggregator.finalize(report).await)
    }
}
