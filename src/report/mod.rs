//! Batch reports and the side effects driven from them.
//!
//! The coordinator produces a [`BatchReport`]: merged outcome buckets plus
//! timing. [`ReportAggregator::finalize`] appends the font-demand and
//! transparency-mismatch logs and turns it into the caller-facing
//! [`ExtractionReport`], dropping the internal mismatch flag on the way.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ExtractorConfig;
use crate::coordinator::CancellationReason;
use crate::domain::outcome::{FailedDesign, FontSwapDesign, RenderedDesign, ShardOutcomes};

pub mod log;

pub use log::{FileLog, MemoryLog, SideEffectLog};

/// Per-bucket counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    /// Raw entries submitted
    pub submitted: usize,
    /// Valid, deduplicated references admitted
    pub admitted: usize,
    pub opened: usize,
    pub font_swap: usize,
    pub missing: usize,
    pub unopened: usize,
    /// Admitted but abandoned by a forced termination or a lost shard
    pub unsettled: usize,
    /// Shards whose pipeline panicked
    pub lost_shards: usize,
}

/// Merged result of all shards of one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcomes: ShardOutcomes,
    pub counts: OutcomeCounts,
    pub summary: String,
    /// Number of render host sessions used
    pub instances: usize,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the batch was force-drained before every item settled
    pub cancellation: Option<CancellationReason>,
}

impl BatchReport {
    pub fn new(
        outcomes: ShardOutcomes,
        submitted: usize,
        admitted: usize,
        instances: usize,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        cancellation: Option<CancellationReason>,
    ) -> Self {
        let counts = OutcomeCounts {
            submitted,
            admitted,
            opened: outcomes.opened.len(),
            font_swap: outcomes.font_swap.len(),
            missing: outcomes.missing.len(),
            unopened: outcomes.unopened.len(),
            unsettled: admitted.saturating_sub(outcomes.len()),
            lost_shards: 0,
        };
        let summary = summarize(&counts, instances, elapsed, cancellation);

        Self {
            outcomes,
            counts,
            summary,
            instances,
            elapsed,
            started_at,
            finished_at: Utc::now(),
            cancellation,
        }
    }

    /// Record shards lost to a panicked pipeline.
    pub fn with_lost_shards(mut self, lost_shards: usize) -> Self {
        self.counts.lost_shards = lost_shards;
        self.summary = summarize(&self.counts, self.instances, self.elapsed, self.cancellation);
        self
    }

    /// True when the deadline (or a shutdown) cut the batch short.
    pub fn timed_out(&self) -> bool {
        self.cancellation.is_some()
    }
}

/// One human-readable line describing a finished batch.
fn summarize(
    counts: &OutcomeCounts,
    instances: usize,
    elapsed: Duration,
    cancellation: Option<CancellationReason>,
) -> String {
    let settled = counts.opened + counts.font_swap + counts.missing + counts.unopened;
    let seconds = elapsed.as_secs_f64();
    let throughput = settled as f64 / seconds.max(0.001);

    let prefix = match cancellation {
        Some(CancellationReason::Deadline) => "[TIMED OUT] ",
        Some(CancellationReason::Shutdown) => "[SHUTDOWN] ",
        None => "",
    };

    let mut summary = format!(
        "{prefix}Processed {settled}/{admitted} designs in {seconds:.2}s ({throughput:.2}/s) \
         across {instances} instance{plural}: \
         {opened} opened, {font_swap} font swap, {missing} missing, {unopened} unopened",
        admitted = counts.admitted,
        plural = if instances == 1 { "" } else { "s" },
        opened = counts.opened,
        font_swap = counts.font_swap,
        missing = counts.missing,
        unopened = counts.unopened,
    );

    if counts.opened > 0 {
        let mean = seconds / counts.opened as f64;
        summary.push_str(&format!("; {mean:.2}s per opened design"));
    }

    if counts.lost_shards > 0 {
        summary.push_str(&format!(
            "; {} shard{} lost",
            counts.lost_shards,
            if counts.lost_shards == 1 { "" } else { "s" }
        ));
    }

    summary
}

/// A successfully opened design as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedDesign {
    pub reference: String,
    pub thumbnail_ref: String,
    pub width: u32,
    pub height: u32,
    pub extracted_text: String,
    pub section_id: Option<String>,
    pub version: Option<String>,
    pub source_template_id: Option<String>,
}

impl From<RenderedDesign> for OpenedDesign {
    fn from(design: RenderedDesign) -> Self {
        let render = design.render;
        OpenedDesign {
            reference: design.reference,
            thumbnail_ref: render.thumbnail_ref,
            width: render.width,
            height: render.height,
            extracted_text: render.extracted_text,
            section_id: render.section_id,
            version: render.version,
            source_template_id: render.source_template_id,
        }
    }
}

/// Response returned to the caller of an extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub summary: String,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationReason>,
    pub counts: OutcomeCounts,
    pub instances: usize,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub opened: Vec<OpenedDesign>,
    pub font_swap: Vec<FontSwapDesign>,
    pub missing: Vec<FailedDesign>,
    pub unopened: Vec<FailedDesign>,
}

/// Drives the side-effect logs and shapes the caller-facing report.
#[derive(Clone, Default)]
pub struct ReportAggregator {
    font_log: Option<Arc<dyn SideEffectLog>>,
    mismatch_log: Option<Arc<dyn SideEffectLog>>,
}

impl ReportAggregator {
    pub fn new(
        font_log: Option<Arc<dyn SideEffectLog>>,
        mismatch_log: Option<Arc<dyn SideEffectLog>>,
    ) -> Self {
        Self {
            font_log,
            mismatch_log,
        }
    }

    /// File-backed logs at the paths configured, if any.
    pub fn from_config(config: &ExtractorConfig) -> Self {
        let file_log = |path: &std::path::PathBuf| -> Arc<dyn SideEffectLog> {
            Arc::new(FileLog::new(path.clone()))
        };
        Self::new(
            config.font_log_path.as_ref().map(file_log),
            config.mismatch_log_path.as_ref().map(file_log),
        )
    }

    /// Append the side-effect logs and build the caller-facing report.
    ///
    /// Log failures are logged and otherwise ignored: they never fail the batch.
    pub async fn finalize(&self, report: BatchReport) -> ExtractionReport {
        let fonts: Vec<String> = report
            .outcomes
            .font_swap
            .iter()
            .flat_map(|design| design.fonts_to_swap.iter().cloned())
            .collect();

        let mismatched: Vec<String> = report
            .outcomes
            .opened
            .iter()
            .filter(|design| design.render.transparency_mismatch)
            .map(|design| design.render.thumbnail_ref.clone())
            .collect();

        append_best_effort(self.font_log.as_deref(), &fonts, "font demand").await;
        append_best_effort(self.mismatch_log.as_deref(), &mismatched, "transparency mismatch")
            .await;

        let ShardOutcomes {
            opened,
            font_swap,
            missing,
            unopened,
        } = report.outcomes;

        ExtractionReport {
            summary: report.summary,
            timed_out: report.cancellation.is_some(),
            cancellation: report.cancellation,
            counts: report.counts,
            instances: report.instances,
            elapsed_ms: report.elapsed.as_millis() as u64,
            started_at: report.started_at,
            finished_at: report.finished_at,
            opened: opened.into_iter().map(OpenedDesign::from).collect(),
            font_swap,
            missing,
            unopened,
        }
    }
}

async fn append_best_effort(log: Option<&dyn SideEffectLog>, lines: &[String], kind: &str) {
    let Some(log) = log else {
        return;
    };
    if lines.is_empty() {
        return;
    }

    match log.append_lines(lines).await {
        Ok(()) => tracing::debug!(kind, entries = lines.len(), "Appended side-effect log"),
        Err(e) => tracing::warn!(
            kind,
            entries = lines.len(),
            error = %e,
            "Failed to append side-effect log"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::{Outcome, RenderResult};
    use crate::error::{BroadsideError, Result};
    use async_trait::async_trait;

    fn opened(reference: &str, thumbnail: &str, mismatch: bool) -> Outcome {
        Outcome::Opened(RenderedDesign {
            reference: reference.to_string(),
            render: RenderResult {
                thumbnail_ref: thumbnail.to_string(),
                width: 10,
                height: 20,
                extracted_text: "Title".to_string(),
                section_id: Some("sec".to_string()),
                version: None,
                source_template_id: Some("tpl-1".to_string()),
                transparency_mismatch: mismatch,
            },
        })
    }

    fn font_swap(reference: &str, fonts: &[&str]) -> Outcome {
        Outcome::FontSwap(FontSwapDesign {
            reference: reference.to_string(),
            fonts_to_swap: fonts.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn sample_outcomes() -> ShardOutcomes {
        let mut outcomes = ShardOutcomes::default();
        outcomes.record(opened("a.bfd", "thumbs/a.png", true));
        outcomes.record(opened("b.bfd", "thumbs/b.jpg", false));
        outcomes.record(font_swap("c.bfd", &["Lato", "Inter"]));
        outcomes.record(font_swap("d.bfd", &["Lato"]));
        outcomes.record(Outcome::Missing(FailedDesign {
            reference: "e.bfd".to_string(),
            error: "404".to_string(),
        }));
        outcomes
    }

    struct FailingLog;

    #[async_trait]
    impl SideEffectLog for FailingLog {
        async fn append_lines(&self, _lines: &[String]) -> Result<()> {
            Err(BroadsideError::Other(anyhow::anyhow!("disk full")))
        }
    }

    #[test]
    fn test_summary_includes_counts_rate_and_mean() {
        let report = BatchReport::new(
            sample_outcomes(),
            6,
            5,
            3,
            Utc::now(),
            Duration::from_secs(10),
            None,
        );

        assert_eq!(report.counts.unsettled, 0);
        assert_eq!(
            report.summary,
            "Processed 5/5 designs in 10.00s (0.50/s) across 3 instances: \
             2 opened, 2 font swap, 1 missing, 0 unopened; 5.00s per opened design"
        );
        assert!(!report.timed_out());
    }

    #[test]
    fn test_timed_out_summary_is_prefixed_and_counts_unsettled() {
        let report = BatchReport::new(
            ShardOutcomes::default(),
            4,
            4,
            1,
            Utc::now(),
            Duration::from_secs(2),
            Some(CancellationReason::Deadline),
        );

        assert!(report.timed_out());
        assert_eq!(report.counts.unsettled, 4);
        assert!(report.summary.starts_with("[TIMED OUT] Processed 0/4 designs"));
        assert!(report.summary.contains("across 1 instance:"));
        // No opened designs, no mean
        assert!(!report.summary.contains("per opened design"));
    }

    #[test]
    fn test_lost_shards_noted_in_summary() {
        let report = BatchReport::new(
            sample_outcomes(),
            8,
            8,
            2,
            Utc::now(),
            Duration::from_secs(1),
            None,
        )
        .with_lost_shards(1);

        assert!(!report.timed_out());
        assert_eq!(report.counts.lost_shards, 1);
        assert_eq!(report.counts.unsettled, 3);
        assert!(report.summary.ends_with("; 1 shard lost"));
    }

    #[tokio::test]
    async fn test_finalize_appends_logs_and_strips_mismatch() {
        let fonts = Arc::new(MemoryLog::new());
        let mismatches = Arc::new(MemoryLog::new());
        let aggregator = ReportAggregator::new(Some(fonts.clone()), Some(mismatches.clone()));

        let report = BatchReport::new(
            sample_outcomes(),
            5,
            5,
            2,
            Utc::now(),
            Duration::from_secs(1),
            None,
        );
        let extraction = aggregator.finalize(report).await;

        assert_eq!(fonts.lines(), vec!["Lato", "Inter", "Lato"]);
        assert_eq!(mismatches.lines(), vec!["thumbs/a.png"]);

        assert_eq!(extraction.opened.len(), 2);
        assert_eq!(extraction.opened[0].source_template_id.as_deref(), Some("tpl-1"));
        let json = serde_json::to_value(&extraction).unwrap();
        assert!(json["opened"][0].get("transparency_mismatch").is_none());
        assert_eq!(json["font_swap"][0]["fonts_to_swap"][1], "Inter");
        assert_eq!(json["missing"][0]["error"], "404");
        assert_eq!(json["timed_out"], false);
    }

    #[tokio::test]
    async fn test_log_failures_do_not_fail_finalize() {
        let aggregator =
            ReportAggregator::new(Some(Arc::new(FailingLog)), Some(Arc::new(FailingLog)));
        let report = BatchReport::new(
            sample_outcomes(),
            5,
            5,
            1,
            Utc::now(),
            Duration::from_millis(500),
            None,
        );

        let extraction = aggregator.finalize(report).await;
        assert_eq!(extraction.font_swap.len(), 2);
    }
}
