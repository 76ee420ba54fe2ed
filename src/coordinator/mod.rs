//! Batch coordinator: fan a validated batch out over render host sessions.
//!
//! The batch is partitioned into at most `max_instances` shards. Every shard
//! gets its own session, its own force-terminate signal and its own spawned
//! task running an [`ItemPipeline`]. The coordinator then waits for all of
//! them, bounded by the batch deadline:
//!
//! - deadline expiry or shutdown fires every signal still armed; pipelines that
//!   already finished disarmed theirs and are left alone
//! - a session that cannot be launched fires the rest as well and the batch
//!   fails with [`BroadsideError::HostLaunch`]
//! - a pipeline that panics loses its shard; the session is still released
//!   and the report counts the shard as lost
//!
//! Results are merged in shard order once every task has returned, so a
//! timed-out batch still carries everything that settled before the cut.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::admission::ValidatedBatch;
use crate::domain::outcome::ShardOutcomes;
use crate::domain::shard::{Shard, partition};
use crate::error::{BroadsideError, Result};
use crate::host::{RenderHost, RenderSession};
use crate::pipeline::{ForceTerminate, ItemPipeline, PipelineRun, TerminationRegistry};
use crate::report::BatchReport;

/// Why a batch was force-drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// The batch deadline expired
    Deadline,
    /// The extractor was asked to shut down
    Shutdown,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::Deadline => "deadline",
            CancellationReason::Shutdown => "shutdown",
        }
    }
}

/// Runs validated batches across a pool of render host sessions.
pub struct BatchCoordinator<H: RenderHost> {
    host: Arc<H>,
    pipeline: Arc<ItemPipeline>,
    max_instances: usize,
}

impl<H: RenderHost + 'static> BatchCoordinator<H> {
    pub fn new(host: Arc<H>, pipeline: ItemPipeline, max_instances: usize) -> Self {
        Self {
            host,
            pipeline: Arc::new(pipeline),
            max_instances: max_instances.max(1),
        }
    }

    /// Process `batch` to completion, or until `deadline` or `shutdown`.
    ///
    /// The admission permit inside `batch` is held until this returns.
    ///
    /// # Errors
    /// Only [`BroadsideError::HostLaunch`]. Per-item failures end up in the
    /// report, and an expired deadline yields a partial report.
    #[tracing::instrument(
        skip_all,
        fields(items = batch.len(), deadline_ms = deadline.as_millis() as u64)
    )]
    pub async fn run(
        &self,
        batch: ValidatedBatch,
        deadline: Duration,
        shutdown: &CancellationToken,
    ) -> Result<BatchReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let submitted = batch.submitted();
        let (references, _permit) = batch.into_parts();
        let admitted = references.len();

        let shards = partition(references, self.max_instances);
        let instances = shards.len();
        tracing::info!(
            instances,
            shard_sizes = ?shards.iter().map(Shard::len).collect::<Vec<_>>(),
            "Starting batch"
        );

        let registry = TerminationRegistry::new();
        let mut join_set: JoinSet<Result<ShardEnd>> = JoinSet::new();
        for shard in shards {
            let signal = registry.arm(shard.session_id);
            join_set.spawn(run_shard(
                self.host.clone(),
                self.pipeline.clone(),
                shard,
                signal,
            ));
        }

        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        let mut runs: Vec<PipelineRun> = Vec::with_capacity(instances);
        let mut requested: Option<CancellationReason> = None;
        let mut launch_error: Option<BroadsideError> = None;
        let mut lost_shards = 0usize;

        loop {
            tokio::select! {
                biased;
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(ShardEnd::Finished(run)))) => runs.push(run),
                    Some(Ok(Ok(ShardEnd::Lost { shard_index }))) => {
                        tracing::error!(shard = shard_index, "Shard lost");
                        lost_shards += 1;
                    }
                    Some(Ok(Err(e))) => {
                        if launch_error.is_none() {
                            let fired = registry.fire_all();
                            tracing::error!(
                                error = %e,
                                fired,
                                "Render host launch failed, draining batch"
                            );
                            launch_error = Some(e);
                        } else {
                            tracing::error!(error = %e, "Further render host launch failure");
                        }
                    }
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "Shard task panicked");
                        lost_shards += 1;
                    }
                },
                _ = &mut deadline_sleep, if requested.is_none() => {
                    let fired = registry.fire_all();
                    tracing::warn!(fired, "Batch deadline expired");
                    requested = Some(CancellationReason::Deadline);
                }
                _ = shutdown.cancelled(), if requested.is_none() => {
                    let fired = registry.fire_all();
                    tracing::warn!(fired, "Shutdown requested, draining batch");
                    requested = Some(CancellationReason::Shutdown);
                }
            }
        }

        if let Some(e) = launch_error {
            counter!("broadside_batches_total", "result" => "launch_failed").increment(1);
            return Err(e);
        }

        // Only a cut that actually abandoned a session counts
        let cancellation = requested.filter(|_| runs.iter().any(|run| run.forced));

        runs.sort_by_key(|run| run.shard_index);
        let mut outcomes = ShardOutcomes::default();
        for run in runs {
            outcomes.append(run.outcomes);
        }

        let report = BatchReport::new(
            outcomes,
            submitted,
            admitted,
            instances,
            started_at,
            started.elapsed(),
            cancellation,
        )
        .with_lost_shards(lost_shards);

        let result = match cancellation {
            Some(reason) => reason.as_str(),
            None if lost_shards > 0 => "degraded",
            None => "completed",
        };
        counter!("broadside_batches_total", "result" => result).increment(1);
        tracing::info!(summary = %report.summary, "Batch finished");

        Ok(report)
    }
}

/// How a shard task ended.
enum ShardEnd {
    Finished(PipelineRun),
    /// The pipeline panicked; its session was still released
    Lost { shard_index: usize },
}

/// Launch a session for `shard` and run its pipeline.
///
/// An open in flight is never abandoned: a signal that fires meanwhile is
/// honored once the session exists, by releasing it straight away.
async fn run_shard<H: RenderHost>(
    host: Arc<H>,
    pipeline: Arc<ItemPipeline>,
    shard: Shard,
    signal: ForceTerminate,
) -> Result<ShardEnd> {
    let session_id = shard.session_id;
    let shard_index = shard.index;
    let abandoned = || {
        ShardEnd::Finished(PipelineRun {
            session_id,
            shard_index,
            outcomes: ShardOutcomes::default(),
            forced: true,
        })
    };

    if signal.is_fired() {
        tracing::info!(
            session_id = %session_id,
            "Force-terminated before the session launched"
        );
        return Ok(abandoned());
    }

    let session = match host.open(session_id).await {
        Ok(session) => session,
        Err(e) => {
            signal.disarm();
            return Err(BroadsideError::HostLaunch {
                session_id,
                message: e.to_string(),
            });
        }
    };

    if signal.is_fired() {
        tracing::info!(
            session_id = %session_id,
            "Force-terminated while the session launched"
        );
        if let Err(e) = session.terminate().await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Failed to terminate render host session"
            );
        }
        return Ok(abandoned());
    }

    let processed = AssertUnwindSafe(pipeline.process(shard, &session, &signal))
        .catch_unwind()
        .await;

    match processed {
        Ok(run) => Ok(ShardEnd::Finished(run)),
        Err(_) => {
            signal.disarm();
            tracing::error!(
                session_id = %session_id,
                shard = shard_index,
                "Item pipeline panicked, shard lost"
            );
            if let Err(e) = session.terminate().await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to terminate render host session"
                );
            }
            Ok(ShardEnd::Lost { shard_index })
        }
    }
}
