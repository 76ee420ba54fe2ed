//! Item pipeline: the two-stage prefetch/render state machine of one session.
//!
//! ```text
//!  queue ──> [ prefetch x P ] ──ready (FIFO)──> [ render x 1 ] ──> opened / font swap / unopened
//!                  │
//!                  └── two failed attempts ──> missing
//! ```
//!
//! Both stages run concurrently inside one task and share the session by
//! reference: up to `P` fetches and exactly one render may be outstanding at the
//! same time. The pipeline finishes when the queue, the in-flight fetches and
//! the ready queue are all empty, or as soon as its force-terminate signal
//! fires. Either way it terminates the session exactly once.

use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::item::{FetchFailure, Queued, Ready, WorkItem};
use crate::domain::outcome::{Outcome, ShardOutcomes};
use crate::domain::shard::{SessionId, Shard};
use crate::host::RenderSession;

pub mod termination;
pub mod watchdog;

pub use termination::{ForceTerminate, TerminationRegistry};
pub use watchdog::{Stage, Watchdog};

/// Per-session pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum concurrent fetches within one session
    pub prefetch_concurrency: usize,
    /// Total fetch attempts per item (first try included)
    pub fetch_attempts: u32,
    /// Watchdog tick interval; zero disables it
    pub watchdog_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch_concurrency: 5,
            fetch_attempts: 2,
            watchdog_interval: Duration::from_secs(10),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub session_id: SessionId,
    pub shard_index: usize,
    pub outcomes: ShardOutcomes,
    /// The force-terminate signal cut the run short
    pub forced: bool,
}

/// Processes one shard against one render host session.
pub struct ItemPipeline {
    config: PipelineConfig,
    watchdog: Watchdog,
}

impl ItemPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let watchdog = Watchdog::new(config.watchdog_interval);
        Self { config, watchdog }
    }

    /// Run the shard to completion (or until `force_terminate` fires), then
    /// terminate `session`.
    ///
    /// Items still queued, fetching, or waiting to render when the signal fires
    /// are left out of the result. They are neither retried nor reported as
    /// failed.
    #[tracing::instrument(
        skip_all,
        fields(session_id = %shard.session_id, shard = shard.index, items = shard.len())
    )]
    pub async fn process<S>(
        &self,
        shard: Shard,
        session: &S,
        force_terminate: &ForceTerminate,
    ) -> PipelineRun
    where
        S: RenderSession + ?Sized,
    {
        let session_id = shard.session_id;
        let shard_index = shard.index;
        let outcomes = Mutex::new(ShardOutcomes::default());

        tracing::info!("Item pipeline starting");

        let forced = tokio::select! {
            biased;
            _ = force_terminate.fired() => true,
            _ = self.drive(shard, session, &outcomes) => {
                // Finished first: make sure a late deadline cannot fire for us
                force_terminate.disarm();
                false
            }
        };

        let outcomes = outcomes.into_inner();
        if forced {
            tracing::warn!(
                settled = outcomes.len(),
                "Force-terminated, abandoning unsettled items"
            );
        } else {
            tracing::info!(settled = outcomes.len(), "Item pipeline drained");
        }

        if let Err(e) = session.terminate().await {
            tracing::warn!(error = %e, "Failed to terminate render host session");
        }

        PipelineRun {
            session_id,
            shard_index,
            outcomes,
            forced,
        }
    }

    async fn drive<S>(&self, shard: Shard, session: &S, outcomes: &Mutex<ShardOutcomes>)
    where
        S: RenderSession + ?Sized,
    {
        let session_id = shard.session_id;
        let queue = shard
            .entries
            .into_iter()
            .map(|entry| WorkItem::new(session_id, entry));

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<WorkItem<Ready>>();

        let prefetch_stage = async move {
            let mut fetches = futures::stream::iter(queue)
                .map(|item| self.prefetch(session, item))
                .buffer_unordered(self.config.prefetch_concurrency.max(1));

            while let Some(result) = fetches.next().await {
                match result {
                    Ok(ready) => {
                        // The render stage only stops once this sender is gone
                        let _ = ready_tx.send(ready);
                    }
                    Err(missing) => record(outcomes, missing),
                }
            }
            tracing::debug!("Prefetch stage drained");
        };

        let render_stage = async {
            while let Some(ready) = ready_rx.recv().await {
                let outcome = self.render(session, ready).await;
                record(outcomes, outcome);
            }
            tracing::debug!("Render stage drained");
        };

        tokio::join!(prefetch_stage, render_stage);
    }

    /// Fetch one payload, retrying per `fetch_attempts`.
    async fn prefetch<S>(
        &self,
        session: &S,
        mut item: WorkItem<Queued>,
    ) -> std::result::Result<WorkItem<Ready>, Outcome>
    where
        S: RenderSession + ?Sized,
    {
        gauge!("broadside_fetches_in_flight").increment(1.0);
        let _in_flight = scopeguard::guard((), |_| {
            gauge!("broadside_fetches_in_flight").decrement(1.0);
        });

        loop {
            let fetching = item.begin_fetch();
            let result = self
                .watchdog
                .observe(
                    session.fetch_asset(&fetching.data.reference),
                    Stage::Fetch,
                    &fetching.data,
                )
                .await;

            match result {
                Ok(size_bytes) => return Ok(fetching.fetched(size_bytes)),
                Err(e) => match fetching.fetch_failed(&e, self.config.fetch_attempts) {
                    FetchFailure::Retry(queued) => item = queued,
                    FetchFailure::Exhausted(missing) => return Err(missing),
                },
            }
        }
    }

    /// Open and render one ready item. Never retried.
    async fn render<S>(&self, session: &S, item: WorkItem<Ready>) -> Outcome
    where
        S: RenderSession + ?Sized,
    {
        let rendering = item.begin_render();
        tracing::debug!(
            ordinal = rendering.data.ordinal,
            reference = %rendering.data.reference,
            size_bytes = rendering.state.size_bytes,
            queued_ms = rendering.state.queued_for.as_millis() as u64,
            "Rendering design"
        );

        let result = self
            .watchdog
            .observe(
                session.open_and_render(&rendering.data.reference),
                Stage::Render,
                &rendering.data,
            )
            .await;

        histogram!("broadside_render_duration_seconds")
            .record(rendering.state.started_at.elapsed().as_secs_f64());
        rendering.complete(result)
    }
}

fn record(outcomes: &Mutex<ShardOutcomes>, outcome: Outcome) {
    counter!("broadside_items_total", "outcome" => outcome.as_str()).increment(1);
    outcomes.lock().record(outcome);
}
