//! State transitions for work items.
//!
//! ```text
//! WorkItem<Queued> ──begin_fetch()──> WorkItem<Fetching> ──fetched()──> WorkItem<Ready>
//!        ^                                   │                              │
//!        └──────── FetchFailure::Retry ──────┤                      begin_render()
//!                                            │                              v
//!                  Outcome::Missing <── FetchFailure::Exhausted     WorkItem<Rendering>
//!                                                                          │
//!                                                                     complete()
//!                                                                          v
//!                                                   Outcome::{Opened, FontSwap, Unopened}
//! ```
//!
//! Fetches are retried immediately (no backoff) up to the configured attempt
//! count. Renders are never retried: a host that raised mid-render is assumed
//! to be in an unknown state for that design.

use metrics::counter;
use tokio::time::Instant;

use crate::domain::outcome::{FailedDesign, FontSwapDesign, Outcome, RenderReply, RenderedDesign};
use crate::error::{BroadsideError, Result};

use super::state::{Fetching, Queued, Ready, Rendering, WorkItem};

/// Result of a failed fetch attempt.
#[derive(Debug)]
pub enum FetchFailure {
    /// Attempts remain; the item goes back to the queue.
    Retry(WorkItem<Queued>),
    /// Out of attempts; carries the `Missing` outcome with the last error.
    Exhausted(Outcome),
}

/// Message stored in a bucket entry for a per-item failure.
fn failure_message(error: &BroadsideError) -> String {
    match error {
        BroadsideError::AssetFetch(message) | BroadsideError::Render(message) => message.clone(),
        other => other.to_string(),
    }
}

impl WorkItem<Queued> {
    pub fn begin_fetch(self) -> WorkItem<Fetching> {
        WorkItem {
            state: Fetching {
                fetch_attempt: self.state.fetch_attempt + 1,
                started_at: Instant::now(),
            },
            data: self.data,
        }
    }
}

impl WorkItem<Fetching> {
    /// The payload arrived.
    pub fn fetched(self, size_bytes: u64) -> WorkItem<Ready> {
        let now = Instant::now();
        tracing::debug!(
            session_id = %self.data.session_id,
            ordinal = self.data.ordinal,
            reference = %self.data.reference,
            size_bytes,
            attempt = self.state.fetch_attempt,
            "Asset fetched"
        );
        WorkItem {
            state: Ready {
                size_bytes,
                fetch_duration: now.duration_since(self.state.started_at),
                ready_at: now,
            },
            data: self.data,
        }
    }

    /// Decide what happens after a failed fetch attempt.
    pub fn fetch_failed(self, error: &BroadsideError, max_attempts: u32) -> FetchFailure {
        if self.state.fetch_attempt < max_attempts {
            counter!("broadside_fetch_retries_total").increment(1);
            tracing::warn!(
                session_id = %self.data.session_id,
                ordinal = self.data.ordinal,
                reference = %self.data.reference,
                attempt = self.state.fetch_attempt,
                max_attempts,
                error = %error,
                "Asset fetch failed, retrying"
            );
            return FetchFailure::Retry(WorkItem {
                state: Queued {
                    fetch_attempt: self.state.fetch_attempt,
                },
                data: self.data,
            });
        }

        tracing::warn!(
            session_id = %self.data.session_id,
            ordinal = self.data.ordinal,
            reference = %self.data.reference,
            attempt = self.state.fetch_attempt,
            error = %error,
            "Asset fetch failed permanently, marking missing"
        );
        FetchFailure::Exhausted(Outcome::Missing(FailedDesign {
            reference: self.data.reference.id,
            error: failure_message(error),
        }))
    }
}

impl WorkItem<Ready> {
    pub fn begin_render(self) -> WorkItem<Rendering> {
        let now = Instant::now();
        WorkItem {
            state: Rendering {
                size_bytes: self.state.size_bytes,
                queued_for: now.duration_since(self.state.ready_at),
                started_at: now,
            },
            data: self.data,
        }
    }
}

impl WorkItem<Rendering> {
    /// Classify the result of `open_and_render`.
    pub fn complete(self, result: Result<RenderReply>) -> Outcome {
        let elapsed = self.state.started_at.elapsed();
        let reference = self.data.reference.id;

        match result {
            Ok(RenderReply::Rendered(render)) => {
                tracing::info!(
                    session_id = %self.data.session_id,
                    ordinal = self.data.ordinal,
                    reference = %reference,
                    width = render.width,
                    height = render.height,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Design opened"
                );
                Outcome::Opened(RenderedDesign { reference, render })
            }
            Ok(RenderReply::FontSwap { fonts }) => {
                tracing::info!(
                    session_id = %self.data.session_id,
                    ordinal = self.data.ordinal,
                    reference = %reference,
                    font_count = fonts.len(),
                    "Design needs font swap"
                );
                Outcome::FontSwap(FontSwapDesign {
                    reference,
                    fonts_to_swap: fonts,
                })
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.data.session_id,
                    ordinal = self.data.ordinal,
                    reference = %reference,
                    error = %error,
                    "Design failed to render"
                );
                Outcome::Unopened(FailedDesign {
                    reference,
                    error: failure_message(&error),
                })
            }
        }
    }
}
