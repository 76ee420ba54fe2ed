//! Watchdog for long-running host calls.
//!
//! A watchdog wraps a host call and logs every `interval` while the call is
//! still outstanding. It never cancels or retries the call; it only re-arms.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::item::ItemData;

/// Which host call is being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Render,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Render => "render",
        }
    }
}

pub struct Watchdog {
    interval: Duration,
    ticks: AtomicU64,
}

impl Watchdog {
    /// A zero interval disables the watchdog.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ticks: AtomicU64::new(0),
        }
    }

    /// Total ticks fired across every call this watchdog observed.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Await `operation`, logging each time `interval` elapses before it settles.
    pub async fn observe<F: Future>(
        &self,
        operation: F,
        stage: Stage,
        item: &ItemData,
    ) -> F::Output {
        if self.interval.is_zero() {
            return operation.await;
        }

        tokio::pin!(operation);
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                output = &mut operation => return output,
                _ = ticker.tick() => {
                    self.ticks.fetch_add(1, Ordering::Relaxed);
                    counter!("broadside_watchdog_ticks_total", "stage" => stage.as_str())
                        .increment(1);
                    tracing::warn!(
                        session_id = %item.session_id,
                        ordinal = item.ordinal,
                        reference = %item.reference,
                        stage = stage.as_str(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Host call still outstanding"
                    );
                }
            }
        }
    }
}
