//! Scriptable in-memory render host for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{RenderHost, RenderSession};
use crate::domain::outcome::RenderReply;
use crate::domain::reference::Reference;
use crate::domain::shard::SessionId;
use crate::error::{BroadsideError, Result};

/// Mock render host.
///
/// Responses are scripted per reference id and consumed in FIFO order, shared by
/// every session the host opens. A call with nothing scripted fails.
///
/// # Example
/// ```ignore
/// let host = MockRenderHost::new();
/// host.add_fetch("a.bfd", Err(BroadsideError::AssetFetch("flaky".into())));
/// host.add_fetch("a.bfd", Ok(2048));
/// host.add_render("a.bfd", Ok(RenderReply::FontSwap { fonts: vec!["Lato".into()] }));
/// ```
#[derive(Clone, Default)]
pub struct MockRenderHost {
    fetches: Arc<Mutex<HashMap<String, VecDeque<MockStep<u64>>>>>,
    renders: Arc<Mutex<HashMap<String, VecDeque<MockStep<RenderReply>>>>>,
    open_failures: Arc<Mutex<VecDeque<String>>>,
    open_delays: Arc<Mutex<VecDeque<Duration>>>,
    sessions: Arc<Mutex<Vec<(SessionId, Arc<SessionCounters>)>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// A scripted response, optionally held back until a delay or trigger.
enum MockStep<T> {
    Immediate(Result<T>),
    Delayed(Duration, Result<T>),
    Triggered {
        response: Result<T>,
        trigger: oneshot::Receiver<()>,
    },
    /// Never completes; only forced termination gets the item out.
    Hang,
    /// Panics inside the host call.
    Panic,
}

impl<T> MockStep<T> {
    async fn play(step: Option<Self>, unscripted: impl FnOnce() -> BroadsideError) -> Result<T> {
        match step {
            Some(MockStep::Immediate(response)) => response,
            Some(MockStep::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                response
            }
            Some(MockStep::Triggered { response, trigger }) => {
                // Proceed on send or drop of the sender
                let _ = trigger.await;
                response
            }
            Some(MockStep::Hang) => std::future::pending().await,
            Some(MockStep::Panic) => panic!("scripted mock panic"),
            None => Err(unscripted()),
        }
    }
}

/// Kind of call recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCallKind {
    Fetch,
    Render,
    Terminate,
}

/// Record of a call made to a mock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub session_id: SessionId,
    pub kind: MockCallKind,
    /// `None` for terminate
    pub reference: Option<String>,
}

#[derive(Default)]
struct SessionCounters {
    fetch_in_flight: AtomicUsize,
    render_in_flight: AtomicUsize,
    peak_fetch_in_flight: AtomicUsize,
    peak_render_in_flight: AtomicUsize,
    terminations: AtomicUsize,
}

impl MockRenderHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_fetch(&self, reference: &str, step: MockStep<u64>) {
        self.fetches
            .lock()
            .entry(reference.to_string())
            .or_default()
            .push_back(step);
    }

    fn push_render(&self, reference: &str, step: MockStep<RenderReply>) {
        self.renders
            .lock()
            .entry(reference.to_string())
            .or_default()
            .push_back(step);
    }

    /// Script one fetch response for `reference`.
    pub fn add_fetch(&self, reference: &str, response: Result<u64>) {
        self.push_fetch(reference, MockStep::Immediate(response));
    }

    /// Script a fetch response delivered after `delay`.
    pub fn add_fetch_delayed(&self, reference: &str, delay: Duration, response: Result<u64>) {
        self.push_fetch(reference, MockStep::Delayed(delay, response));
    }

    /// Script a fetch response held until the returned sender fires (or drops).
    pub fn add_fetch_with_trigger(
        &self,
        reference: &str,
        response: Result<u64>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push_fetch(
            reference,
            MockStep::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    /// Script a fetch that never completes.
    pub fn add_fetch_hanging(&self, reference: &str) {
        self.push_fetch(reference, MockStep::Hang);
    }

    /// Script one render response for `reference`.
    pub fn add_render(&self, reference: &str, response: Result<RenderReply>) {
        self.push_render(reference, MockStep::Immediate(response));
    }

    /// Script a render response delivered after `delay`.
    pub fn add_render_delayed(
        &self,
        reference: &str,
        delay: Duration,
        response: Result<RenderReply>,
    ) {
        self.push_render(reference, MockStep::Delayed(delay, response));
    }

    /// Script a render response held until the returned sender fires (or drops).
    pub fn add_render_with_trigger(
        &self,
        reference: &str,
        response: Result<RenderReply>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push_render(
            reference,
            MockStep::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    /// Script a render that never completes.
    pub fn add_render_hanging(&self, reference: &str) {
        self.push_render(reference, MockStep::Hang);
    }

    /// Script a render that panics.
    pub fn add_render_panicking(&self, reference: &str) {
        self.push_render(reference, MockStep::Panic);
    }

    /// Script a design that fetches and renders successfully.
    pub fn add_design(&self, reference: &str, size_bytes: u64, reply: RenderReply) {
        self.add_fetch(reference, Ok(size_bytes));
        self.add_render(reference, Ok(reply));
    }

    /// Make the next `open` call fail with `message`.
    pub fn fail_next_open(&self, message: &str) {
        self.open_failures.lock().push_back(message.to_string());
    }

    /// Make the next successful `open` take `delay` after the session exists.
    pub fn delay_next_open(&self, delay: Duration) {
        self.open_delays.lock().push_back(delay);
    }

    /// Get all calls made to sessions of this host.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of one kind across all sessions.
    pub fn call_count(&self, kind: MockCallKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Ids of every session opened so far, in open order.
    pub fn opened_sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().iter().map(|(id, _)| *id).collect()
    }

    fn counters(&self, session_id: SessionId) -> Option<Arc<SessionCounters>> {
        self.sessions
            .lock()
            .iter()
            .find(|(id, _)| *id == session_id)
            .map(|(_, counters)| counters.clone())
    }

    /// How many times `terminate` was called on a session.
    pub fn terminate_count(&self, session_id: SessionId) -> usize {
        self.counters(session_id)
            .map(|c| c.terminations.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Highest number of concurrent renders observed within any single session.
    pub fn peak_render_concurrency(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .map(|(_, c)| c.peak_render_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    /// Highest number of concurrent fetches observed within any single session.
    pub fn peak_fetch_concurrency(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .map(|(_, c)| c.peak_fetch_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    /// Fetches and renders currently executing, across all sessions.
    pub fn in_flight_count(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .map(|(_, c)| {
                c.fetch_in_flight.load(Ordering::SeqCst) + c.render_in_flight.load(Ordering::SeqCst)
            })
            .sum()
    }
}

#[async_trait]
impl RenderHost for MockRenderHost {
    type Session = MockRenderSession;

    async fn open(&self, session_id: SessionId) -> Result<MockRenderSession> {
        if let Some(message) = self.open_failures.lock().pop_front() {
            return Err(BroadsideError::Other(anyhow::anyhow!(message)));
        }

        let counters = Arc::new(SessionCounters::default());
        self.sessions.lock().push((session_id, counters.clone()));

        let delay = self.open_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(MockRenderSession {
            session_id,
            host: self.clone(),
            counters,
        })
    }
}

/// Session handed out by [`MockRenderHost`].
pub struct MockRenderSession {
    session_id: SessionId,
    host: MockRenderHost,
    counters: Arc<SessionCounters>,
}

impl MockRenderSession {
    fn record(&self, kind: MockCallKind, reference: Option<&Reference>) {
        self.host.calls.lock().push(MockCall {
            session_id: self.session_id,
            kind,
            reference: reference.map(|r| r.id.clone()),
        });
    }
}

/// Tracks one in-flight call; decrements even if the call is abandoned.
struct InFlightGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(in_flight: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderSession for MockRenderSession {
    async fn fetch_asset(&self, reference: &Reference) -> Result<u64> {
        let _guard = InFlightGuard::enter(
            &self.counters.fetch_in_flight,
            &self.counters.peak_fetch_in_flight,
        );
        self.record(MockCallKind::Fetch, Some(reference));

        let step = self
            .host
            .fetches
            .lock()
            .get_mut(&reference.id)
            .and_then(VecDeque::pop_front);

        MockStep::play(step, || {
            BroadsideError::AssetFetch(format!("No mock fetch configured for {}", reference))
        })
        .await
    }

    async fn open_and_render(&self, reference: &Reference) -> Result<RenderReply> {
        let _guard = InFlightGuard::enter(
            &self.counters.render_in_flight,
            &self.counters.peak_render_in_flight,
        );
        self.record(MockCallKind::Render, Some(reference));

        let step = self
            .host
            .renders
            .lock()
            .get_mut(&reference.id)
            .and_then(VecDeque::pop_front);

        MockStep::play(step, || {
            BroadsideError::Render(format!("No mock render configured for {}", reference))
        })
        .await
    }

    async fn terminate(&self) -> Result<()> {
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        self.record(MockCallKind::Terminate, None);
        Ok(())
    }
}
