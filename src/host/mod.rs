//! Render host abstraction.
//!
//! The render host is the external system that actually fetches, opens and
//! paints designs. This module defines the `RenderHost` / `RenderSession` traits
//! the pipeline drives, so the pipeline can be exercised without a real host.
//!
//! A session is expensive and stateful: it can fetch several payloads at once,
//! but only one design may be open in it at any time. Sessions must be
//! terminated explicitly, and `terminate` must tolerate being called twice.

use async_trait::async_trait;

use crate::domain::outcome::RenderReply;
use crate::domain::reference::Reference;
use crate::domain::shard::SessionId;
use crate::error::Result;

pub mod http;
pub mod mock;

pub use http::{HttpRenderHost, HttpRenderHostConfig, HttpRenderSession};
pub use mock::{MockCall, MockCallKind, MockRenderHost, MockRenderSession};

/// Factory for render host sessions.
#[async_trait]
pub trait RenderHost: Send + Sync {
    type Session: RenderSession + 'static;

    /// Create an isolated execution context.
    ///
    /// # Errors
    /// Returns an error if the host cannot start a session at all. The batch
    /// coordinator surfaces this to the caller as a host-launch failure.
    async fn open(&self, session_id: SessionId) -> Result<Self::Session>;
}

/// One isolated render host execution context.
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Fetch a design payload into the session, returning its size in bytes.
    ///
    /// May be called concurrently with other fetches and with one render.
    async fn fetch_asset(&self, reference: &Reference) -> Result<u64>;

    /// Open a previously fetched design and render it.
    ///
    /// The reference's [`hint`](Reference::hint), when present, tells the host
    /// which transparency to expect so it can report a mismatch. Never called
    /// concurrently with itself on the same session.
    async fn open_and_render(&self, reference: &Reference) -> Result<RenderReply>;

    /// Release the session. Idempotent.
    async fn terminate(&self) -> Result<()>;
}
