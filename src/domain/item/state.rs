//! Work item states.
//!
//! Each reference moves through `Queued → Fetching → Ready → Rendering` and
//! terminates in an [`Outcome`](crate::domain::outcome::Outcome). A failed fetch
//! may loop back to `Queued` once. The states are distinct types so that, for
//! example, only a `Ready` item can be handed to the render stage.

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::reference::Reference;
use crate::domain::shard::{SessionId, ShardEntry};

/// Marker trait for valid work item states.
pub trait ItemState: Send + Sync {}

/// One reference being processed by an item pipeline.
///
/// Owned exclusively by the pipeline of its shard.
#[derive(Debug, Clone)]
pub struct WorkItem<T: ItemState> {
    /// The current state of the item.
    pub state: T,
    /// Immutable item data.
    pub data: ItemData,
}

/// Immutable data carried through every state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemData {
    /// Position in the admitted batch; only used to correlate log lines.
    pub ordinal: usize,
    /// Session processing this item.
    pub session_id: SessionId,
    pub reference: Reference,
}

// ============================================================================
// Item States
// ============================================================================

/// Waiting for a prefetch slot.
#[derive(Debug, Clone)]
pub struct Queued {
    /// Number of fetch attempts already made (0 = never fetched)
    pub fetch_attempt: u32,
}

impl ItemState for Queued {}

/// Payload fetch outstanding.
#[derive(Debug, Clone)]
pub struct Fetching {
    /// 1-based number of the attempt in flight
    pub fetch_attempt: u32,
    pub started_at: Instant,
}

impl ItemState for Fetching {}

/// Payload fetched, waiting for the session's single render slot.
#[derive(Debug, Clone)]
pub struct Ready {
    pub size_bytes: u64,
    /// Time spent in the last fetch attempt
    pub fetch_duration: Duration,
    pub ready_at: Instant,
}

impl ItemState for Ready {}

/// `open_and_render` outstanding.
#[derive(Debug, Clone)]
pub struct Rendering {
    pub size_bytes: u64,
    /// Time spent in the ready queue
    pub queued_for: Duration,
    pub started_at: Instant,
}

impl ItemState for Rendering {}

impl WorkItem<Queued> {
    /// Create a fresh item for a shard entry.
    pub fn new(session_id: SessionId, entry: ShardEntry) -> Self {
        WorkItem {
            state: Queued { fetch_attempt: 0 },
            data: ItemData {
                ordinal: entry.ordinal,
                session_id,
                reference: entry.reference,
            },
        }
    }
}
