//! Shards: the slice of a batch handled by one render host session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::reference::Reference;

/// Identifier of one render host session (and its shard).
///
/// Generated fresh per shard. It only exists to correlate log lines, so the
/// display form is the first 8 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

impl std::ops::Deref for SessionId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A reference positioned in the admitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEntry {
    /// Position in the admitted (deduplicated) batch, used to correlate logs.
    pub ordinal: usize,
    pub reference: Reference,
}

/// The subset of references assigned to one render host session.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Position of this shard in the batch; the merge step orders by it.
    pub index: usize,
    pub session_id: SessionId,
    pub entries: Vec<ShardEntry>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split `references` into at most `max_shards` contiguous shards.
///
/// Shard sizes differ by at most one and never exceed `ceil(N / max_shards)`;
/// the larger shards come first (10 references over 3 shards gives 4, 3, 3).
/// Empty shards are omitted, so fewer references than shards yields one
/// single-item shard per reference.
pub fn partition(references: Vec<Reference>, max_shards: usize) -> Vec<Shard> {
    let total = references.len();
    let shard_count = max_shards.max(1).min(total);
    if shard_count == 0 {
        return Vec::new();
    }

    let base = total / shard_count;
    let remainder = total % shard_count;

    let mut entries = references
        .into_iter()
        .enumerate()
        .map(|(ordinal, reference)| ShardEntry { ordinal, reference });

    (0..shard_count)
        .map(|index| {
            let size = base + usize::from(index < remainder);
            Shard {
                index,
                session_id: SessionId::new(),
                entries: entries.by_ref().take(size).collect(),
            }
        })
        .collect()
}
