//! Force-terminate signals for running sessions.
//!
//! The batch coordinator arms one signal per session. Firing it makes the
//! session's pipeline abandon its remaining work and release the session. A
//! pipeline that finishes on its own disarms its signal first, so a deadline
//! that expires concurrently finds nothing left to fire for that session.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::domain::shard::SessionId;

/// Armed signals of every session still running in a batch.
#[derive(Clone, Default)]
pub struct TerminationRegistry {
    armed: Arc<DashMap<SessionId, CancellationToken>>,
}

impl TerminationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a signal for `session_id`.
    pub fn arm(&self, session_id: SessionId) -> ForceTerminate {
        let token = self.armed.entry(session_id).or_default().clone();
        ForceTerminate {
            session_id,
            token,
            armed: self.armed.clone(),
        }
    }

    /// Fire every armed signal, returning how many fired.
    pub fn fire_all(&self) -> usize {
        let session_ids: Vec<SessionId> = self.armed.iter().map(|entry| *entry.key()).collect();

        let mut fired = 0;
        for session_id in session_ids {
            // remove() decides the race with a concurrent disarm()
            if let Some((_, token)) = self.armed.remove(&session_id) {
                token.cancel();
                fired += 1;
                tracing::info!(session_id = %session_id, "Force-terminating session");
            }
        }
        fired
    }

    /// Number of sessions still armed.
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

/// Force-terminate signal of one session.
#[derive(Clone)]
pub struct ForceTerminate {
    session_id: SessionId,
    token: CancellationToken,
    armed: Arc<DashMap<SessionId, CancellationToken>>,
}

impl ForceTerminate {
    /// Resolves once the signal fires.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Withdraw the signal from the registry.
    ///
    /// Returns `false` if it had already been fired (or disarmed).
    pub fn disarm(&self) -> bool {
        self.armed.remove(&self.session_id).is_some()
    }
}
