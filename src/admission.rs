//! Admission gate: capacity guard plus reference validation.
//!
//! The gate owns a counting semaphore. Admitting a batch takes one permit,
//! which travels inside the [`ValidatedBatch`] and is released when the batch
//! is dropped. That happens on completion, on every error path, and right away
//! when a size check rejects the batch after the permit was taken.
//!
//! ## Policies
//! - `SingleFlight`: one batch at a time; a second is rejected with
//!   `AlreadyRunning`.
//! - `Capacity { max_active }`: up to `max_active` concurrent batches; the next
//!   is rejected with `TooManyActiveSessions`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ExtractorConfig;
use crate::domain::reference::{Reference, ReferenceNormalizer};
use crate::error::{BroadsideError, Result};

/// Policy controlling how many batches may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// At most one batch in flight
    SingleFlight,
    /// At most `max_active` batches in flight
    Capacity { max_active: usize },
}

impl AdmissionPolicy {
    fn permits(&self) -> usize {
        match self {
            AdmissionPolicy::SingleFlight => 1,
            AdmissionPolicy::Capacity { max_active } => (*max_active).max(1),
        }
    }
}

/// A batch that passed admission.
#[derive(Debug)]
pub struct ValidatedBatch {
    /// Normalized, deduplicated references in submission order
    references: Vec<Reference>,
    /// Number of raw entries submitted
    submitted: usize,
    _permit: OwnedSemaphorePermit,
}

impl ValidatedBatch {
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Split into references and the admission permit. The permit must be
    /// held until the batch has finished.
    pub fn into_parts(self) -> (Vec<Reference>, OwnedSemaphorePermit) {
        (self.references, self._permit)
    }
}

/// Guards the extractor against concurrent or oversized batches.
pub struct AdmissionGate {
    policy: AdmissionPolicy,
    permits: Arc<Semaphore>,
    max_batch_size: usize,
    normalizer: ReferenceNormalizer,
}

impl AdmissionGate {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            policy: config.admission,
            permits: Arc::new(Semaphore::new(config.admission.permits())),
            max_batch_size: config.max_batch_size(),
            normalizer: ReferenceNormalizer::new(
                &config.design_extension,
                &config.thumbnail_marker,
            ),
        }
    }

    /// Number of batches currently holding a permit.
    pub fn active(&self) -> usize {
        self.policy.permits() - self.permits.available_permits()
    }

    /// Admit a batch of raw references.
    ///
    /// Checks capacity, then size, then normalizes and deduplicates. Entries
    /// that are not valid references are dropped silently.
    pub fn admit<T: AsRef<str>>(&self, raw: &[T]) -> Result<ValidatedBatch> {
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            match self.policy {
                AdmissionPolicy::SingleFlight => BroadsideError::AlreadyRunning,
                AdmissionPolicy::Capacity { max_active } => BroadsideError::TooManyActiveSessions {
                    active: self.active(),
                    max: max_active,
                },
            }
        })?;

        if raw.len() > self.max_batch_size {
            // permit dropped here
            return Err(BroadsideError::BatchTooLarge {
                count: raw.len(),
                max: self.max_batch_size,
            });
        }

        let mut seen = HashSet::with_capacity(raw.len());
        let mut references = Vec::with_capacity(raw.len());
        let mut invalid = 0usize;

        for entry in raw {
            match self.normalizer.normalize(entry.as_ref()) {
                Some(reference) => {
                    if seen.insert(reference.id.clone()) {
                        references.push(reference);
                    }
                }
                None => invalid += 1,
            }
        }

        tracing::info!(
            submitted = raw.len(),
            admitted = references.len(),
            invalid,
            duplicates = raw.len() - invalid - references.len(),
            "Batch admitted"
        );

        Ok(ValidatedBatch {
            references,
            submitted: raw.len(),
            _permit: permit,
        })
    }
}
