//! Core domain types for the extraction pipeline.
//!
//! This module contains pure domain types with no host or I/O dependencies:
//! - References and their normalization
//! - Shards and session identifiers
//! - Work item typestate machine
//! - Outcomes and outcome buckets

pub mod item;
pub mod outcome;
pub mod reference;
pub mod shard;
