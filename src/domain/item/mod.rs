//! Work item aggregate - per-item state and transitions.
//!
//! This module contains the lifecycle of a single reference inside an item
//! pipeline:
//! - Work item types and states (typestate pattern)
//! - State transition methods, including the fetch retry decision

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::FetchFailure;
