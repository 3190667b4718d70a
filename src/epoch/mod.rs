//! Epoch-based thread protection
//!
//! This module implements the LightEpoch mechanism: a fixed table of
//! per-thread protection records, a global epoch counter, and a small list
//! of deferred actions that fire once every protected thread has moved past
//! the epoch at which they were registered.

mod drain;
mod light_epoch;
mod table;

pub use light_epoch::{EpochGuard, LightEpoch};
pub use table::UNPROTECTED;
