#![warn(missing_docs)]
//! Shared contract between the control-plane services.
//!
//! Every service coordinates through the store only: user intent goes in,
//! observed state flows back, and the reconciliation loops of the agents
//! and builders converge the two. The `v0` module is the versioned data
//! model; `Store` is the handle every service holds. The in-memory
//! implementation stands in for the relational database behind the same
//! interface.

use chrono::{DateTime, Utc};
use snafu::Snafu;
use uuid::Uuid;

pub mod v0;

mod mem;
pub use mem::Store;

/// Errors returned by store operations
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
#[allow(missing_docs)]
pub enum StoreError {
    #[snafu(display("{} '{}' not found", kind, uuid))]
    NotFound { kind: &'static str, uuid: Uuid },
    #[snafu(display("{} '{}' already exists", kind, uuid))]
    Conflict { kind: &'static str, uuid: Uuid },
    #[snafu(display("Invalid {}: {}", kind, reason))]
    Validation { kind: &'static str, reason: String },
}

/// A record the store can hold: stable identity plus an optional
/// modification stamp
pub trait StoreRecord: Clone + Send + Sync {
    /// Stable identity of the record
    fn uuid(&self) -> Uuid;
    /// Bump the modification stamp, no-op for stamp-less records
    fn touch(&mut self, _now: DateTime<Utc>) {}
    /// Check the record before it is written
    fn validate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
