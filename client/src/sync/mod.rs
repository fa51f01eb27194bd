//! Replication between the local replica and the remote store.
//!
//! A [`SyncCoordinator`] owns one background worker. Each pass walks the
//! collections in a fixed order (profile, preferences, rooms, devices,
//! history), pushing local edits before pulling remote ones, and ends in a
//! [`SyncReport`]. Individual record failures never abort a pass; they are
//! collected in the report and the records stay dirty for the next trigger.

mod coordinator;
mod pass;
mod status;

pub use coordinator::SyncCoordinator;
pub use pass::SyncSettings;
pub use status::{
    EntityFailure, FailureCause, FailureTarget, RetryPolicy, SyncReport, SyncStatus, SyncTrigger,
};
