//! # Hearth Engine
//!
//! The deterministic core of the Hearth home-automation client.
//!
//! This crate owns the replicated data model and the rules that decide what a
//! replica should hold after local and remote edits meet. It performs no IO,
//! spawns nothing and reads no ambient state; the async client crate drives it.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and network live in `hearth-client`
//! - **Deterministic**: the same inputs always resolve to the same record
//! - **Testable**: every rule is a plain function over plain values
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Five collections are replicated, in this order: [`Collection::Profile`],
//! [`Collection::Preferences`], [`Collection::Rooms`], [`Collection::Devices`]
//! and the append-only [`Collection::History`]. Each entity struct carries its
//! own `dirty` flag and last sync time, and [`Record`] wraps any of them.
//!
//! ### Conflict resolution
//!
//! [`resolve_conflict`] takes the local snapshot, the remote snapshot and a
//! [`ConflictStrategy`]:
//! - [`ConflictStrategy::LocalWins`] / [`ConflictStrategy::RemoteWins`]
//! - [`ConflictStrategy::NewestWins`] - strictly newer wins, remote on ties (default)
//! - [`ConflictStrategy::Merge`] - field-level merge, newer side first
//!
//! ## Quick Start
//!
//! ```rust
//! use hearth_engine::{resolve_conflict, ConflictStrategy, Origin, Record, Room};
//!
//! let local = Record::Room(Room {
//!     id: "kitchen".into(),
//!     name: "Kitchen".into(),
//!     updated_at: 2_000,
//!     ..Default::default()
//! });
//! let remote = Record::Room(Room {
//!     id: "kitchen".into(),
//!     name: "Cuisine".into(),
//!     updated_at: 1_000,
//!     ..Default::default()
//! });
//!
//! let res = resolve_conflict(&local, &remote, ConflictStrategy::NewestWins).unwrap();
//! assert_eq!(res.origin, Origin::Local);
//! assert!(res.requires_push);
//! ```

pub mod clock;
pub mod entity;
pub mod error;
pub mod history;
pub mod resolve;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    Collection, Device, DeviceType, Entity, HistoryEvent, NotificationFlags, Position,
    Preferences, Record, RecordKey, Room, RoomType, TempUnit, Thresholds, Trigger, UserProfile,
    MAX_INTENSITY,
};
pub use error::{Error, Result};
pub use history::{device_changes, DeviceChange, HistoryAction};
pub use resolve::{resolve_conflict, ConflictStrategy, Merge, Origin, Resolution};

/// Type aliases for clarity
pub type EntityId = String;
pub type UserId = String;
pub type HistoryId = u64;

/// First history id handed out locally.
///
/// The remote numbers history events itself, from 1 upward. Ids at or above
/// this floor are placeholders until a push returns the remote's id.
pub const PROVISIONAL_HISTORY_ID: HistoryId = 1 << 62;
pub type Timestamp = u64;
