//! Entity types replicated between the device and the remote store.
//!
//! Five collections are replicated: the signed-in user's profile and
//! preferences, the rooms of the home, the devices inside those rooms, and the
//! append-only history of device state changes. Each entity carries its own
//! bookkeeping (`dirty`, last sync time) so that a durable store can persist
//! it as one record.

use crate::history::HistoryAction;
use crate::{EntityId, Error, HistoryId, Timestamp, UserId, PROVISIONAL_HISTORY_ID};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound for [`Device::intensity`].
pub const MAX_INTENSITY: u8 = 100;

/// A replicated collection.
///
/// The declaration order is the sync order: parents before children, so a
/// freshly pulled room exists before its devices are pulled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Profile,
    Preferences,
    Rooms,
    Devices,
    History,
}

impl Collection {
    /// All collections in sync order.
    pub const SYNC_ORDER: [Collection; 5] = [
        Collection::Profile,
        Collection::Preferences,
        Collection::Rooms,
        Collection::Devices,
        Collection::History,
    ];

    /// Stable name used by storage and the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Profile => "profile",
            Collection::Preferences => "preferences",
            Collection::Rooms => "rooms",
            Collection::Devices => "devices",
            Collection::History => "history",
        }
    }

    /// Append-only collections are pulled incrementally and never updated.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Collection::History)
    }

    /// Collection holding the parent of records in this collection.
    pub fn parent(&self) -> Option<Collection> {
        match self {
            Collection::Devices => Some(Collection::Rooms),
            Collection::History => Some(Collection::Devices),
            _ => None,
        }
    }

    /// Collection whose records reference records in this collection.
    pub fn child(&self) -> Option<Collection> {
        match self {
            Collection::Rooms => Some(Collection::Devices),
            Collection::Devices => Some(Collection::History),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::SYNC_ORDER
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::UnknownCollection(s.to_string()))
    }
}

/// Address of one durable record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: Collection,
    pub id: EntityId,
}

impl RecordKey {
    pub fn new(collection: Collection, id: impl Into<EntityId>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }

    pub fn profile(user_id: impl Into<UserId>) -> Self {
        Self::new(Collection::Profile, user_id)
    }

    pub fn preferences(user_id: impl Into<UserId>) -> Self {
        Self::new(Collection::Preferences, user_id)
    }

    pub fn room(id: impl Into<EntityId>) -> Self {
        Self::new(Collection::Rooms, id)
    }

    pub fn device(id: impl Into<EntityId>) -> Self {
        Self::new(Collection::Devices, id)
    }

    pub fn history(id: HistoryId) -> Self {
        Self::new(Collection::History, id.to_string())
    }

    /// Numeric id of a history key.
    pub fn history_id(&self) -> crate::Result<HistoryId> {
        self.id.parse().map_err(|_| Error::InvalidKey {
            collection: self.collection,
            id: self.id.clone(),
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// The locally known user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    /// Offline PIN hash. Never leaves the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default)]
    pub dirty: bool,
}

/// Which notifications the user wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFlags {
    pub device_offline: bool,
    pub threshold_alerts: bool,
    pub security: bool,
}

/// Alert thresholds. `None` disables the alert.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default)]
    pub min_temperature: Option<f64>,
    #[serde(default)]
    pub max_temperature: Option<f64>,
    #[serde(default)]
    pub max_humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

/// Per-user application preferences.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub user_id: UserId,
    pub language: String,
    pub notifications: NotificationFlags,
    pub eco_mode: bool,
    pub temp_unit: TempUnit,
    pub thresholds: Thresholds,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default)]
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    LivingRoom,
    Bedroom,
    Kitchen,
    Bathroom,
    Office,
    Garage,
    Outdoor,
    #[default]
    Other,
}

/// Position of a room on the floor plan.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn is_origin(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// A room of the home.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RoomType,
    pub floor: i32,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default)]
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Light,
    Dimmer,
    Thermostat,
    Plug,
    Blind,
    Sensor,
    #[default]
    Other,
}

/// A controllable device placed in a room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: EntityId,
    pub room_id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceType,
    pub on: bool,
    /// Brightness or power level, `0..=100`.
    pub intensity: u8,
    #[serde(default)]
    pub temperature: Option<f64>,
    pub online: bool,
    /// When the physical state (`on`, `intensity`, `temperature`) last changed.
    pub last_state_change_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_ref: Option<String>,
}

impl Device {
    /// Set the intensity, keeping `on` consistent with it.
    pub fn set_intensity(&mut self, intensity: u8) {
        let before = self.clone();
        self.intensity = intensity;
        self.apply_power_rule(&before);
    }

    /// Reconcile `on` with an intensity change made since `before`.
    ///
    /// Dropping to zero switches the device off; rising from zero switches
    /// it on. Intensity is clamped to [`MAX_INTENSITY`].
    pub fn apply_power_rule(&mut self, before: &Device) {
        self.intensity = self.intensity.min(MAX_INTENSITY);
        if self.intensity == before.intensity {
            return;
        }
        if self.intensity == 0 {
            self.on = false;
        } else if before.intensity == 0 {
            self.on = true;
        }
    }

    /// Whether the physical state differs from `other`.
    pub fn state_differs(&self, other: &Device) -> bool {
        self.on != other.on
            || self.intensity != other.intensity
            || self.temperature != other.temperature
    }
}

/// Who caused a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    User,
    Automation,
    Sync,
    Schedule,
}

/// One recorded device state change. Immutable apart from sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub id: HistoryId,
    pub device_id: EntityId,
    pub action: HistoryAction,
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    pub occurred_at: Timestamp,
    pub triggered_by: Trigger,
    #[serde(default)]
    pub actor_id: Option<UserId>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

impl HistoryEvent {
    /// Whether the id was allocated locally and the remote has not assigned
    /// the event its own id yet.
    pub fn is_provisional(&self) -> bool {
        self.id >= PROVISIONAL_HISTORY_ID
    }
}

/// Any replicated entity, tagged with its collection.
///
/// This is the unit that stores, caches and remotes exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection")]
pub enum Record {
    #[serde(rename = "profile")]
    Profile(UserProfile),
    #[serde(rename = "preferences")]
    Preferences(Preferences),
    #[serde(rename = "rooms")]
    Room(Room),
    #[serde(rename = "devices")]
    Device(Device),
    #[serde(rename = "history")]
    History(HistoryEvent),
}

impl Record {
    /// An empty record for `key`, used when a write targets an id nobody has
    /// loaded yet.
    pub fn placeholder(key: &RecordKey) -> crate::Result<Self> {
        let id = key.id.clone();
        Ok(match key.collection {
            Collection::Profile => Record::Profile(UserProfile {
                id,
                ..Default::default()
            }),
            Collection::Preferences => Record::Preferences(Preferences {
                user_id: id,
                ..Default::default()
            }),
            Collection::Rooms => Record::Room(Room {
                id,
                ..Default::default()
            }),
            Collection::Devices => Record::Device(Device {
                id,
                ..Default::default()
            }),
            Collection::History => Record::History(HistoryEvent {
                id: key.history_id()?,
                ..Default::default()
            }),
        })
    }

    pub fn collection(&self) -> Collection {
        match self {
            Record::Profile(_) => Collection::Profile,
            Record::Preferences(_) => Collection::Preferences,
            Record::Room(_) => Collection::Rooms,
            Record::Device(_) => Collection::Devices,
            Record::History(_) => Collection::History,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Record::Profile(p) => p.id.clone(),
            Record::Preferences(p) => p.user_id.clone(),
            Record::Room(r) => r.id.clone(),
            Record::Device(d) => d.id.clone(),
            Record::History(h) => h.id.to_string(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection(), self.id())
    }

    /// Key of the record this one references, if any.
    pub fn parent_key(&self) -> Option<RecordKey> {
        match self {
            Record::Device(d) => Some(RecordKey::room(d.room_id.clone())),
            Record::History(h) => Some(RecordKey::device(h.device_id.clone())),
            _ => None,
        }
    }

    /// Last metadata mutation time.
    pub fn updated_at(&self) -> Timestamp {
        match self {
            Record::Profile(p) => p.updated_at,
            Record::Preferences(p) => p.updated_at,
            Record::Room(r) => r.updated_at,
            Record::Device(d) => d.updated_at,
            Record::History(h) => h.occurred_at,
        }
    }

    /// The timestamp conflict resolution compares.
    ///
    /// Devices use the physical-state change time so that a rename on one
    /// side cannot override a more recent switch flip on the other.
    pub fn conflict_timestamp(&self) -> Timestamp {
        match self {
            Record::Device(d) => d.last_state_change_at,
            other => other.updated_at(),
        }
    }

    /// Bump the mutation time to `now` without ever moving it backwards.
    pub fn touch(&mut self, now: Timestamp) {
        match self {
            Record::Profile(p) => p.updated_at = p.updated_at.max(now),
            Record::Preferences(p) => p.updated_at = p.updated_at.max(now),
            Record::Room(r) => r.updated_at = r.updated_at.max(now),
            Record::Device(d) => d.updated_at = d.updated_at.max(now),
            // history is immutable
            Record::History(_) => {}
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Record::Profile(p) => p.dirty,
            Record::Preferences(p) => p.dirty,
            Record::Room(r) => r.dirty,
            Record::Device(d) => d.dirty,
            Record::History(h) => h.dirty,
        }
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        match self {
            Record::Profile(p) => p.dirty = dirty,
            Record::Preferences(p) => p.dirty = dirty,
            Record::Room(r) => r.dirty = dirty,
            Record::Device(d) => d.dirty = dirty,
            Record::History(h) => h.dirty = dirty,
        }
    }

    pub fn last_sync_at(&self) -> Option<Timestamp> {
        match self {
            Record::Profile(p) => p.last_sync_at,
            Record::Preferences(p) => p.last_sync_at,
            Record::Room(r) => r.last_sync_at,
            Record::Device(d) => d.last_sync_at,
            Record::History(h) => h.synced_at,
        }
    }

    fn set_last_sync_at(&mut self, at: Option<Timestamp>) {
        match self {
            Record::Profile(p) => p.last_sync_at = at,
            Record::Preferences(p) => p.last_sync_at = at,
            Record::Room(r) => r.last_sync_at = at,
            Record::Device(d) => d.last_sync_at = at,
            Record::History(h) => h.synced_at = at,
        }
    }

    /// Record acknowledgement by the remote at `at`.
    pub fn mark_synced(&mut self, at: Timestamp) {
        self.set_dirty(false);
        self.set_last_sync_at(Some(at));
    }

    /// The value as the remote should see it: bookkeeping cleared and
    /// device-local fields removed.
    pub fn sync_view(&self) -> Record {
        let mut view = self.clone();
        view.set_dirty(false);
        view.set_last_sync_at(None);
        if let Record::Profile(p) = &mut view {
            p.secret_hash = None;
        }
        view
    }

    /// Equality of replicated content, ignoring bookkeeping and local-only
    /// fields.
    pub fn content_eq(&self, other: &Record) -> bool {
        self.sync_view() == other.sync_view()
    }

    /// Copy fields that exist only on this device from `local`.
    pub fn keep_local_fields(&mut self, local: &Record) {
        if let (Record::Profile(mine), Record::Profile(theirs)) = (self, local) {
            mine.secret_hash = theirs.secret_hash.clone();
        }
    }
}

/// Typed access to one entity kind inside a [`Record`].
pub trait Entity: Clone + Into<Record> + Sized {
    const COLLECTION: Collection;

    fn entity_id(&self) -> EntityId;

    fn key(&self) -> RecordKey {
        RecordKey::new(Self::COLLECTION, self.entity_id())
    }

    fn from_record(record: Record) -> Option<Self>;

    fn from_record_mut(record: &mut Record) -> Option<&mut Self>;
}

macro_rules! impl_entity {
    ($ty:ty, $variant:ident, $collection:expr, |$this:ident| $id:expr) => {
        impl Entity for $ty {
            const COLLECTION: Collection = $collection;

            fn entity_id(&self) -> EntityId {
                let $this = self;
                $id
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_record_mut(record: &mut Record) -> Option<&mut Self> {
                match record {
                    Record::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Record {
            fn from(value: $ty) -> Self {
                Record::$variant(value)
            }
        }
    };
}

impl_entity!(UserProfile, Profile, Collection::Profile, |p| p.id.clone());
impl_entity!(Preferences, Preferences, Collection::Preferences, |p| p
    .user_id
    .clone());
impl_entity!(Room, Room, Collection::Rooms, |r| r.id.clone());
impl_entity!(Device, Device, Collection::Devices, |d| d.id.clone());
impl_entity!(HistoryEvent, History, Collection::History, |h| h
    .id
    .to_string());
