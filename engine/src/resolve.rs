//! Conflict resolution between a local and a remote version of one record.
//!
//! This is the core of determinism. Given the local snapshot, the remote
//! snapshot and a strategy, [`resolve_conflict`] always produces the same
//! resolution. It holds no state and performs no IO.
//!
//! # Algorithm
//!
//! 1. Check both sides address the same record
//! 2. Pick a winner (or build a field-level merge) per strategy
//! 3. Copy device-local fields over from the local side
//! 4. Flag a push when the result differs from what the remote holds

use crate::entity::{Device, HistoryEvent, Preferences, Record, Room, Thresholds, UserProfile};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// Strategy for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The local version always wins
    LocalWins,
    /// The remote version always wins
    RemoteWins,
    /// Strictly newer conflict timestamp wins; ties go to the remote (default)
    #[default]
    NewestWins,
    /// Field-level merge, newer side's populated fields first
    Merge,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local_wins" => Ok(ConflictStrategy::LocalWins),
            "remote_wins" => Ok(ConflictStrategy::RemoteWins),
            "newest_wins" => Ok(ConflictStrategy::NewestWins),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// Where the resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
    Merged,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The value both replicas should converge on
    pub resolved: Record,
    /// Which side produced it
    pub origin: Origin,
    /// Whether the remote must be told about it
    pub requires_push: bool,
}

/// Resolve a conflict between `local` and `remote`.
///
/// The resolved record is marked dirty exactly when it must be pushed.
pub fn resolve_conflict(
    local: &Record,
    remote: &Record,
    strategy: ConflictStrategy,
) -> Result<Resolution> {
    let (local_key, remote_key) = (local.key(), remote.key());
    if local_key != remote_key {
        return Err(Error::KeyMismatch {
            local: local_key,
            remote: remote_key,
        });
    }

    let (mut resolved, origin) = match strategy {
        ConflictStrategy::LocalWins => (local.clone(), Origin::Local),
        ConflictStrategy::RemoteWins => (remote.clone(), Origin::Remote),
        ConflictStrategy::NewestWins => {
            match local.conflict_timestamp().cmp(&remote.conflict_timestamp()) {
                Ordering::Greater => (local.clone(), Origin::Local),
                // Ties go to the authoritative side so they never cause a push
                Ordering::Less | Ordering::Equal => (remote.clone(), Origin::Remote),
            }
        }
        ConflictStrategy::Merge => (merge_records(local, remote), Origin::Merged),
    };

    resolved.keep_local_fields(local);
    let requires_push = !resolved.content_eq(remote);
    resolved.set_dirty(requires_push);

    Ok(Resolution {
        resolved,
        origin,
        requires_push,
    })
}

/// Field-level merge of two versions of one entity.
///
/// `primary` is the more recent side; `secondary` fills whatever the primary
/// leaves empty.
pub trait Merge {
    fn merge(primary: &Self, secondary: &Self) -> Self;
}

fn merge_records(local: &Record, remote: &Record) -> Record {
    let (primary, secondary) = if local.conflict_timestamp() > remote.conflict_timestamp() {
        (local, remote)
    } else {
        (remote, local)
    };

    match (primary, secondary) {
        (Record::Profile(p), Record::Profile(s)) => Record::Profile(UserProfile::merge(p, s)),
        (Record::Preferences(p), Record::Preferences(s)) => {
            Record::Preferences(Preferences::merge(p, s))
        }
        (Record::Room(p), Record::Room(s)) => Record::Room(Room::merge(p, s)),
        (Record::Device(p), Record::Device(s)) => Record::Device(Device::merge(p, s)),
        (Record::History(p), Record::History(s)) => Record::History(HistoryEvent::merge(p, s)),
        // keys were checked equal, so variants match
        _ => primary.clone(),
    }
}

fn text(primary: &str, secondary: &str) -> String {
    if primary.is_empty() {
        secondary.to_string()
    } else {
        primary.to_string()
    }
}

fn opt<T: Clone>(primary: &Option<T>, secondary: &Option<T>) -> Option<T> {
    primary.clone().or_else(|| secondary.clone())
}

fn non_default<T: Copy + Default + PartialEq>(primary: T, secondary: T) -> T {
    if primary == T::default() {
        secondary
    } else {
        primary
    }
}

fn earliest_known(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    }
}

impl Merge for UserProfile {
    fn merge(p: &Self, s: &Self) -> Self {
        UserProfile {
            id: p.id.clone(),
            name: text(&p.name, &s.name),
            email: text(&p.email, &s.email),
            photo_ref: opt(&p.photo_ref, &s.photo_ref),
            secret_hash: opt(&p.secret_hash, &s.secret_hash),
            created_at: earliest_known(p.created_at, s.created_at),
            updated_at: p.updated_at.max(s.updated_at),
            last_sync_at: p.last_sync_at.max(s.last_sync_at),
            dirty: false,
        }
    }
}

impl Merge for Preferences {
    fn merge(p: &Self, s: &Self) -> Self {
        Preferences {
            user_id: p.user_id.clone(),
            language: text(&p.language, &s.language),
            // flags and units have no "unset" value, the newer side decides
            notifications: p.notifications,
            eco_mode: p.eco_mode,
            temp_unit: p.temp_unit,
            thresholds: Thresholds {
                min_temperature: opt(&p.thresholds.min_temperature, &s.thresholds.min_temperature),
                max_temperature: opt(&p.thresholds.max_temperature, &s.thresholds.max_temperature),
                max_humidity: opt(&p.thresholds.max_humidity, &s.thresholds.max_humidity),
            },
            updated_at: p.updated_at.max(s.updated_at),
            last_sync_at: p.last_sync_at.max(s.last_sync_at),
            dirty: false,
        }
    }
}

impl Merge for Room {
    fn merge(p: &Self, s: &Self) -> Self {
        Room {
            id: p.id.clone(),
            name: text(&p.name, &s.name),
            kind: non_default(p.kind, s.kind),
            floor: non_default(p.floor, s.floor),
            position: if p.position.is_origin() {
                s.position
            } else {
                p.position
            },
            color: opt(&p.color, &s.color),
            updated_at: p.updated_at.max(s.updated_at),
            last_sync_at: p.last_sync_at.max(s.last_sync_at),
            dirty: false,
        }
    }
}

impl Merge for Device {
    fn merge(p: &Self, s: &Self) -> Self {
        Device {
            id: p.id.clone(),
            room_id: text(&p.room_id, &s.room_id),
            name: text(&p.name, &s.name),
            kind: non_default(p.kind, s.kind),
            // physical state moves as one unit so `on` and `intensity` stay coherent
            on: p.on,
            intensity: p.intensity,
            temperature: p.temperature,
            online: p.online,
            last_state_change_at: p.last_state_change_at.max(s.last_state_change_at),
            updated_at: p.updated_at.max(s.updated_at),
            last_sync_at: p.last_sync_at.max(s.last_sync_at),
            dirty: false,
            hardware_ref: opt(&p.hardware_ref, &s.hardware_ref),
        }
    }
}

impl Merge for HistoryEvent {
    fn merge(p: &Self, s: &Self) -> Self {
        HistoryEvent {
            dirty: false,
            synced_at: p.synced_at.max(s.synced_at),
            ..p.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DeviceType, Position, RoomType};

    fn room(name: &str, updated_at: u64) -> Room {
        Room {
            id: "living".into(),
            name: name.into(),
            kind: RoomType::LivingRoom,
            floor: 1,
            position: Position { x: 2.0, y: 3.0 },
            updated_at,
            ..Default::default()
        }
    }

    fn lamp(on: bool, intensity: u8, changed_at: u64, updated_at: u64) -> Device {
        Device {
            id: "lamp".into(),
            room_id: "living".into(),
            name: "Lamp".into(),
            kind: DeviceType::Dimmer,
            on,
            intensity,
            online: true,
            last_state_change_at: changed_at,
            updated_at,
            ..Default::default()
        }
    }

    #[test]
    fn newest_wins_local() {
        let local = Record::Room(room("Lounge", 2_000));
        let remote = Record::Room(room("Living room", 1_000));

        let res = resolve_conflict(&local, &remote, ConflictStrategy::NewestWins).unwrap();
        assert_eq!(res.origin, Origin::Local);
        assert!(res.requires_push);
        assert!(res.resolved.is_dirty());
        assert!(res.resolved.content_eq(&local));
    }

    #[test]
    fn newest_wins_remote() {
        let local = Record::Room(room("Lounge", 1_000));
        let remote = Record::Room(room("Living room", 2_000));

        let res = resolve_conflict(&local, &remote, ConflictStrategy::NewestWins).unwrap();
        assert_eq!(res.origin, Origin::Remote);
        assert!(!res.requires_push);
        assert!(!res.resolved.is_dirty());
        assert!(res.resolved.content_eq(&remote));
    }

    #[test]
    fn newest_wins_tie_goes_to_remote() {
        let local = Record::Room(room("Lounge", 1_000));
        let remote = Record::Room(room("Living room", 1_000));

        let res = resolve_conflict(&local, &remote, ConflictStrategy::NewestWins).unwrap();
        assert_eq!(res.origin, Origin::Remote);
        assert!(!res.requires_push);
    }

    #[test]
    fn local_wins_without_difference_needs_no_push() {
        let local = Record::Room(Room {
            dirty: true,
            ..room("Lounge", 1_000)
        });
        let remote = Record::Room(room("Lounge", 1_000));

        let res = resolve_conflict(&local, &remote, ConflictStrategy::LocalWins).unwrap();
        assert_eq!(res.origin, Origin::Local);
        assert!(!res.requires_push);
        assert!(!res.resolved.is_dirty());
    }

    #[test]
    fn remote_wins_always() {
        let local = Record::Room(room("Lounge", 9_000));
        let remote = Record::Room(room("Living room", 1_000));

        let res = resolve_conflict(&local, &remote, ConflictStrategy::RemoteWins).unwrap();
        assert_eq!(res.origin, Origin::Remote);
        assert!(!res.requires_push);
        assert!(res.resolved.content_eq(&remote));
    }

    #[test]
    fn device_compares_state_change_not_metadata() {
        // local renamed later, remote flipped the switch later
        let mut local = lamp(true, 80, 1_000, 5_000);
        local.name = "Renamed".into();
        let remote = lamp(false, 0, 3_000, 3_000);

        let res = resolve_conflict(
            &Record::Device(local),
            &Record::Device(remote.clone()),
            ConflictStrategy::NewestWins,
        )
        .unwrap();
        assert_eq!(res.origin, Origin::Remote);
        assert!(res.resolved.content_eq(&Record::Device(remote)));
    }

    #[test]
    fn merge_fills_gaps_from_older_side() {
        let local = Record::Room(Room {
            color: Some("#ffcc00".into()),
            ..room("Lounge", 1_000)
        });
        let remote = Record::Room(Room {
            name: String::new(),
            floor: 0,
            ..room("", 2_000)
        });

        let res = resolve_conflict(&local, &remote, ConflictStrategy::Merge).unwrap();
        assert_eq!(res.origin, Origin::Merged);
        assert!(res.requires_push);

        let Record::Room(merged) = res.resolved else {
            panic!("expected room");
        };
        assert_eq!(merged.name, "Lounge");
        assert_eq!(merged.floor, 1);
        assert_eq!(merged.color.as_deref(), Some("#ffcc00"));
        assert_eq!(merged.updated_at, 2_000);
    }

    #[test]
    fn merge_takes_device_state_as_unit() {
        let local = lamp(true, 70, 4_000, 4_000);
        let remote = Device {
            hardware_ref: Some("zb:01".into()),
            ..lamp(false, 0, 2_000, 6_000)
        };

        let res = resolve_conflict(
            &Record::Device(local),
            &Record::Device(remote),
            ConflictStrategy::Merge,
        )
        .unwrap();

        let Record::Device(merged) = res.resolved else {
            panic!("expected device");
        };
        assert!(merged.on);
        assert_eq!(merged.intensity, 70);
        assert_eq!(merged.hardware_ref.as_deref(), Some("zb:01"));
        assert_eq!(merged.updated_at, 6_000);
        assert_eq!(merged.last_state_change_at, 4_000);
    }

    #[test]
    fn merge_preferences_thresholds_per_field() {
        let local = Preferences {
            user_id: "u1".into(),
            language: "fr".into(),
            eco_mode: true,
            thresholds: Thresholds {
                min_temperature: Some(16.0),
                ..Default::default()
            },
            updated_at: 1_000,
            ..Default::default()
        };
        let remote = Preferences {
            user_id: "u1".into(),
            language: String::new(),
            eco_mode: false,
            thresholds: Thresholds {
                max_temperature: Some(27.0),
                ..Default::default()
            },
            updated_at: 2_000,
            ..Default::default()
        };

        let res = resolve_conflict(
            &Record::Preferences(local),
            &Record::Preferences(remote),
            ConflictStrategy::Merge,
        )
        .unwrap();
        let Record::Preferences(merged) = res.resolved else {
            panic!("expected preferences");
        };
        assert_eq!(merged.language, "fr");
        assert!(!merged.eco_mode);
        assert_eq!(merged.thresholds.min_temperature, Some(16.0));
        assert_eq!(merged.thresholds.max_temperature, Some(27.0));
    }

    #[test]
    fn profile_secret_survives_remote_win() {
        let local = UserProfile {
            id: "u1".into(),
            name: "Ada".into(),
            secret_hash: Some("hash".into()),
            updated_at: 1_000,
            ..Default::default()
        };
        let remote = UserProfile {
            id: "u1".into(),
            name: "Ada L.".into(),
            updated_at: 2_000,
            ..Default::default()
        };

        let res = resolve_conflict(
            &Record::Profile(local),
            &Record::Profile(remote),
            ConflictStrategy::NewestWins,
        )
        .unwrap();
        assert!(!res.requires_push);
        let Record::Profile(resolved) = res.resolved else {
            panic!("expected profile");
        };
        assert_eq!(resolved.name, "Ada L.");
        assert_eq!(resolved.secret_hash.as_deref(), Some("hash"));
    }

    #[test]
    fn mismatched_keys_rejected() {
        let local = Record::Room(room("A", 1));
        let mut other = room("B", 1);
        other.id = "kitchen".into();
        let err = resolve_conflict(&local, &Record::Room(other), ConflictStrategy::Merge)
            .unwrap_err();
        assert!(matches!(err, Error::KeyMismatch { .. }));
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "newest_wins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::NewestWins
        );
        assert_eq!(
            "MERGE".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::Merge
        );
        assert!("coin_flip".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::NewestWins);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_room(updated_at: u64) -> impl Strategy<Value = Room> {
            (
                prop_oneof![Just(String::new()), "[a-z]{1,8}"],
                -2i32..5,
                prop::option::of("#[0-9a-f]{6}"),
            )
                .prop_map(move |(name, floor, color)| Room {
                    id: "r".into(),
                    name,
                    floor,
                    color,
                    updated_at,
                    ..Default::default()
                })
        }

        fn arb_device(changed_at: u64) -> impl Strategy<Value = Device> {
            (any::<bool>(), 0u8..=100, any::<bool>(), "[a-z]{0,6}").prop_map(
                move |(on, intensity, online, name)| Device {
                    id: "d".into(),
                    room_id: "r".into(),
                    name,
                    on,
                    intensity,
                    online,
                    last_state_change_at: changed_at,
                    updated_at: changed_at,
                    ..Default::default()
                },
            )
        }

        proptest! {
            #[test]
            fn prop_newest_wins_prefers_strictly_newer_local(
                remote_ts in 0u64..10_000,
                delta in 1u64..10_000,
                local in arb_room(0),
                remote in arb_room(0),
            ) {
                let local = Record::Room(Room { updated_at: remote_ts + delta, ..local });
                let remote = Record::Room(Room { updated_at: remote_ts, ..remote });

                let res = resolve_conflict(&local, &remote, ConflictStrategy::NewestWins).unwrap();
                prop_assert_eq!(res.origin, Origin::Local);
                prop_assert!(res.resolved.content_eq(&local));
                prop_assert_eq!(res.requires_push, !res.resolved.content_eq(&remote));
            }

            #[test]
            fn prop_merge_deterministic_on_ties(
                ts in 0u64..10_000,
                local in arb_device(0),
                remote in arb_device(0),
            ) {
                let local = Record::Device(Device { last_state_change_at: ts, ..local });
                let remote = Record::Device(Device { last_state_change_at: ts, ..remote });

                let first = resolve_conflict(&local, &remote, ConflictStrategy::Merge).unwrap();
                let second = resolve_conflict(&local, &remote, ConflictStrategy::Merge).unwrap();
                prop_assert_eq!(&first, &second);

                // merging the result again changes nothing
                let again = resolve_conflict(&first.resolved, &remote, ConflictStrategy::Merge).unwrap();
                prop_assert!(again.resolved.content_eq(&first.resolved));
            }

            #[test]
            fn prop_requires_push_iff_differs_from_remote(
                local_ts in 0u64..100,
                remote_ts in 0u64..100,
                local in arb_room(0),
                remote in arb_room(0),
                strategy in prop_oneof![
                    Just(ConflictStrategy::LocalWins),
                    Just(ConflictStrategy::RemoteWins),
                    Just(ConflictStrategy::NewestWins),
                    Just(ConflictStrategy::Merge),
                ],
            ) {
                let local = Record::Room(Room { updated_at: local_ts, ..local });
                let remote = Record::Room(Room { updated_at: remote_ts, ..remote });

                let res = resolve_conflict(&local, &remote, strategy).unwrap();
                prop_assert_eq!(res.requires_push, !res.resolved.content_eq(&remote));
                prop_assert_eq!(res.resolved.is_dirty(), res.requires_push);
            }
        }
    }
}
