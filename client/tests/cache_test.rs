//! Integration tests for the cache as wired up by the application context.

use hearth_client::cache::{CacheEvent, Lookup};
use hearth_client::remote::{MemoryRemote, StaticIdentity};
use hearth_client::store::{DurableStore, SqliteStore};
use hearth_client::{AppContext, Config, ErrorCode};
use hearth_engine::clock::MINUTE;
use hearth_engine::{Collection, Device, HistoryEvent, ManualClock, Record, RecordKey, Room};
use std::sync::Arc;

const START: u64 = 1_706_745_600_000;

async fn context(clock: &ManualClock) -> (AppContext, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open("sqlite::memory:").await.unwrap());
    (context_over(store.clone(), clock), store)
}

fn context_over(store: Arc<SqliteStore>, clock: &ManualClock) -> AppContext {
    AppContext::with_clock(
        Config::default(),
        store,
        Arc::new(MemoryRemote::new()),
        Arc::new(StaticIdentity::new(None)),
        Arc::new(clock.clone()),
    )
}

fn room(id: &str, name: &str) -> Record {
    Record::Room(Room {
        id: id.into(),
        name: name.into(),
        ..Default::default()
    })
}

fn device(id: &str, room_id: &str) -> Record {
    Record::Device(Device {
        id: id.into(),
        room_id: room_id.into(),
        on: true,
        intensity: 80,
        ..Default::default()
    })
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_read_your_writes_before_persist() {
        let clock = ManualClock::new(START);
        let (ctx, store) = context(&clock).await;
        store.upsert(&room("hall", "Hall")).await.unwrap();
        store.upsert(&device("spot", "hall")).await.unwrap();
        let key = RecordKey::device("spot");

        ctx.write_through(&key, |r| {
            if let Record::Device(d) = r {
                d.intensity = 0;
            }
        })
        .await
        .unwrap();

        let Some(Record::Device(cached)) = ctx.get_cached(&key).await.unwrap() else {
            panic!("expected device");
        };
        assert_eq!(cached.intensity, 0);
        assert!(!cached.on);
        assert!(cached.dirty);

        ctx.cache().flush().await.unwrap();
        let Some(Record::Device(stored)) = store.get(&key).await.unwrap() else {
            panic!("expected device");
        };
        assert!(!stored.on);
        assert_eq!(store.list(Collection::History).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_raising_intensity_turns_device_on() {
        let clock = ManualClock::new(START);
        let (ctx, store) = context(&clock).await;
        store.upsert(&room("hall", "Hall")).await.unwrap();
        store
            .upsert(&Record::Device(Device {
                id: "spot".into(),
                room_id: "hall".into(),
                on: false,
                intensity: 0,
                ..Default::default()
            }))
            .await
            .unwrap();

        let written = ctx
            .write_through(&RecordKey::device("spot"), |r| {
                if let Record::Device(d) = r {
                    d.set_intensity(30);
                }
            })
            .await
            .unwrap();
        let Record::Device(written) = written else {
            panic!("expected device");
        };
        assert!(written.on);
        assert_eq!(written.intensity, 30);
    }

    #[tokio::test]
    async fn test_store_changes_reach_the_cache() {
        let clock = ManualClock::new(START);
        let (ctx, store) = context(&clock).await;
        store.upsert(&room("hall", "Hall")).await.unwrap();
        let key = RecordKey::room("hall");
        ctx.get_cached(&key).await.unwrap();

        let mut sub = ctx.subscribe(key.clone());
        store.upsert(&room("hall", "Entrance")).await.unwrap();

        // the follower may still be replaying the first upsert
        loop {
            match sub.next_event().await {
                Some(CacheEvent::Updated(Record::Room(r))) if r.name == "Entrance" => break,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
        let Lookup::Fresh(Record::Room(cached)) = ctx.cache().peek(&key) else {
            panic!("expected fresh entry");
        };
        assert_eq!(cached.name, "Entrance");
    }

    #[tokio::test]
    async fn test_room_delete_cascades() {
        let clock = ManualClock::new(START);
        let (ctx, store) = context(&clock).await;
        store.upsert(&room("hall", "Hall")).await.unwrap();
        store.upsert(&device("spot", "hall")).await.unwrap();
        store
            .upsert(&Record::History(HistoryEvent {
                id: 1,
                device_id: "spot".into(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let device_key = RecordKey::device("spot");
        ctx.get_cached(&device_key).await.unwrap();
        let mut sub = ctx.subscribe(device_key.clone());

        assert!(store.delete(&RecordKey::room("hall")).await.unwrap());
        loop {
            match sub.next_event().await {
                Some(CacheEvent::Invalidated(key)) => {
                    assert_eq!(key, device_key);
                    break;
                }
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }

        assert!(store
            .children(Collection::Devices, "hall")
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .children(Collection::History, "spot")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(ctx.get_cached(&device_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_to_missing_room_is_rejected() {
        let clock = ManualClock::new(START);
        let (ctx, _store) = context(&clock).await;

        let err = ctx
            .write_through(&RecordKey::device("ghost"), |r| {
                if let Record::Device(d) = r {
                    d.room_id = "attic".into();
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ForeignKeyViolation);
    }

    #[tokio::test]
    async fn test_stats_follow_the_ttl() {
        let clock = ManualClock::new(START);
        let store = Arc::new(SqliteStore::open("sqlite::memory:").await.unwrap());
        store.upsert(&room("hall", "Hall")).await.unwrap();
        store.upsert(&room("attic", "Attic")).await.unwrap();
        let ctx = context_over(store, &clock);

        assert_eq!(ctx.cache().refresh(Collection::Rooms).await.unwrap(), 2);
        clock.advance(10 * MINUTE);
        ctx.get_cached(&RecordKey::room("unknown")).await.unwrap();
        let stats = ctx.cache().stats();
        assert_eq!((stats.total, stats.valid, stats.expired), (2, 2, 0));

        clock.advance(6 * MINUTE);
        let stats = ctx.cache().stats();
        assert_eq!((stats.valid, stats.expired), (0, 2));
        assert_eq!(stats.last_full_refresh, START);

        ctx.cache().invalidate_all();
        let stats = ctx.cache().stats();
        assert_eq!(
            (stats.total, stats.valid, stats.expired, stats.last_full_refresh),
            (0, 0, 0, 0)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rapid_writes_never_read_back_older_values() {
        let clock = ManualClock::new(START);
        let (ctx, store) = context(&clock).await;
        store.upsert(&room("hall", "Hall")).await.unwrap();
        store.upsert(&device("spot", "hall")).await.unwrap();
        let key = RecordKey::device("spot");

        // each write races the follower replaying the one before it
        for level in 1..=50u8 {
            clock.advance(1);
            ctx.write_through(&key, |r| {
                if let Record::Device(d) = r {
                    d.set_intensity(level);
                }
            })
            .await
            .unwrap();
            tokio::task::yield_now().await;

            let Some(Record::Device(cached)) = ctx.get_cached(&key).await.unwrap() else {
                panic!("expected device");
            };
            assert_eq!(cached.intensity, level);
        }

        ctx.cache().flush().await.unwrap();
        let Some(Record::Device(stored)) = store.get(&key).await.unwrap() else {
            panic!("expected device");
        };
        assert_eq!(stored.intensity, 50);
    }
}
