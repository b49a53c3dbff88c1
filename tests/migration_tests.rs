/// Schema migration tests
///
/// Forward migration during load, stepwise version advancement, and
/// idempotence across partially-migrated payloads.
/// Run with: cargo test --test migration_tests
use std::sync::Arc;

use keysync::{
    EngineConfig, KeySync, MemoryRemote, Metadata, RecordHandle, StoreConfig, StoredValue,
};
use serde_json::json;

async fn drive_load(engine: &KeySync, record: &RecordHandle) -> bool {
    let rec = record.clone();
    let handle = tokio::spawn(async move { rec.load().await });
    for _ in 0..200 {
        engine.tick().await;
        tokio::task::yield_now().await;
        if handle.is_finished() {
            return handle.await.unwrap().unwrap();
        }
    }
    panic!("load did not resolve");
}

async fn seed(remote: &MemoryRemote, store: &str, key: &str, data: serde_json::Value, version: u32) {
    use keysync::{RemoteStore, Transform};

    // Pre-existing remote value with no live session, as left behind by
    // a cleanly-released previous owner.
    let value = StoredValue {
        data,
        metadata: Metadata {
            session: None,
            session_started_at: 0,
            data_version: version,
            extra: serde_json::Map::new(),
        },
        user_ids: Vec::new(),
    };
    remote
        .update(store, key, Box::new(move |_| Transform::Write(value.clone())))
        .await
        .unwrap();
}

fn gems_store(engine: &KeySync) -> keysync::StoreHandle {
    engine
        .store(
            StoreConfig::new("players")
                .with_template_data(json!({"coins": 0, "gems": 0}))
                .with_migration(|data| {
                    data["gems"] = json!(0);
                    Ok(())
                }),
        )
        .unwrap()
}

#[tokio::test]
async fn stored_v0_is_migrated_to_v1_on_load() {
    let remote = Arc::new(MemoryRemote::new());
    seed(&remote, "players", "1", json!({"coins": 5}), 0).await;

    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = gems_store(&engine);

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);

    assert_eq!(record.data().unwrap(), json!({"coins": 5, "gems": 0}));
    let stored = remote.peek("players", "1").unwrap();
    assert_eq!(stored.metadata.data_version, 1);
}

#[tokio::test]
async fn already_latest_version_is_not_remigrated() {
    let remote = Arc::new(MemoryRemote::new());
    // Stored at version 1 with gems already spent: re-running the
    // migration would zero them out.
    seed(&remote, "players", "1", json!({"coins": 5, "gems": 9}), 1).await;

    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = gems_store(&engine);

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);
    assert_eq!(record.data().unwrap()["gems"], json!(9));
}

#[tokio::test]
async fn resumed_mid_chain_matches_single_pass() {
    let chain = |engine: &KeySync| {
        engine
            .store(
                StoreConfig::new("players")
                    .with_template_data(json!({}))
                    .with_migration(|data| {
                        data["a"] = json!(1);
                        Ok(())
                    })
                    .with_migration(|data| {
                        data["b"] = json!(2);
                        Ok(())
                    })
                    .with_migration(|data| {
                        data["c"] = json!(3);
                        Ok(())
                    }),
            )
            .unwrap()
    };

    // One payload frozen after step one (version 1), another at version 0.
    let remote = Arc::new(MemoryRemote::new());
    seed(&remote, "players", "resumed", json!({"a": 1}), 1).await;
    seed(&remote, "players", "fresh", json!({}), 0).await;

    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = chain(&engine);

    let resumed = store.open("resumed").unwrap();
    assert!(drive_load(&engine, &resumed).await);
    let fresh = store.open("fresh").unwrap();
    assert!(drive_load(&engine, &fresh).await);

    assert_eq!(resumed.data().unwrap(), json!({"a": 1, "b": 2, "c": 3}));
    assert_eq!(fresh.data().unwrap(), json!({"a": 1, "b": 2, "c": 3}));
    assert_eq!(remote.peek("players", "resumed").unwrap().metadata.data_version, 3);
    assert_eq!(remote.peek("players", "fresh").unwrap().metadata.data_version, 3);
}

#[tokio::test]
async fn fresh_key_starts_at_latest_version() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = gems_store(&engine);

    let record = store.open("new").unwrap();
    assert!(drive_load(&engine, &record).await);

    // Templates are born at the latest version; no migration ran.
    let stored = remote.peek("players", "new").unwrap();
    assert_eq!(stored.metadata.data_version, 1);
    assert_eq!(stored.data, json!({"coins": 0, "gems": 0}));
}

#[tokio::test]
async fn failing_migration_fails_the_load() {
    let remote = Arc::new(MemoryRemote::new());
    seed(&remote, "players", "1", json!({"coins": 5}), 0).await;

    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = engine
        .store(
            StoreConfig::new("players")
                .with_template_data(json!({}))
                .with_migration(|_| {
                    Err(keysync::SyncError::MigrationFailed {
                        index: 0,
                        message: "unrecognized payload shape".to_string(),
                    })
                }),
        )
        .unwrap();

    let record = store.open("1").unwrap();
    assert!(!drive_load(&engine, &record).await);
    assert!(record.is_closed());
    // Nothing was committed.
    assert_eq!(remote.peek("players", "1").unwrap().metadata.data_version, 0);
}
