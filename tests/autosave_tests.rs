/// Auto-save tests
///
/// Interval eligibility, checksum-based dirty detection, and per-store
/// overrides, all under a paused clock.
/// Run with: cargo test --test autosave_tests
use std::sync::Arc;
use std::time::Duration;

use keysync::{EngineConfig, KeySync, MemoryRemote, RecordHandle, StoreConfig};
use serde_json::json;

async fn settle(engine: &KeySync) {
    for _ in 0..20 {
        engine.tick().await;
        tokio::task::yield_now().await;
    }
}

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

#[tokio::test(start_paused = true)]
async fn changed_data_is_saved_after_the_interval() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = engine
        .store(StoreConfig::new("players").with_template_data(json!({"coins": 0})))
        .unwrap();

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);
    record.update_data(|data| data["coins"] = json!(10)).unwrap();

    // Before the interval elapses nothing is queued.
    settle(&engine).await;
    assert_eq!(remote.peek("players", "1").unwrap().data["coins"], json!(0));

    tokio::time::advance(Duration::from_secs(31)).await;
    settle(&engine).await;
    assert_eq!(remote.peek("players", "1").unwrap().data["coins"], json!(10));
}

#[tokio::test(start_paused = true)]
async fn unchanged_data_is_not_resaved() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = engine
        .store(StoreConfig::new("players").with_template_data(json!({"coins": 0})))
        .unwrap();

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);
    record.update_data(|data| data["coins"] = json!(10)).unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    settle(&engine).await;
    let calls_after_save = remote.budget();

    // Two more eligible windows with an identical payload: no writes.
    tokio::time::advance(Duration::from_secs(31)).await;
    settle(&engine).await;
    tokio::time::advance(Duration::from_secs(31)).await;
    settle(&engine).await;
    assert_eq!(remote.budget(), calls_after_save);

    // Another edit makes it dirty again.
    record.update_data(|data| data["coins"] = json!(11)).unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    settle(&engine).await;
    assert_eq!(remote.peek("players", "1").unwrap().data["coins"], json!(11));
}

#[tokio::test(start_paused = true)]
async fn per_store_override_disables_auto_save() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = KeySync::new(EngineConfig::new(), remote.clone());
    let store = engine
        .store(
            StoreConfig::new("sessions")
                .with_template_data(json!({"seen": 0}))
                .with_auto_save(false),
        )
        .unwrap();

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);
    record.update_data(|data| data["seen"] = json!(5)).unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;
    settle(&engine).await;
    assert_eq!(remote.peek("sessions", "1").unwrap().data["seen"], json!(0));
}

#[tokio::test(start_paused = true)]
async fn global_disable_stops_all_auto_saves() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = KeySync::new(
        EngineConfig::new().with_auto_save_enabled(false),
        remote.clone(),
    );
    let store = engine
        .store(StoreConfig::new("players").with_template_data(json!({"coins": 0})))
        .unwrap();

    let record = store.open("1").unwrap();
    assert!(drive_load(&engine, &record).await);
    record.update_data(|data| data["coins"] = json!(10)).unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;
    settle(&engine).await;
    assert_eq!(remote.peek("players", "1").unwrap().data["coins"], json!(0));
}
