//! Integration tests for the typed entity store: lifecycle, batching,
//! streaming and entity indexes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use chronik::{
    BlobStore, Db, Entity, EntityStore, EventLog, StreamId, UpdateAction,
    index::{Comparator, Condition, IndexField, IndexFieldType, LimitOffset, Query},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: String,
    name: String,
    note: String,
    count: i64,
}

impl Entity for Article {
    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

fn article(id: &str, name: &str) -> Article {
    Article {
        id: id.to_string(),
        name: name.to_string(),
        note: String::new(),
        count: 0,
    }
}

async fn open() -> (tempfile::TempDir, Arc<EventLog>, EntityStore<Article>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Db::open(dir.path().join("test.db")).await.expect("open db"));
    let log = Arc::new(EventLog::open(db.clone()).await.expect("open log"));
    let blobs = Arc::new(BlobStore::open(db).await.expect("open store"));
    let store = EntityStore::new("article", Arc::clone(&log), blobs).expect("entity store");
    (dir, log, store)
}

async fn event_types(log: &EventLog, stream: &StreamId) -> Vec<String> {
    log.load_slice(stream, LimitOffset::new(100, 0))
        .await
        .expect("load slice")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[test_log::test(tokio::test)]
async fn save_and_load_round_trip() {
    let (_dir, _log, store) = open().await;
    let a = article("a1", "first");

    let result = store.save(&a).await.expect("save");
    assert_eq!(result.action, UpdateAction::Create);
    assert_eq!(result.version, 1);

    let (loaded, version) = store.load("a1").await.expect("load").expect("present");
    assert_eq!(loaded, a);
    assert_eq!(version, 1);
    assert!(store.load("a2").await.expect("load").is_none());
}

#[test_log::test(tokio::test)]
async fn unchanged_save_is_a_no_op() {
    let (_dir, log, store) = open().await;
    let a = article("a1", "first");
    store.save(&a).await.expect("create");
    let snapshot_before = store.load_blob("a1").await.expect("blob").expect("present");

    let result = store.save(&a).await.expect("save again");
    assert_eq!(result.action, UpdateAction::None);
    assert!(result.changelog.is_empty());
    assert_eq!(result.version, 1);

    // No event was appended and the snapshot is untouched.
    assert_eq!(log.store_version().await.expect("version"), 1);
    let snapshot_after = store.load_blob("a1").await.expect("blob").expect("present");
    assert_eq!(snapshot_after.stream_version, snapshot_before.stream_version);
    assert_eq!(snapshot_after.data, snapshot_before.data);
}

#[test_log::test(tokio::test)]
async fn changed_save_records_a_changelog() {
    let (_dir, log, store) = open().await;
    let mut a = article("a1", "first");
    store.save(&a).await.expect("create");

    a.name = "renamed".to_string();
    a.count = 7;
    let result = store.save(&a).await.expect("update");
    assert_eq!(result.action, UpdateAction::Change);
    assert_eq!(result.version, 2);
    assert_eq!(result.changelog.len(), 2);

    let (loaded, version) = store.load("a1").await.expect("load").expect("present");
    assert_eq!(loaded, a);
    assert_eq!(version, 2);

    let types = event_types(&log, &store.stream_id("a1")).await;
    assert_eq!(types, vec!["article:created", "article:changed"]);
}

#[test_log::test(tokio::test)]
async fn update_rejects_identity_mismatch() {
    let (_dir, _log, store) = open().await;
    let a = article("a1", "first");
    let b = article("a2", "other");
    let err = store.update(&b, &a, 1).await.expect_err("mismatch");
    assert!(matches!(err, chronik::Error::IdentityMismatch { .. }));
}

#[test_log::test(tokio::test)]
async fn delete_tombstones_and_errors_on_absent() {
    let (_dir, log, store) = open().await;
    let a = article("a1", "first");
    store.save(&a).await.expect("create");

    let result = store.delete("a1").await.expect("delete");
    assert_eq!(result.action, UpdateAction::Delete);
    assert_eq!(result.version, 2);

    assert!(store.load("a1").await.expect("load").is_none());
    let blob = store.load_blob("a1").await.expect("blob").expect("tombstone");
    assert!(blob.deleted);

    // Deleting a missing or tombstoned entity is an error.
    assert!(matches!(
        store.delete("a1").await.expect_err("already deleted"),
        chronik::Error::NotFound
    ));
    assert!(matches!(
        store.delete("zz").await.expect_err("never existed"),
        chronik::Error::NotFound
    ));

    let types = event_types(&log, &store.stream_id("a1")).await;
    assert_eq!(types, vec!["article:created", "article:deleted"]);
}

#[test_log::test(tokio::test)]
async fn deleted_entities_resurrect_by_replace() {
    let (_dir, log, store) = open().await;
    store.save(&article("a", "v1")).await.expect("create");
    store.delete("a").await.expect("delete");

    let mut back = article("a", "v1");
    back.note = "back".to_string();
    let result = store.save(&back).await.expect("resurrect");
    assert_eq!(result.action, UpdateAction::Replace);
    assert_eq!(result.version, 3);

    let blob = store.load_blob("a").await.expect("blob").expect("present");
    assert!(!blob.deleted);
    assert_eq!(blob.stream_version, 3);

    let (loaded, _) = store.load("a").await.expect("load").expect("present");
    assert_eq!(loaded.note, "back");

    let types = event_types(&log, &store.stream_id("a")).await;
    assert_eq!(
        types,
        vec!["article:created", "article:deleted", "article:replaced"]
    );
}

#[test_log::test(tokio::test)]
async fn save_many_matches_single_saves() {
    let (_dir, log, store) = open().await;

    // Batch: two creates.
    let results = store
        .save_many(&[article("a", "one"), article("b", "two")])
        .await
        .expect("batch create");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.action == UpdateAction::Create));
    assert!(results.iter().all(|r| r.version == 1));

    // Batch: one change, one no-op, one create.
    let mut a = article("a", "one");
    a.count = 5;
    let results = store
        .save_many(&[a.clone(), article("b", "two"), article("c", "three")])
        .await
        .expect("batch update");
    let actions: Vec<UpdateAction> = results.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![UpdateAction::Change, UpdateAction::None, UpdateAction::Create]
    );

    let (loaded, version) = store.load("a").await.expect("load").expect("present");
    assert_eq!(loaded, a);
    assert_eq!(version, 2);

    // Per-stream histories match what single saves would have produced.
    assert_eq!(
        event_types(&log, &store.stream_id("a")).await,
        vec!["article:created", "article:changed"]
    );
    assert_eq!(
        event_types(&log, &store.stream_id("b")).await,
        vec!["article:created"]
    );
    assert_eq!(
        event_types(&log, &store.stream_id("c")).await,
        vec!["article:created"]
    );
}

#[test_log::test(tokio::test)]
async fn save_many_resurrects_tombstones() {
    let (_dir, log, store) = open().await;
    store.save(&article("a", "one")).await.expect("create");
    store.delete("a").await.expect("delete");

    let results = store
        .save_many(&[article("a", "one")])
        .await
        .expect("batch resurrect");
    assert_eq!(results[0].action, UpdateAction::Replace);
    assert_eq!(results[0].version, 3);

    assert!(store.load("a").await.expect("load").is_some());
    assert_eq!(
        event_types(&log, &store.stream_id("a")).await,
        vec!["article:created", "article:deleted", "article:replaced"]
    );
}

#[test_log::test(tokio::test)]
async fn stream_entities_skips_tombstones() {
    let (_dir, _log, store) = open().await;
    for n in 0..25 {
        store
            .save(&article(&format!("a{n:02}"), "x"))
            .await
            .expect("save");
    }
    store.delete("a03").await.expect("delete");
    store.delete("a17").await.expect("delete");

    let mut pages = store.stream_entities(10, CancellationToken::new());
    let mut ids = Vec::new();
    while let Some(page) = pages.next_page().await {
        ids.extend(page.expect("page").into_iter().map(|a| a.id));
    }
    assert_eq!(ids.len(), 23);
    assert!(!ids.contains(&"a03".to_string()));
    assert!(!ids.contains(&"a17".to_string()));
}

#[test_log::test(tokio::test)]
async fn entity_indexes_query_live_values() {
    let (_dir, _log, store) = open().await;
    store
        .add_or_update_index(
            "by_name",
            vec![
                IndexField::new("name", IndexFieldType::Str, |a: &Article| {
                    a.name.clone().into()
                }),
                IndexField::new("count", IndexFieldType::Int, |a: &Article| a.count.into()),
            ],
        )
        .await
        .expect("add index");

    for n in 0..30 {
        let mut a = article(&format!("a{n:02}"), if n % 3 == 0 { "fizz" } else { "plain" });
        a.count = n;
        store.save(&a).await.expect("save");
    }
    store.delete("a00").await.expect("delete");

    let hits = store
        .query_index(
            "by_name",
            &Query::new(LimitOffset::new(100, 0))
                .condition(Condition::new("name", Comparator::Eq, "fizz")),
        )
        .await
        .expect("query");
    // 0, 3, .., 27 carry "fizz"; a00 is tombstoned and filtered from reads.
    assert_eq!(hits.len(), 9);
    assert!(hits.iter().all(|a| a.name == "fizz" && a.id != "a00"));
}

#[test_log::test(tokio::test)]
async fn events_since_and_prefix_queries() {
    let (_dir, _log, store) = open().await;
    for n in 0..6 {
        store.save(&article(&format!("a{n}"), "x")).await.expect("save");
    }

    let tail = store.events_since(4, 100).await.expect("events since");
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].store_index, 4);

    let events = store
        .query(
            &chronik::event::QueryParams {
                sort_asc: true,
                ..Default::default()
            },
            LimitOffset::new(100, 0),
        )
        .await
        .expect("query");
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.event_type.starts_with("article:")));
}

#[test_log::test(tokio::test)]
async fn entity_saves_notify_subscribers() {
    let (_dir, log, store) = open().await;
    let mut on_stream = log.subscribe(store.stream_id("a1"));
    let mut on_all = store.subscribe();

    store.save(&article("a1", "x")).await.expect("save");

    let update = tokio::time::timeout(std::time::Duration::from_secs(2), on_stream.recv())
        .await
        .expect("notified")
        .expect("open")
        .expect("no lag");
    assert_eq!(update, store.stream_id("a1"));
    let update = tokio::time::timeout(std::time::Duration::from_secs(2), on_all.recv())
        .await
        .expect("notified")
        .expect("open")
        .expect("no lag");
    assert_eq!(update, store.stream_id("a1"));
}

#[test_log::test(tokio::test)]
async fn rejects_split_databases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_a = Arc::new(Db::open(dir.path().join("a.db")).await.expect("open a"));
    let db_b = Arc::new(Db::open(dir.path().join("b.db")).await.expect("open b"));
    let log = Arc::new(EventLog::open(db_a).await.expect("open log"));
    let blobs = Arc::new(BlobStore::open(db_b).await.expect("open store"));

    assert!(EntityStore::<Article>::new("article", log, blobs).is_err());
}
