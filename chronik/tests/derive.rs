//! Tests for the `Entity` derive macro.

use std::sync::Arc;

use chronik::{BlobStore, Db, Entity, EntityStore, EventLog};
use chronik_derive::Entity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
struct Ticket {
    id: String,
    subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
struct Device {
    #[entity(id)]
    serial: u64,
    label: String,
}

#[test]
fn derives_entity_id_from_id_field() {
    let ticket = Ticket {
        id: "t-1".into(),
        subject: "broken".into(),
    };
    assert_eq!(ticket.entity_id(), "t-1");
}

#[test]
fn derives_entity_id_from_marked_field() {
    let device = Device {
        serial: 4711,
        label: "sensor".into(),
    };
    assert_eq!(device.entity_id(), "4711");
}

#[test_log::test(tokio::test)]
async fn derived_entities_work_with_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Db::open(dir.path().join("test.db")).await.expect("open db"));
    let log = Arc::new(EventLog::open(db.clone()).await.expect("open log"));
    let blobs = Arc::new(BlobStore::open(db).await.expect("open store"));
    let store = EntityStore::<Device>::new("device", log, blobs).expect("entity store");

    let device = Device {
        serial: 4711,
        label: "sensor".into(),
    };
    store.save(&device).await.expect("save");
    let (loaded, version) = store.load("4711").await.expect("load").expect("present");
    assert_eq!(loaded, device);
    assert_eq!(version, 1);
}
