//! Integration tests for the event log: ordering, optimistic concurrency,
//! queries and subscriptions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use chronik::{
    Db, EventLog, RawEvent, StreamId,
    event::{EventId, QueryParams, Streamer},
    index::LimitOffset,
};

async fn open() -> (tempfile::TempDir, Arc<EventLog>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Db::open(dir.path().join("test.db")).await.expect("open db"));
    let log = Arc::new(EventLog::open(db).await.expect("open log"));
    (dir, log)
}

fn event(event_type: &str, n: u64) -> RawEvent {
    RawEvent::new(event_type, Utc::now(), json!({ "n": n }))
}

#[test_log::test(tokio::test)]
async fn append_and_load_slice_round_trip() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s1");

    let events: Vec<RawEvent> = (0..5).map(|n| event("test:stored", n)).collect();
    log.append(&stream, 0, events.clone()).await.expect("append");

    assert_eq!(log.stream_version(&stream).await.expect("version"), 5);
    assert_eq!(log.store_version().await.expect("version"), 5);

    let loaded = log
        .load_slice(&stream, LimitOffset::new(10, 0))
        .await
        .expect("load");
    assert_eq!(loaded.len(), 5);
    for (n, e) in loaded.iter().enumerate() {
        assert_eq!(e.stream_index, n as u64);
        assert_eq!(e.store_index, n as u64);
        assert_eq!(e.stream_id, stream);
        assert_eq!(e.data, json!({ "n": n }));
        assert_eq!(e.id, events[n].id);
    }
}

#[test_log::test(tokio::test)]
async fn append_checks_expected_version() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s1");

    log.append(&stream, 0, vec![event("test:stored", 0)])
        .await
        .expect("first append");

    let err = log
        .append(&stream, 0, vec![event("test:stored", 1)])
        .await
        .expect_err("stale version");
    match err {
        chronik::Error::ExpectedVersion { expected, actual } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The failed append wrote nothing.
    assert_eq!(log.stream_version(&stream).await.expect("version"), 1);
    let loaded = log
        .load_slice(&stream, LimitOffset::new(10, 0))
        .await
        .expect("load");
    assert_eq!(loaded.len(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn concurrent_appenders_resolve_to_one_winner() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s");

    let first = {
        let log = Arc::clone(&log);
        let stream = stream.clone();
        tokio::spawn(async move { log.append(&stream, 0, vec![event("test:stored", 1)]).await })
    };
    let second = {
        let log = Arc::clone(&log);
        let stream = stream.clone();
        tokio::spawn(async move { log.append(&stream, 0, vec![event("test:stored", 2)]).await })
    };

    let (first, second) = tokio::join!(first, second);
    let results = [first.expect("join"), second.expect("join")];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "exactly one append wins");
    let conflict = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one conflict");
    assert!(matches!(
        conflict,
        chronik::Error::ExpectedVersion {
            expected: 0,
            actual: 1
        }
    ));

    assert_eq!(log.stream_version(&stream).await.expect("version"), 1);
    let loaded = log
        .load_slice(&stream, LimitOffset::new(10, 0))
        .await
        .expect("load");
    assert_eq!(loaded.len(), 1);
}

#[test_log::test(tokio::test)]
async fn create_derives_stream_indexes_per_stream() {
    let (_dir, log) = open().await;

    let mut events = Vec::new();
    for (stream, n) in [("a", 0), ("b", 1), ("a", 2), ("a", 3), ("b", 4)] {
        let mut e = event("test:stored", n);
        e.stream_id = StreamId::from(stream);
        events.push(e);
    }
    log.create(events).await.expect("create");

    assert_eq!(log.stream_version(&StreamId::from("a")).await.unwrap(), 3);
    assert_eq!(log.stream_version(&StreamId::from("b")).await.unwrap(), 2);
    assert_eq!(log.store_version().await.unwrap(), 5);

    let a = log
        .load_slice(&StreamId::from("a"), LimitOffset::new(10, 0))
        .await
        .expect("load a");
    let indexes: Vec<u64> = a.iter().map(|e| e.stream_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[test_log::test(tokio::test)]
async fn find_by_id() {
    let (_dir, log) = open().await;
    let e = event("test:stored", 7);
    let id = e.id.clone();
    log.append(&StreamId::from("s"), 0, vec![e]).await.expect("append");

    let found = log.find(&id).await.expect("find").expect("present");
    assert_eq!(found.data, json!({ "n": 7 }));
    assert!(log
        .find(&EventId::from("no-such-id"))
        .await
        .expect("find")
        .is_none());
}

#[test_log::test(tokio::test)]
async fn slices_from_version_and_descending() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s");
    let events: Vec<RawEvent> = (0..10).map(|n| event("test:stored", n)).collect();
    log.append(&stream, 0, events).await.expect("append");

    let tail = log
        .load_slice_from_version(&stream, 6, LimitOffset::new(10, 0))
        .await
        .expect("from version");
    assert_eq!(tail.len(), 4);
    assert_eq!(tail[0].stream_index, 6);

    let all_tail = log
        .load_slice_from_version(&StreamId::all(), 6, LimitOffset::new(10, 0))
        .await
        .expect("from store version");
    assert_eq!(all_tail.len(), 4);
    assert_eq!(all_tail[0].store_index, 6);

    let descending = log
        .load_slice_descending(&stream, LimitOffset::new(3, 0))
        .await
        .expect("descending");
    let indexes: Vec<u64> = descending.iter().map(|e| e.stream_index).collect();
    assert_eq!(indexes, vec![9, 8, 7]);
}

#[test_log::test(tokio::test)]
async fn load_slice_until_filters_by_domain_time() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s");

    let early = Utc::now() - chrono::Duration::hours(2);
    let cutoff = Utc::now() - chrono::Duration::hours(1);
    let events = vec![
        RawEvent::new("test:stored", early, json!({"n": 0})),
        RawEvent::new("test:stored", Utc::now(), json!({"n": 1})),
    ];
    log.append(&stream, 0, events).await.expect("append");

    let until = log
        .load_slice_until(&stream, LimitOffset::new(10, 0), cutoff)
        .await
        .expect("until");
    assert_eq!(until.len(), 1);
    assert_eq!(until[0].data, json!({"n": 0}));
}

#[test_log::test(tokio::test)]
async fn query_filters_compose() {
    let (_dir, log) = open().await;
    log.append(
        &StreamId::from("a"),
        0,
        vec![event("order:created", 0), event("order:changed", 1)],
    )
    .await
    .expect("append a");
    log.append(&StreamId::from("b"), 0, vec![event("note:created", 2)])
        .await
        .expect("append b");

    let by_stream = log
        .query(
            &QueryParams {
                stream_id: Some(StreamId::from("a")),
                sort_asc: true,
                ..Default::default()
            },
            LimitOffset::new(10, 0),
        )
        .await
        .expect("query stream");
    assert_eq!(by_stream.len(), 2);

    let by_type = log
        .query(
            &QueryParams {
                event_type: Some("note:created".into()),
                sort_asc: true,
                ..Default::default()
            },
            LimitOffset::new(10, 0),
        )
        .await
        .expect("query type");
    assert_eq!(by_type.len(), 1);
    assert_eq!(by_type[0].stream_id, StreamId::from("b"));

    // Prefix default applies only without an explicit type filter.
    let by_prefix = log
        .query_with_type_prefix(
            "order",
            &QueryParams {
                sort_asc: true,
                ..Default::default()
            },
            LimitOffset::new(10, 0),
        )
        .await
        .expect("query prefix");
    assert_eq!(by_prefix.len(), 2);
    assert!(by_prefix.iter().all(|e| e.event_type.starts_with("order:")));

    let descending = log
        .query(
            &QueryParams::default(),
            LimitOffset::new(10, 0),
        )
        .await
        .expect("query descending");
    assert_eq!(descending[0].store_index, 2);
}

#[test_log::test(tokio::test)]
async fn latest_per_stream() {
    let (_dir, log) = open().await;
    log.append(
        &StreamId::from("a"),
        0,
        vec![event("test:stored", 0), event("test:stored", 1)],
    )
    .await
    .expect("append a");
    log.append(&StreamId::from("b"), 0, vec![event("test:stored", 2)])
        .await
        .expect("append b");

    let mut latest = log.load_latest_from_all().await.expect("latest all");
    latest.sort_by(|x, y| x.stream_id.as_str().cmp(y.stream_id.as_str()));
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].data, json!({"n": 1}));
    assert_eq!(latest[1].data, json!({"n": 2}));

    let only_a = log
        .load_latest_from(&[StreamId::from("a")])
        .await
        .expect("latest a");
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].data, json!({"n": 1}));
}

#[test_log::test(tokio::test)]
async fn purge_before_deletes_and_leaves_gaps() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s");
    log.append(&stream, 0, vec![event("test:stored", 0), event("test:stored", 1)])
        .await
        .expect("append");

    let purged = log
        .purge_before(Utc::now() + chrono::Duration::seconds(1))
        .await
        .expect("purge");
    assert_eq!(purged, 2);

    // Versions derive from the remaining maximum; appending still works.
    assert_eq!(log.stream_version(&stream).await.expect("version"), 0);
    log.append(&stream, 0, vec![event("test:stored", 2)])
        .await
        .expect("append after purge");

    assert_eq!(
        log.purge_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .expect("purge nothing"),
        0
    );
}

#[test_log::test(tokio::test)]
async fn all_stream_ids_are_distinct() {
    let (_dir, log) = open().await;
    log.append(&StreamId::from("a"), 0, vec![event("test:stored", 0), event("test:stored", 1)])
        .await
        .expect("append");
    log.append(&StreamId::from("b"), 0, vec![event("test:stored", 2)])
        .await
        .expect("append");

    let mut ids = log.all_stream_ids().await.expect("stream ids");
    ids.sort_by(|x, y| x.as_str().cmp(y.as_str()));
    assert_eq!(ids, vec![StreamId::from("a"), StreamId::from("b")]);
}

#[test_log::test(tokio::test)]
async fn subscriptions_observe_commits_after_subscribe() {
    let (_dir, log) = open().await;

    // Established before the batch: observes it.
    let mut before = log.subscribe(StreamId::all());
    let mut events = Vec::new();
    for n in 0..10 {
        let mut e = event("test:stored", n);
        e.stream_id = StreamId::from(format!("s{n}"));
        events.push(e);
    }
    log.create(events).await.expect("create");

    let update = timeout(Duration::from_secs(2), before.recv())
        .await
        .expect("notified")
        .expect("open")
        .expect("no lag");
    assert!(update.is_all());

    // Established after the batch: observes nothing until the next write.
    let mut after = log.subscribe(StreamId::all());
    assert!(after.try_recv().is_none());

    log.append(&StreamId::from("late"), 0, vec![event("test:stored", 99)])
        .await
        .expect("append");
    let update = timeout(Duration::from_secs(2), after.recv())
        .await
        .expect("notified")
        .expect("open")
        .expect("no lag");
    assert_eq!(update, StreamId::from("late"));
}

#[test_log::test(tokio::test)]
async fn subscriptions_filter_by_stream() {
    let (_dir, log) = open().await;
    let mut on_a = log.subscribe(StreamId::from("a"));

    log.append(&StreamId::from("b"), 0, vec![event("test:stored", 0)])
        .await
        .expect("append b");
    assert!(on_a.try_recv().is_none(), "update on b does not match");

    log.append(&StreamId::from("a"), 0, vec![event("test:stored", 1)])
        .await
        .expect("append a");
    let update = timeout(Duration::from_secs(2), on_a.recv())
        .await
        .expect("notified")
        .expect("open")
        .expect("no lag");
    assert_eq!(update, StreamId::from("a"));
}

#[test_log::test(tokio::test)]
async fn close_publisher_closes_subscriptions() {
    let (_dir, log) = open().await;
    let mut sub = log.subscribe(StreamId::all());
    log.close_publisher();
    assert!(sub.recv().await.is_none());

    // Subscribing after shutdown yields a closed subscription.
    let mut late = log.subscribe(StreamId::all());
    assert!(late.recv().await.is_none());
}

#[test_log::test(tokio::test)]
async fn streamer_pages_and_follows() {
    let (_dir, log) = open().await;
    let stream = StreamId::from("s");
    let events: Vec<RawEvent> = (0..7).map(|n| event("test:stored", n)).collect();
    log.append(&stream, 0, events).await.expect("append");

    let streamer = Streamer::new(Arc::clone(&log), stream.clone());
    let mut pages = streamer
        .load_from(0, CancellationToken::new())
        .with_page_size(3);
    let mut total = 0;
    while let Some(page) = pages.next_page().await {
        total += page.expect("page").len();
    }
    assert_eq!(total, 7);

    // Follow catches up, then delivers pages for new commits.
    let cancel = CancellationToken::new();
    let mut follow = streamer.follow(0, cancel.clone());
    let first = follow.next_page().await.expect("catch-up").expect("page");
    assert_eq!(first.len(), 7);

    let appender = {
        let log = Arc::clone(&log);
        let stream = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            log.append(&stream, 7, vec![event("test:stored", 7)]).await
        })
    };
    let next = timeout(Duration::from_secs(2), follow.next_page())
        .await
        .expect("followed")
        .expect("page option")
        .expect("page");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].stream_index, 7);
    appender.await.expect("join").expect("append");

    cancel.cancel();
    assert!(follow.next_page().await.is_none());
}
