//! Tracking Tests
//!
//! Changesets staged across records and collections, with undo and redo
//! issuing the compensating remote calls.

mod common;

use serde_json::json;

use common::{collection, fields, watched, FakeService};
use tether_core::{ChannelEvent, Operation, Query, RecordEvent};

/// Test that writes inside a changeset are sent only on commit.
#[test]
fn commit_sends_staged_writes() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();

    let (_watcher, record) = watched(|| posts.get(1));
    service
        .channel()
        .send(ChannelEvent::Initial(json!({"id": 1, "title": "a"})));

    tracking.start();
    record.set("title", "b");
    record.set("title", "c");
    assert_eq!(record.get("title"), Some(json!("c")));
    assert!(service.calls_to(Operation::Update).is_empty());

    tracking.commit();
    assert_eq!(
        service.calls_to(Operation::Update),
        vec![json!({"id": 1, "title": "c"})]
    );
    assert_eq!(tracking.history_len(), 1);
}

/// Test that abort reverts silently and sends nothing.
#[test]
fn abort_reverts_without_sending() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();

    let (_watcher, record) = watched(|| posts.get(1));
    service
        .channel()
        .send(ChannelEvent::Initial(json!({"id": 1, "title": "a"})));
    let mut events = record.subscribe();

    tracking.start();
    record.set("title", "b");
    tracking.abort();

    assert_eq!(record.get("title"), Some(json!("a")));
    assert!(events.try_recv().is_err());
    assert!(service.calls_to(Operation::Update).is_empty());
}

/// Test that undo and redo transmit the compensating updates.
#[test]
fn undo_redo_transmit_updates() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();

    let (_watcher, record) = watched(|| posts.get(1));
    service
        .channel()
        .send(ChannelEvent::Initial(json!({"id": 1, "title": "a"})));
    let mut events = record.subscribe();

    tracking.start();
    record.set("title", "b");
    tracking.commit();
    assert!(tracking.undo());
    assert!(tracking.redo());

    assert_eq!(
        service.calls_to(Operation::Update),
        vec![
            json!({"id": 1, "title": "b"}),
            json!({"id": 1, "title": "a"}),
            json!({"id": 1, "title": "b"}),
        ]
    );
    // Echoed update replies interleave `Change` events.
    let mut local = 0;
    while let Ok(event) = events.try_recv() {
        if event == RecordEvent::LocalChange {
            local += 1;
        }
    }
    assert_eq!(local, 3);
}

/// Test that a tracked create shows up locally but is sent on commit.
#[test]
fn tracked_create_is_deferred() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let list = posts.find(Query::new()).unwrap();

    tracking.start();
    let record = posts.create(fields(json!({"id": "t1"})));
    assert!(list.contains("t1"));
    assert!(service.calls_to(Operation::Create).is_empty());

    tracking.commit();
    assert_eq!(service.calls_to(Operation::Create), vec![json!({"id": "t1"})]);
    assert!(!record.is_deleted());
}

/// Test that aborting a create takes the record back out of its lists.
#[test]
fn aborted_create_is_removed() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let list = posts.find(Query::new()).unwrap();

    tracking.start();
    let record = posts.create(fields(json!({"id": "t1"})));
    tracking.abort();

    assert!(!list.contains("t1"));
    assert!(record.is_deleted());
    assert!(service.calls_to(Operation::Create).is_empty());
}

/// Test that undoing a create deletes remotely and redo recreates it.
#[test]
fn undo_create_sends_delete() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let list = posts.find(Query::new()).unwrap();

    tracking.start();
    let record = posts.create(fields(json!({"id": "t1", "n": 1})));
    tracking.commit();

    tracking.undo();
    assert!(!list.contains("t1"));
    assert_eq!(service.calls_to(Operation::Delete), vec![json!({"id": "t1"})]);

    tracking.redo();
    assert!(list.get("t1").unwrap().ptr_eq(&record));
    assert!(!record.is_deleted());
    assert_eq!(service.calls_to(Operation::Create).len(), 2);
}

/// Test that undoing a delete restores the record and recreates it.
#[test]
fn undo_delete_restores() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let (_watcher, list) = watched(|| posts.find(Query::new()));
    service
        .channel()
        .send(ChannelEvent::Initial(json!([{"id": "d1", "n": 1}])));
    let member = list.get("d1").unwrap();

    tracking.start();
    posts.delete("d1").unwrap();
    assert!(list.is_empty());
    tracking.commit();
    assert_eq!(service.calls_to(Operation::Delete), vec![json!({"id": "d1"})]);

    tracking.undo();
    assert!(list.get("d1").unwrap().ptr_eq(&member));
    assert!(!member.is_deleted());
    assert_eq!(
        service.calls_to(Operation::Create),
        vec![json!({"id": "d1", "n": 1})]
    );
}

/// Test that new work after undo discards the redo branch.
#[test]
fn new_changeset_truncates_redo() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let record = posts.get(1).unwrap();

    for n in 0..4 {
        tracking.start();
        record.set("n", n);
        tracking.commit();
    }
    tracking.undo();
    tracking.undo();
    assert!(tracking.has_next());

    tracking.start();
    record.set("n", 100);
    tracking.commit();

    assert_eq!(tracking.history_len(), 3);
    assert!(!tracking.has_next());
    assert!(tracking.has_previous());
}

/// Test that suppressed writes bypass the changeset.
#[test]
fn suppressed_writes_go_straight_out() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let record = posts.get(1).unwrap();

    tracking.start();
    tracking.suppressed(|| record.set("seen", true));

    assert_eq!(service.calls_to(Operation::Update).len(), 1);
    tracking.commit();
    assert_eq!(service.calls_to(Operation::Update).len(), 1);
}

/// Test that an aborted delete puts the member back where it was.
#[test]
fn aborted_delete_keeps_position() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let (_watcher, list) = watched(|| posts.find(Query::new()));
    service.channel().send(ChannelEvent::Initial(json!([
        {"id": "a"},
        {"id": "b"},
        {"id": "c"},
    ])));

    tracking.start();
    posts.delete("b").unwrap();
    assert_eq!(list.ids(), vec!["a", "c"]);
    tracking.abort();

    assert_eq!(list.ids(), vec!["a", "b", "c"]);
    assert!(service.calls_to(Operation::Delete).is_empty());
}

/// Test that undoing a committed delete restores the member in place.
#[test]
fn undone_delete_keeps_position() {
    let service = FakeService::new();
    let posts = collection(&service);
    let tracking = posts.tracking().clone();
    let (_watcher, list) = watched(|| posts.find(Query::new()));
    service.channel().send(ChannelEvent::Initial(json!([
        {"id": "a"},
        {"id": "b"},
        {"id": "c"},
    ])));

    tracking.start();
    posts.delete("a").unwrap();
    tracking.commit();
    tracking.undo();

    assert_eq!(list.ids(), vec!["a", "b", "c"]);
}
