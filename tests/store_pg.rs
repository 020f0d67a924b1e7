//! Cache-store invariants against a live PostgreSQL.
//!
//! Gated behind the `live_tests` feature; point `DATABASE_URL` at a scratch
//! database first:
//!
//!     DATABASE_URL=postgres://localhost/vmail_test \
//!         cargo test --features live_tests --test store_pg
#![cfg(feature = "live_tests")]

use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;
use vmail::store::{ActionType, NewMessage, Store};

async fn test_store() -> Store {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    Store::connect(&url).await.expect("connect + migrate")
}

async fn fresh_user(store: &Store) -> Uuid {
    store
        .upsert_user(&format!("{}@test.local", Uuid::new_v4()))
        .await
        .expect("create user")
        .id
}

fn message(user: Uuid, thread_id: i64, folder: &str, uid: u32, day: u32) -> NewMessage {
    NewMessage {
        user_id: user,
        thread_id,
        imap_uid: uid,
        imap_folder_name: folder.to_string(),
        message_id_header: format!("<m{}@test>", uid),
        from_address: "alice@example.com".to_string(),
        to_addresses: vec!["bob@example.com".to_string()],
        cc_addresses: vec![],
        sent_at: Some(Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).unwrap()),
        subject: format!("message {}", uid),
        is_read: false,
        is_starred: false,
    }
}

#[tokio::test]
async fn message_upserts_are_idempotent_per_uid() {
    let store = test_store().await;
    let user = fresh_user(&store).await;
    let thread = store.attach_thread(user, "<t1@test>", "subject").await.unwrap();

    let first = store.upsert_message(&message(user, thread.id, "INBOX", 7, 1)).await.unwrap();
    let second = store.upsert_message(&message(user, thread.id, "INBOX", 7, 2)).await.unwrap();
    assert_eq!(first, second, "same (user, folder, uid) must stay one row");
}

#[tokio::test]
async fn threads_are_unique_per_stable_id() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    let a = store.attach_thread(user, "<t@test>", "original").await.unwrap();
    let b = store.attach_thread(user, "<t@test>", "reply subject").await.unwrap();
    assert_eq!(a.id, b.id);
    // attach keeps the original subject; upsert overwrites it.
    assert_eq!(b.subject, "original");

    let c = store.upsert_thread(user, "<t@test>", "authoritative").await.unwrap();
    assert_eq!(c.id, a.id);
    assert_eq!(c.subject, "authoritative");
}

#[tokio::test]
async fn sync_cursor_is_monotone() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    store.record_sync(user, "INBOX", Some(10)).await.unwrap();
    store.record_sync(user, "INBOX", Some(5)).await.unwrap();
    let info = store.folder_sync_info(user, "INBOX").await.unwrap().unwrap();
    assert_eq!(info.last_synced_uid, Some(10));

    // None refreshes the timestamp without touching the cursor.
    let before = info.synced_at;
    store.record_sync(user, "INBOX", None).await.unwrap();
    let info = store.folder_sync_info(user, "INBOX").await.unwrap().unwrap();
    assert_eq!(info.last_synced_uid, Some(10));
    assert!(info.synced_at >= before);
}

#[tokio::test]
async fn first_sync_of_empty_folder_leaves_cursor_absent() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    store.record_sync(user, "Archive", None).await.unwrap();
    let info = store.folder_sync_info(user, "Archive").await.unwrap().unwrap();
    assert_eq!(info.last_synced_uid, None);
}

#[tokio::test]
async fn pagination_orders_and_bounds() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    for i in 1..=15u32 {
        let thread = store
            .attach_thread(user, &format!("<p{}@test>", i), "s")
            .await
            .unwrap();
        store
            .upsert_message(&message(user, thread.id, "INBOX", i, (i % 27) + 1))
            .await
            .unwrap();
    }

    let page = store.list_threads(user, "INBOX", 10, 0).await.unwrap();
    assert_eq!(page.len(), 10);
    for pair in page.windows(2) {
        assert!(pair[0].newest_sent_at >= pair[1].newest_sent_at);
    }

    // Beyond the end: empty page, correct total.
    let empty = store.list_threads(user, "INBOX", 10, 100).await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(store.thread_count(user, "INBOX").await.unwrap(), 15);

    // Deep pagination returns distinct threads.
    let tail = store.list_threads(user, "INBOX", 10, 10).await.unwrap();
    assert_eq!(tail.len(), 5);
    let head_ids: Vec<_> = page.iter().map(|t| t.thread.id).collect();
    assert!(tail.iter().all(|t| !head_ids.contains(&t.thread.id)));
}

#[tokio::test]
async fn move_message_switches_folder_listing() {
    let store = test_store().await;
    let user = fresh_user(&store).await;
    let thread = store.attach_thread(user, "<mv@test>", "s").await.unwrap();
    store.upsert_message(&message(user, thread.id, "INBOX", 42, 3)).await.unwrap();

    store.move_message(user, "INBOX", 42, "Archive").await.unwrap();

    assert!(store.list_threads(user, "INBOX", 10, 0).await.unwrap().is_empty());
    let archived = store.list_threads(user, "Archive", 10, 0).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].thread.id, thread.id);

    let moved = store.message_by_uid(user, "Archive", 42).await.unwrap().unwrap();
    assert_eq!(moved.imap_folder_name, "Archive");
}

#[tokio::test]
async fn queue_respects_process_at_and_ownership() {
    let store = test_store().await;
    let user = fresh_user(&store).await;
    let stranger = fresh_user(&store).await;

    let payload = serde_json::json!({
        "to": ["bob@example.com"], "subject": "hi", "body": "hello"
    });
    let job_id = store
        .enqueue_action(user, ActionType::SendEmail, &payload, Utc::now() + Duration::seconds(60))
        .await
        .unwrap();

    // Not due yet: a claim sees nothing.
    let mut tx = store.pool().begin().await.unwrap();
    let claimed = store.claim_due_actions(&mut tx, Utc::now(), 10).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(claimed.iter().all(|j| j.id != job_id));

    // A stranger cannot cancel it.
    let err = store.cancel_action(stranger, job_id).await.unwrap_err();
    assert_eq!(err.status_code(), 404);

    // The owner can, inside the undo window.
    assert!(store.cancel_action(user, job_id).await.unwrap());
    // A second cancel silently reports the row gone.
    assert!(!store.cancel_action(user, job_id).await.unwrap());
}

#[tokio::test]
async fn due_jobs_claim_in_order_and_delete() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    let payload = serde_json::json!({"thread_stable_id": "<a@x>", "starred": true});
    let past = Utc::now() - Duration::seconds(5);
    let first = store
        .enqueue_action(user, ActionType::StarThread, &payload, past)
        .await
        .unwrap();
    let second = store
        .enqueue_action(user, ActionType::StarThread, &payload, past)
        .await
        .unwrap();

    let mut tx = store.pool().begin().await.unwrap();
    let claimed = store.claim_due_actions(&mut tx, Utc::now(), 50).await.unwrap();
    let ours: Vec<i64> = claimed
        .iter()
        .filter(|j| j.user_id == user)
        .map(|j| j.id)
        .collect();
    assert_eq!(ours, vec![first, second], "ties on process_at break by id");

    store.delete_action(&mut tx, first).await.unwrap();
    store.delete_action(&mut tx, second).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!store.cancel_action(user, first).await.unwrap());
}

#[tokio::test]
async fn prune_removes_threads_without_messages() {
    let store = test_store().await;
    let user = fresh_user(&store).await;

    store.attach_thread(user, "<empty@test>", "s").await.unwrap();
    let kept = store.attach_thread(user, "<kept@test>", "s").await.unwrap();
    store.upsert_message(&message(user, kept.id, "INBOX", 1, 1)).await.unwrap();

    let pruned = store.prune_empty_threads(user).await.unwrap();
    assert!(pruned >= 1);
    assert!(store.thread_by_stable_id(user, "<empty@test>").await.unwrap().is_none());
    assert!(store.thread_by_stable_id(user, "<kept@test>").await.unwrap().is_some());
}
