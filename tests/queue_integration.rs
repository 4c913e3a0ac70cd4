//! Integration tests for the queue module.
//!
//! These tests verify Queue operations against a real SQLite database.

use jukestream::{Database, NewSubmission, Queue, QueueStatus};
use tempfile::TempDir;

/// Helper to create a test database with migrations applied.
async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");

    (db, temp_dir)
}

async fn enqueue_url(queue: &Queue, url: &str, who: &str) -> (String, i64) {
    let submission = NewSubmission::new(url, who);
    let position = queue.enqueue(&submission).await.expect("Failed to enqueue");
    (submission.id, position)
}

// ==================== Basic Operations ====================

#[tokio::test]
async fn test_enqueue_creates_pending_item() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (id, position) = enqueue_url(&queue, "https://example.com/clip.mp4", "alice").await;
    assert_eq!(position, 1);

    let item = queue.get(&id).await.expect("Failed to get").unwrap();
    assert_eq!(item.url, "https://example.com/clip.mp4");
    assert_eq!(item.submitted_by, "alice");
    assert_eq!(item.status(), QueueStatus::Pending);
    assert_eq!(item.title, "Unknown");
    assert_eq!(item.position, Some(1));
    assert!(!item.submitted_at.is_empty());
}

#[tokio::test]
async fn test_enqueue_assigns_strictly_increasing_positions() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let mut last = 0;
    for i in 0..5 {
        let (_, position) =
            enqueue_url(&queue, &format!("https://example.com/{i}.mp4"), "alice").await;
        assert!(position > last, "positions must strictly increase");
        last = position;
    }
}

#[tokio::test]
async fn test_concurrent_enqueues_get_distinct_positions() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let mut handles = Vec::new();
    for i in 0..10 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let submission =
                NewSubmission::new(format!("https://example.com/{i}.mp4"), format!("user{i}"));
            queue.enqueue(&submission).await.unwrap()
        }));
    }

    let mut positions = Vec::new();
    for handle in handles {
        positions.push(handle.await.unwrap());
    }
    positions.sort_unstable();
    positions.dedup();
    assert_eq!(positions.len(), 10, "positions must be unique");
}

#[tokio::test]
async fn test_dequeue_returns_lowest_position_without_claiming() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (first_id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    enqueue_url(&queue, "https://example.com/b.mp4", "bob").await;

    let peeked = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(peeked.id, first_id);
    assert_eq!(peeked.status(), QueueStatus::Pending);

    // Peeking does not claim: a second dequeue sees the same item
    let again = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(again.id, first_id);
}

#[tokio::test]
async fn test_dequeue_empty_returns_none() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_urls_play_in_submission_order() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (first_id, p1) = enqueue_url(&queue, "https://example.com/same.mp4", "alice").await;
    let (second_id, p2) = enqueue_url(&queue, "https://example.com/same.mp4", "bob").await;

    assert_ne!(first_id, second_id);
    assert!(p1 < p2);

    let head = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(head.id, first_id);
}

// ==================== Status Updates ====================

#[tokio::test]
async fn test_update_status_with_error() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    queue
        .update_status(&id, QueueStatus::Failed, Some("duration_exceeded: too long"))
        .await
        .unwrap();

    let item = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status(), QueueStatus::Failed);
    assert_eq!(
        item.error_message.as_deref(),
        Some("duration_exceeded: too long")
    );
}

#[tokio::test]
async fn test_update_item_persists_enriched_fields() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    let mut item = queue.get(&id).await.unwrap().unwrap();
    item.file_path = Some("/media/a.mp4".to_string());
    item.title = "Hello".to_string();
    item.duration_seconds = Some(42.0);
    item.status_str = QueueStatus::Playing.as_str().to_string();

    queue.update_item(&item).await.unwrap();

    let stored = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.file_path.as_deref(), Some("/media/a.mp4"));
    assert_eq!(stored.title, "Hello");
    assert_eq!(stored.duration_seconds, Some(42.0));
    assert_eq!(stored.status(), QueueStatus::Playing);
}

// ==================== Snapshots and Lookups ====================

#[tokio::test]
async fn test_get_queue_respects_limit_and_order() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    for who in ["a", "b", "c", "d"] {
        enqueue_url(&queue, &format!("https://example.com/{who}.mp4"), who).await;
    }

    let snapshot = queue.get_queue(3).await.unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[0].submitted_by, "a");
    assert_eq!(snapshot[1].submitted_by, "b");
    assert_eq!(snapshot[2].submitted_by, "c");
}

#[tokio::test]
async fn test_get_now_playing_singleton() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    assert!(queue.get_now_playing().await.unwrap().is_none());

    let (id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    queue
        .update_status(&id, QueueStatus::Playing, None)
        .await
        .unwrap();

    let playing = queue.get_now_playing().await.unwrap().unwrap();
    assert_eq!(playing.id, id);

    queue
        .update_status(&id, QueueStatus::Done, None)
        .await
        .unwrap();
    assert!(queue.get_now_playing().await.unwrap().is_none());
}

#[tokio::test]
async fn test_position_of_ranks_pending_items() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (a, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    let (b, _) = enqueue_url(&queue, "https://example.com/b.mp4", "bob").await;
    let (c, _) = enqueue_url(&queue, "https://example.com/c.mp4", "carol").await;

    assert_eq!(queue.position_of(&a).await.unwrap(), Some(1));
    assert_eq!(queue.position_of(&b).await.unwrap(), Some(2));
    assert_eq!(queue.position_of(&c).await.unwrap(), Some(3));

    // A non-pending item has no rank
    queue
        .update_status(&a, QueueStatus::Done, None)
        .await
        .unwrap();
    assert_eq!(queue.position_of(&a).await.unwrap(), None);
    assert_eq!(queue.position_of(&b).await.unwrap(), Some(1));
}

// ==================== Clear and Remove ====================

#[tokio::test]
async fn test_clear_pending_spares_playing_and_terminal_rows() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (playing, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    queue
        .update_status(&playing, QueueStatus::Playing, None)
        .await
        .unwrap();
    let (done, _) = enqueue_url(&queue, "https://example.com/b.mp4", "bob").await;
    queue
        .update_status(&done, QueueStatus::Done, None)
        .await
        .unwrap();
    enqueue_url(&queue, "https://example.com/c.mp4", "carol").await;
    enqueue_url(&queue, "https://example.com/d.mp4", "dave").await;

    let removed = queue.clear_pending().await.unwrap();
    assert_eq!(removed, 2);

    assert!(queue.get(&playing).await.unwrap().is_some());
    assert!(queue.get(&done).await.unwrap().is_some());
    assert_eq!(queue.count_by_status(QueueStatus::Pending).await.unwrap(), 0);
}

#[tokio::test]
async fn test_remove_deletes_single_row() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    queue.remove(&id).await.unwrap();
    assert!(queue.get(&id).await.unwrap().is_none());

    // Removing again reports the missing row
    assert!(queue.remove(&id).await.is_err());
}

// ==================== Crash Repair ====================

#[tokio::test]
async fn test_repair_interrupted_rewrites_in_flight_rows() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (downloading, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    queue
        .update_status(&downloading, QueueStatus::Downloading, None)
        .await
        .unwrap();
    let (playing, _) = enqueue_url(&queue, "https://example.com/b.mp4", "bob").await;
    queue
        .update_status(&playing, QueueStatus::Playing, None)
        .await
        .unwrap();
    let (pending, _) = enqueue_url(&queue, "https://example.com/c.mp4", "carol").await;
    let (done, _) = enqueue_url(&queue, "https://example.com/d.mp4", "dave").await;
    queue
        .update_status(&done, QueueStatus::Done, None)
        .await
        .unwrap();

    let repaired = queue.repair_interrupted().await.unwrap();
    assert_eq!(repaired, 2);

    for id in [&downloading, &playing] {
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status(), QueueStatus::Failed);
        assert_eq!(item.error_message.as_deref(), Some("interrupted"));
    }

    // Untouched rows keep their statuses
    assert_eq!(
        queue.get(&pending).await.unwrap().unwrap().status(),
        QueueStatus::Pending
    );
    assert_eq!(
        queue.get(&done).await.unwrap().unwrap().status(),
        QueueStatus::Done
    );

    // No in-flight rows remain
    assert_eq!(
        queue
            .count_by_status(QueueStatus::Downloading)
            .await
            .unwrap(),
        0
    );
    assert_eq!(queue.count_by_status(QueueStatus::Playing).await.unwrap(), 0);
}

#[tokio::test]
async fn test_repair_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let playing_id;
    {
        let db = Database::new(&db_path).await.unwrap();
        let queue = Queue::new(db.clone());
        let (id, _) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
        queue
            .update_status(&id, QueueStatus::Playing, None)
            .await
            .unwrap();
        playing_id = id;
        db.close().await;
    }

    // "Restart": reopen the same file and repair before dequeuing
    let db = Database::new(&db_path).await.unwrap();
    let queue = Queue::new(db);
    let repaired = queue.repair_interrupted().await.unwrap();
    assert_eq!(repaired, 1);

    let item = queue.get(&playing_id).await.unwrap().unwrap();
    assert_eq!(item.status(), QueueStatus::Failed);
    assert_eq!(item.error_message.as_deref(), Some("interrupted"));
}

// ==================== Position Recycling ====================

#[tokio::test]
async fn test_positions_restart_when_pending_set_drains() {
    let (db, _temp_dir) = setup_test_db().await;
    let queue = Queue::new(db);

    let (id, p1) = enqueue_url(&queue, "https://example.com/a.mp4", "alice").await;
    assert_eq!(p1, 1);
    queue
        .update_status(&id, QueueStatus::Done, None)
        .await
        .unwrap();

    // Positions are unique among pending rows only
    let (_, p2) = enqueue_url(&queue, "https://example.com/b.mp4", "bob").await;
    assert_eq!(p2, 1);
}
