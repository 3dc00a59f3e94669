//! Buffered ingestion tests

mod common;

use field_audit::audit::{BufferedAuditLogger, IntegrityVerifier};
use field_audit::config::BufferConfig;
use field_audit::database::models::AuditFilter;

use common::{category_change, setup_test_db, test_logger};

fn buffer_config(capacity: usize, flush_threshold: usize, flush_interval_ms: u64) -> BufferConfig {
    BufferConfig {
        capacity,
        flush_threshold,
        flush_interval_ms,
    }
}

#[tokio::test]
async fn test_explicit_flush_commits_pending_entries() {
    let db = setup_test_db().await;
    let buffered = BufferedAuditLogger::start(test_logger(&db), &buffer_config(100, 100, 60_000));

    for i in 0..5 {
        buffered.submit(category_change("e1", "u1", i)).await.unwrap();
    }
    assert_eq!(buffered.pending().await, 5);

    assert_eq!(buffered.flush().await.unwrap(), 5);
    assert_eq!(buffered.pending().await, 0);
    assert_eq!(db.count(&AuditFilter::new()).await.unwrap(), 5);

    buffered.submit(category_change("e1", "u1", 5)).await.unwrap();
    assert_eq!(buffered.shutdown().await.unwrap(), 1);
    assert_eq!(db.count(&AuditFilter::new()).await.unwrap(), 6);
}

#[tokio::test]
async fn test_full_buffer_applies_backpressure() {
    let db = setup_test_db().await;
    let buffered = BufferedAuditLogger::start(test_logger(&db), &buffer_config(3, 3, 60_000));

    for i in 0..7 {
        buffered.submit(category_change("e1", "u1", i)).await.unwrap();
    }

    assert!(buffered.pending().await <= 3);

    // Nothing is dropped once the in-flight flushes settle.
    buffered.shutdown().await.unwrap();
    assert_eq!(buffered.pending().await, 0);
    assert_eq!(db.count(&AuditFilter::new()).await.unwrap(), 7);

    let reports = IntegrityVerifier::new(db, true).verify_all().await.unwrap();
    assert!(reports.iter().all(|r| r.is_valid));
}

#[tokio::test]
async fn test_background_interval_flush() {
    let db = setup_test_db().await;
    let buffered = BufferedAuditLogger::start(test_logger(&db), &buffer_config(100, 100, 20));

    buffered.submit(category_change("e1", "u1", 0)).await.unwrap();

    let mut committed = 0;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        committed = db.count(&AuditFilter::new()).await.unwrap();
        if committed == 1 {
            break;
        }
    }
    assert_eq!(committed, 1);
    buffered.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_entry_is_rejected_on_submit() {
    let db = setup_test_db().await;
    let buffered = BufferedAuditLogger::start(test_logger(&db), &buffer_config(10, 10, 60_000));

    let err = buffered
        .submit(category_change("", "u1", 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("entity_id"));
    assert_eq!(buffered.pending().await, 0);

    buffered.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_buffer_still_commits_pending_entries() {
    let db = setup_test_db().await;
    let buffered = BufferedAuditLogger::start(test_logger(&db), &buffer_config(100, 100, 60_000));

    for i in 0..3 {
        buffered.submit(category_change("e1", "u1", i)).await.unwrap();
    }
    drop(buffered);

    let mut committed = 0;
    for _ in 0..100 {
        committed = db.count(&AuditFilter::new()).await.unwrap();
        if committed == 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(committed, 3);
}
