//! Integrity verification and storage immutability tests

mod common;

use field_audit::audit::{verify_chain, IntegrityVerifier};
use field_audit::database::models::AuditFilter;

use common::{category_change, setup_test_db, test_logger};

#[tokio::test]
async fn test_verify_all_scopes_after_mixed_writes() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    for i in 0..4 {
        logger.log(category_change("e1", "u1", i)).await.unwrap();
    }
    logger
        .log_bulk((0..3).map(|i| category_change("e2", "u2", 10 + i)).collect())
        .await
        .unwrap();

    let reports = IntegrityVerifier::new(db, true).verify_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_valid));
    assert_eq!(reports.iter().map(|r| r.entries_verified).sum::<u64>(), 7);
}

#[tokio::test]
async fn test_in_memory_copy_edit_is_isolated() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger
        .log_bulk((0..5).map(|i| category_change("e1", "u1", i)).collect())
        .await
        .unwrap();

    let scope = "entity:transaction:e1";
    let mut entries = db.scope_entries(scope, 0, 10).await.unwrap();
    entries[3].new_value = Some(serde_json::json!("forged"));

    let report = verify_chain(scope, &entries).unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.tampered_entries, vec![entries[3].log_id.clone()]);
}

#[tokio::test]
async fn test_no_update_or_delete_reaches_storage() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger.log(category_change("e1", "u1", 0)).await.unwrap();

    let partition = db.list_partitions().await.unwrap()[0].name.clone();
    let (before, _) = db.scan(&AuditFilter::new(), 0, 1).await.unwrap();

    // A later write must not disturb the earlier entry either.
    logger.log(category_change("e1", "u1", 1)).await.unwrap();
    let (after, total) = db
        .scan(&AuditFilter::new().entity("e1").order(Default::default()), 0, 10)
        .await
        .unwrap();
    assert_eq!(total, 2);
    let original = after.iter().find(|e| e.log_id == before[0].log_id).unwrap();
    assert_eq!(original, &before[0]);

    assert!(partition.starts_with("audit_log_p"));
    assert!(db.drop_partition("audit_partitions").await.is_err());
}
