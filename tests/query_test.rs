//! Query engine tests: pagination, filters, timelines and actor activity

mod common;

use chrono::Duration;
use field_audit::audit::{AuditAction, NewAuditEntry, QueryEngine};
use field_audit::database::models::{AuditFilter, SortOrder};
use proptest::prelude::*;
use serde_json::json;

use common::{base_time, category_change, setup_test_db, test_logger};

#[tokio::test]
async fn test_first_page_reports_total_and_more() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    let entries = (0..5).map(|i| category_change(&format!("e{}", i), "u1", i)).collect();
    logger.log_bulk(entries).await.unwrap();
    logger.log(category_change("e1", "u2", 10)).await.unwrap();

    let engine = QueryEngine::new(db, 100);
    let page = engine.query(&AuditFilter::new().actor("u1"), 0, 2).await.unwrap();
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.total_count, 5);
    assert!(page.has_more);

    let last = engine.query(&AuditFilter::new().actor("u1"), 4, 2).await.unwrap();
    assert_eq!(last.entries.len(), 1);
    assert!(!last.has_more);
}

#[tokio::test]
async fn test_default_order_is_newest_first() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    let entries = (0..3).map(|i| category_change("e1", "u1", i)).collect();
    logger.log_bulk(entries).await.unwrap();

    let engine = QueryEngine::new(db, 100);
    let newest = engine.query(&AuditFilter::new(), 0, 10).await.unwrap();
    assert_eq!(newest.entries[0].new_value, Some(json!("new-2")));

    let oldest = engine
        .query(&AuditFilter::new().order(SortOrder::OldestFirst), 0, 10)
        .await
        .unwrap();
    assert_eq!(oldest.entries[0].new_value, Some(json!("new-0")));
}

#[tokio::test]
async fn test_filters_combine() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger
        .log_bulk(vec![
            category_change("e1", "u1", 0).meta("source", "ui"),
            category_change("e2", "u1", 1).meta("source", "import"),
            NewAuditEntry::new("e1", "transaction", "amount", "revert")
                .old_value(10)
                .new_value(12)
                .actor("u2")
                .meta("batch", 7)
                .at(base_time() + Duration::minutes(2)),
            NewAuditEntry::new("a1", "account", "nickname", "delete")
                .old_value("Main")
                .actor("u1")
                .at(base_time() + Duration::days(40)),
        ])
        .await
        .unwrap();

    let engine = QueryEngine::new(db, 100);
    let count = |filter: AuditFilter| {
        let engine = engine.clone();
        async move { engine.count(&filter).await.unwrap() }
    };

    assert_eq!(count(AuditFilter::new()).await, 4);
    assert_eq!(count(AuditFilter::new().entity_type("transaction")).await, 3);
    assert_eq!(count(AuditFilter::new().entity("e1")).await, 2);
    assert_eq!(count(AuditFilter::new().entity("e1").entity("e2")).await, 3);
    assert_eq!(count(AuditFilter::new().action(AuditAction::Revert)).await, 1);
    assert_eq!(count(AuditFilter::new().metadata_eq("source", "ui")).await, 1);
    assert_eq!(count(AuditFilter::new().metadata_eq("batch", 7)).await, 1);
    assert_eq!(count(AuditFilter::new().actor("u1").field("category")).await, 2);
    assert_eq!(
        count(AuditFilter::new().scope("entity:transaction:e1")).await,
        2
    );

    // Half-open range: the start bound is inclusive, the end bound exclusive.
    let start = base_time() + Duration::minutes(1);
    let end = base_time() + Duration::minutes(2);
    assert_eq!(count(AuditFilter::new().between(Some(start), Some(end))).await, 1);
    assert_eq!(
        count(AuditFilter::new().between(Some(base_time() + Duration::days(30)), None)).await,
        1
    );
}

#[tokio::test]
async fn test_non_scalar_metadata_predicate_is_rejected() {
    let db = setup_test_db().await;
    test_logger(&db).log(category_change("e1", "u1", 0)).await.unwrap();

    let err = QueryEngine::new(db, 100)
        .count(&AuditFilter::new().metadata_eq("tags", json!(["a"])))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scalar"));
}

#[tokio::test]
async fn test_limit_is_clamped_to_max_page_size() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    let entries = (0..6).map(|i| category_change("e1", "u1", i)).collect();
    logger.log_bulk(entries).await.unwrap();

    let page = QueryEngine::new(db, 4)
        .query(&AuditFilter::new(), 0, 1_000)
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 4);
    assert_eq!(page.total_count, 6);
    assert!(page.has_more);
}

#[tokio::test]
async fn test_timeline_tracks_current_value() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    let at = |m: i64| base_time() + Duration::minutes(m);
    logger
        .log_bulk(vec![
            NewAuditEntry::new("e1", "transaction", "memo", "recorded").new_value("lunch").at(at(0)),
            NewAuditEntry::new("e1", "transaction", "memo", "override")
                .old_value("lunch")
                .new_value("team lunch")
                .at(at(1)),
            NewAuditEntry::new("e1", "transaction", "category", "override")
                .old_value("Food")
                .new_value("Dining")
                .at(at(2)),
        ])
        .await
        .unwrap();

    let engine = QueryEngine::new(db.clone(), 1);
    let timeline = engine.get_timeline("e1", "memo").await.unwrap();
    assert_eq!(timeline.changes.len(), 2);
    assert_eq!(timeline.changes[0].action, AuditAction::Recorded);
    assert_eq!(timeline.current_value, Some(json!("team lunch")));

    test_logger(&db)
        .log(NewAuditEntry::new("e1", "transaction", "memo", "delete").old_value("team lunch").at(at(3)))
        .await
        .unwrap();
    let timeline = engine.get_timeline("e1", "memo").await.unwrap();
    assert_eq!(timeline.changes.len(), 3);
    assert_eq!(timeline.current_value, None);
}

#[tokio::test]
async fn test_actor_activity_summary() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger
        .log_bulk(vec![
            category_change("e1", "u1", 0),
            category_change("e2", "u1", 1),
            NewAuditEntry::new("a1", "account", "nickname", "recorded")
                .new_value("Main")
                .actor("u1")
                .at(base_time() + Duration::minutes(2)),
            category_change("e3", "u2", 3),
        ])
        .await
        .unwrap();

    let activity = QueryEngine::new(db, 100)
        .get_actor_activity("u1", None, None)
        .await
        .unwrap();
    assert_eq!(activity.total, 3);
    assert_eq!(activity.by_action.get("override"), Some(&2));
    assert_eq!(activity.by_action.get("recorded"), Some(&1));
    assert_eq!(activity.by_entity_type.get("transaction"), Some(&2));
    assert_eq!(activity.top_fields[0].key, "category");
    assert_eq!(activity.top_fields[0].count, 2);
}

#[tokio::test]
async fn test_query_spans_monthly_partitions() {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    let entries = (0..3)
        .map(|i| category_change("e1", "u1", 0).at(base_time() + Duration::days(31 * i)))
        .collect();
    logger.log_bulk(entries).await.unwrap();

    assert_eq!(db.list_partitions().await.unwrap().len(), 3);
    let page = QueryEngine::new(db, 100)
        .query(&AuditFilter::new(), 0, 10)
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.entries.len(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_pages_sum_to_count(total in 0usize..25, page_size in 1i64..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let db = setup_test_db().await;
            let logger = test_logger(&db);
            let entries: Vec<_> = (0..total)
                .map(|i| category_change(&format!("e{}", i % 3), "u1", i as i64))
                .collect();
            logger.log_bulk(entries).await.unwrap();

            let engine = QueryEngine::new(db, 100);
            let filter = AuditFilter::new().actor("u1");
            let count = engine.count(&filter).await.unwrap();

            let mut offset = 0;
            let mut seen = 0;
            loop {
                let page = engine.query(&filter, offset, page_size).await.unwrap();
                seen += page.entries.len() as i64;
                offset += page_size;
                if !page.has_more {
                    assert!(offset >= count);
                    break;
                }
                assert_eq!(page.entries.len() as i64, page_size);
            }
            assert_eq!(seen, count);
            assert_eq!(count, total as i64);
        });
    }
}
