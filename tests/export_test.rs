//! Export tests: JSON Lines, CSV and offline verification of certified exports

mod common;

use field_audit::audit::{
    load_export_file, verify_chain, AuditExporter, ExportFormat, NewAuditEntry,
};
use field_audit::database::models::{AuditFilter, SortOrder};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

use common::{category_change, setup_test_db, test_logger};

#[tokio::test]
async fn test_certified_jsonl_export_verifies_offline() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger
        .log_bulk((0..7).map(|i| category_change("e1", "u1", i)).collect())
        .await?;

    let dir = tempdir()?;
    let path = dir.path().join("exports").join("audit.jsonl");
    let summary = AuditExporter::new(db, 3)
        .export(
            &AuditFilter::new().order(SortOrder::OldestFirst),
            ExportFormat::JsonLines,
            true,
            &path,
        )
        .await?;
    assert_eq!(summary.records, 7);

    let bytes = std::fs::read(&path)?;
    assert_eq!(summary.sha256, format!("sha256:{}", hex::encode(Sha256::digest(&bytes))));

    let entries = load_export_file(&path).await?;
    assert_eq!(entries.len(), 7);
    let report = verify_chain("entity:transaction:e1", &entries)?;
    assert!(report.is_valid);
    assert_eq!(report.entries_verified, 7);
    Ok(())
}

#[tokio::test]
async fn test_internal_export_omits_hashes() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    test_logger(&db).log(category_change("e1", "u1", 0)).await?;

    let dir = tempdir()?;
    let path = dir.path().join("internal.jsonl");
    AuditExporter::new(db, 100)
        .export(&AuditFilter::new(), ExportFormat::JsonLines, false, &path)
        .await?;

    let line = std::fs::read_to_string(&path)?;
    let value: serde_json::Value = serde_json::from_str(line.trim())?;
    assert!(value.get("hash").is_none());
    assert!(value.get("prev_hash").is_none());
    assert_eq!(value["new_value"], "new-0");
    Ok(())
}

#[tokio::test]
async fn test_csv_export_escapes_and_redacts() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    test_logger(&db)
        .log_bulk(vec![
            NewAuditEntry::new("e1", "transaction", "memo", "override")
                .old_value("a, b")
                .new_value("say \"hi\"")
                .actor("u1"),
            NewAuditEntry::new("c1", "customer", "ssn", "recorded")
                .new_value("123-45-6789")
                .actor("u1"),
        ])
        .await?;

    let dir = tempdir()?;
    let path = dir.path().join("audit.csv");
    let summary = AuditExporter::new(db, 100)
        .export(&AuditFilter::new(), ExportFormat::Csv, true, &path)
        .await?;
    assert_eq!(summary.records, 2);

    let content = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("log_id,timestamp,entity_type"));
    assert!(lines[0].ends_with("prev_hash,hash"));
    assert!(content.contains("\"\"\"a, b\"\"\""));
    assert!(content.contains("[REDACTED]"));
    assert!(!content.contains("123-45-6789"));
    Ok(())
}

#[tokio::test]
async fn test_export_respects_filter() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await;
    let logger = test_logger(&db);
    logger
        .log_bulk(vec![
            category_change("e1", "u1", 0),
            category_change("e2", "u2", 1),
            category_change("e3", "u1", 2),
        ])
        .await?;

    let mut buffer: Vec<u8> = Vec::new();
    let (records, _) = AuditExporter::new(db, 1)
        .export_to_writer(
            &AuditFilter::new().actor("u1"),
            ExportFormat::JsonLines,
            true,
            &mut buffer,
        )
        .await?;
    assert_eq!(records, 2);
    assert_eq!(String::from_utf8(buffer)?.lines().count(), 2);
    Ok(())
}
