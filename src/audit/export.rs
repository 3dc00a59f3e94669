//! Export of audit entries for compliance tooling.
//!
//! Certified exports keep `hash`/`prev_hash` and the chain bookkeeping so the
//! file can be verified offline; internal exports omit the digests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::audit::entry::{format_timestamp, AuditEntry};
use crate::config::AppConfig;
use crate::database::models::{AuditFilter, ScanCursor};
use crate::database::Database;
use crate::error::{AuditError, AuditResult};

const CSV_COLUMNS: [&str; 13] = [
    "log_id",
    "timestamp",
    "entity_type",
    "entity_id",
    "field_name",
    "action",
    "old_value",
    "new_value",
    "actor_id",
    "pii_redacted",
    "metadata",
    "chain_scope",
    "chain_seq",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    JsonLines,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::JsonLines => "jsonl",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json_lines" | "json-lines" | "ndjson" => Ok(ExportFormat::JsonLines),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(AuditError::ValidationError(format!(
                "unknown export format '{}': expected jsonl or csv",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub records: u64,
    /// Digest of the bytes written, for handing over alongside the file.
    pub sha256: String,
}

#[derive(Clone)]
pub struct AuditExporter {
    db: Database,
    page_size: i64,
}

impl AuditExporter {
    pub fn new(db: Database, page_size: i64) -> Self {
        Self {
            db,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(db: Database, config: &AppConfig) -> Self {
        Self::new(db, config.export.page_size)
    }

    /// Write every entry matching `filter` to `path`.
    pub async fn export(
        &self,
        filter: &AuditFilter,
        format: ExportFormat,
        include_hashes: bool,
        path: &Path,
    ) -> AuditResult<ExportSummary> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let (records, sha256) = self
            .export_to_writer(filter, format, include_hashes, &mut file)
            .await?;
        file.sync_all().await?;

        info!(
            "Exported {} audit entries to {} ({})",
            records,
            path.display(),
            format
        );
        Ok(ExportSummary {
            path: path.to_path_buf(),
            format,
            records,
            sha256,
        })
    }

    /// Stream the export into `writer`. Returns the record count and the
    /// digest of the bytes written.
    pub async fn export_to_writer<W>(
        &self,
        filter: &AuditFilter,
        format: ExportFormat,
        include_hashes: bool,
        writer: &mut W,
    ) -> AuditResult<(u64, String)>
    where
        W: AsyncWrite + Unpin,
    {
        let mut hasher = Sha256::new();
        let mut records = 0u64;

        if format == ExportFormat::Csv {
            let header = csv_header(include_hashes);
            hasher.update(header.as_bytes());
            writer.write_all(header.as_bytes()).await?;
        }

        let mut cursor: Option<ScanCursor> = None;
        loop {
            let page = self
                .db
                .scan_after(filter, cursor.as_ref(), self.page_size)
                .await?;

            let mut chunk = String::new();
            for entry in &page {
                match format {
                    ExportFormat::JsonLines => chunk.push_str(&json_line(entry, include_hashes)?),
                    ExportFormat::Csv => chunk.push_str(&csv_row(entry, include_hashes)?),
                }
                chunk.push('\n');
            }
            hasher.update(chunk.as_bytes());
            writer.write_all(chunk.as_bytes()).await?;
            records += page.len() as u64;

            debug!("Exported page of {} entries", page.len());
            let full = page.len() as i64 == self.page_size;
            cursor = page.last().map(ScanCursor::from);
            if !full {
                break;
            }
        }

        writer.flush().await?;
        Ok((records, format!("sha256:{}", hex::encode(hasher.finalize()))))
    }
}

/// Read a JSON Lines export back into entries.
pub async fn load_export_file(path: &Path) -> AuditResult<Vec<AuditEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
            AuditError::SerializationError(format!(
                "failed to parse entry at line {}: {}",
                line_num + 1,
                e
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn json_line(entry: &AuditEntry, include_hashes: bool) -> AuditResult<String> {
    let mut value = serde_json::to_value(entry)?;
    if !include_hashes {
        if let Value::Object(map) = &mut value {
            map.remove("hash");
            map.remove("prev_hash");
        }
    }
    Ok(serde_json::to_string(&value)?)
}

fn csv_header(include_hashes: bool) -> String {
    let mut columns: Vec<&str> = CSV_COLUMNS.to_vec();
    if include_hashes {
        columns.push("prev_hash");
        columns.push("hash");
    }
    let mut header = columns.join(",");
    header.push('\n');
    header
}

fn csv_row(entry: &AuditEntry, include_hashes: bool) -> AuditResult<String> {
    let json_cell = |value: &Option<Value>| value.as_ref().map(|v| v.to_string()).unwrap_or_default();

    let mut cells = vec![
        entry.log_id.clone(),
        format_timestamp(&entry.timestamp),
        entry.entity_type.clone(),
        entry.entity_id.clone(),
        entry.field_name.clone(),
        entry.action.to_string(),
        json_cell(&entry.old_value),
        json_cell(&entry.new_value),
        entry.actor_id.clone().unwrap_or_default(),
        entry.pii_redacted.to_string(),
        serde_json::to_string(&entry.metadata)?,
        entry.chain_scope.clone(),
        entry.chain_seq.to_string(),
    ];
    if include_hashes {
        cells.push(entry.prev_hash.clone().unwrap_or_default());
        cells.push(entry.hash.clone().unwrap_or_default());
    }

    Ok(cells
        .iter()
        .map(|cell| csv_escape(cell))
        .collect::<Vec<_>>()
        .join(","))
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escape_quotes_when_needed() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("\"Dining\""), "\"\"\"Dining\"\"\"");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("jsonl".parse::<ExportFormat>().unwrap(), ExportFormat::JsonLines);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_csv_header_hash_columns() {
        assert!(!csv_header(false).contains("hash"));
        assert!(csv_header(true).trim_end().ends_with("prev_hash,hash"));
    }
}
