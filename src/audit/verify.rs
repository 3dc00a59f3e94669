//! Audit Log Verification
//!
//! Recomputes every digest of a chain scope in sequence order. The running
//! `prev_hash` advances on the stored digest, so one edited entry is flagged
//! alone instead of invalidating everything after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::entry::AuditEntry;
use crate::audit::hash_chain::{self, GENESIS_HASH};
use crate::database::Database;
use crate::error::{AuditError, AuditResult};

const DEFAULT_PAGE_SIZE: i64 = 1_000;

/// An entry older than its predecessor. Reported, does not invalidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampViolation {
    pub log_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_timestamp: DateTime<Utc>,
}

/// Missing sequence numbers between two entries, or after the last stored
/// entry when the scope's tail pointer is further ahead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub after_seq: i64,
    pub next_seq: i64,
    /// Entry right after the gap (or the recorded tail entry).
    pub log_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub scope: String,
    pub is_valid: bool,
    pub entries_verified: u64,
    pub tampered_entries: Vec<String>,
    pub timestamp_violations: Vec<TimestampViolation>,
    pub sequence_gaps: Vec<SequenceGap>,
}

impl VerificationReport {
    pub fn summary(&self) -> String {
        if self.is_valid {
            format!("scope {}: valid ({} entries)", self.scope, self.entries_verified)
        } else {
            format!(
                "scope {}: INVALID ({} entries, {} tampered, {} sequence gaps)",
                self.scope,
                self.entries_verified,
                self.tampered_entries.len(),
                self.sequence_gaps.len()
            )
        }
    }

    /// First finding as an error, for callers that want a strict verdict.
    pub fn into_result(self) -> AuditResult<Self> {
        if let Some(log_id) = self.tampered_entries.first() {
            return Err(AuditError::IntegrityViolation {
                scope: self.scope.clone(),
                log_id: log_id.clone(),
                reason: "stored hash does not match recomputed hash".to_string(),
            });
        }
        if let Some(gap) = self.sequence_gaps.first() {
            return Err(AuditError::IntegrityViolation {
                scope: self.scope.clone(),
                log_id: gap.log_id.clone(),
                reason: format!("entries {}..{} are missing", gap.after_seq + 1, gap.next_seq),
            });
        }
        Ok(self)
    }
}

/// Incremental verifier for one scope. Entries must be pushed in ascending
/// `chain_seq` order.
pub struct ChainVerifier {
    scope: String,
    running_prev: Option<String>,
    last_seq: Option<i64>,
    last_timestamp: Option<DateTime<Utc>>,
    entries_verified: u64,
    tampered_entries: Vec<String>,
    timestamp_violations: Vec<TimestampViolation>,
    sequence_gaps: Vec<SequenceGap>,
}

impl ChainVerifier {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            running_prev: None,
            last_seq: None,
            last_timestamp: None,
            entries_verified: 0,
            tampered_entries: Vec::new(),
            timestamp_violations: Vec::new(),
            sequence_gaps: Vec::new(),
        }
    }

    pub fn last_seq(&self) -> Option<i64> {
        self.last_seq
    }

    pub fn push(&mut self, entry: &AuditEntry) -> AuditResult<()> {
        let anchor = match self.last_seq {
            // Earlier partitions may have been archived.
            None if entry.chain_seq > 1 => entry.prev_hash.clone(),
            None => Some(GENESIS_HASH.to_string()),
            Some(last) if entry.chain_seq != last + 1 => {
                warn!(
                    "Sequence gap in scope {}: {} -> {} at entry {}",
                    self.scope, last, entry.chain_seq, entry.log_id
                );
                self.sequence_gaps.push(SequenceGap {
                    after_seq: last,
                    next_seq: entry.chain_seq,
                    log_id: entry.log_id.clone(),
                });
                entry.prev_hash.clone()
            }
            Some(_) => self.running_prev.clone(),
        };

        let expected = match &anchor {
            Some(prev) => Some(hash_chain::compute(&entry.chain_fields(), prev)?),
            None => None,
        };
        let intact = match (&entry.hash, &expected) {
            (Some(stored), Some(expected)) => {
                stored == expected && entry.prev_hash.as_ref() == anchor.as_ref()
            }
            _ => false,
        };
        if !intact {
            warn!(
                "Tampered audit entry {} (seq {}) in scope {}",
                entry.log_id, entry.chain_seq, self.scope
            );
            self.tampered_entries.push(entry.log_id.clone());
        }

        if let Some(previous) = self.last_timestamp {
            if entry.timestamp < previous {
                self.timestamp_violations.push(TimestampViolation {
                    log_id: entry.log_id.clone(),
                    timestamp: entry.timestamp,
                    previous_timestamp: previous,
                });
            }
        }

        self.running_prev = entry.hash.clone().or(expected);
        self.last_seq = Some(entry.chain_seq);
        self.last_timestamp = Some(entry.timestamp);
        self.entries_verified += 1;
        Ok(())
    }

    /// Record entries the tail pointer says exist but were not seen.
    pub fn expect_tail(&mut self, last_seq: i64, last_log_id: &str) {
        let seen = self.last_seq.unwrap_or(0);
        if last_seq > seen {
            warn!(
                "Scope {} tail is at {} but stored entries end at {}",
                self.scope, last_seq, seen
            );
            self.sequence_gaps.push(SequenceGap {
                after_seq: seen,
                next_seq: last_seq,
                log_id: last_log_id.to_string(),
            });
        }
    }

    pub fn finish(self) -> VerificationReport {
        VerificationReport {
            is_valid: self.tampered_entries.is_empty() && self.sequence_gaps.is_empty(),
            scope: self.scope,
            entries_verified: self.entries_verified,
            tampered_entries: self.tampered_entries,
            timestamp_violations: self.timestamp_violations,
            sequence_gaps: self.sequence_gaps,
        }
    }
}

/// Verify an in-memory run of one scope, sorted by `chain_seq`.
pub fn verify_chain(scope: &str, entries: &[AuditEntry]) -> AuditResult<VerificationReport> {
    let mut verifier = ChainVerifier::new(scope);
    for entry in entries {
        verifier.push(entry)?;
    }
    Ok(verifier.finish())
}

/// Verifies chains stored in the database.
#[derive(Clone)]
pub struct IntegrityVerifier {
    db: Database,
    hashing_enabled: bool,
    page_size: i64,
}

impl IntegrityVerifier {
    pub fn new(db: Database, hashing_enabled: bool) -> Self {
        Self {
            db,
            hashing_enabled,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn verify_scope(&self, scope: &str) -> AuditResult<VerificationReport> {
        if !self.hashing_enabled {
            return Err(AuditError::ConfigError(
                "hash chaining is disabled; there is nothing to verify".to_string(),
            ));
        }

        let mut verifier = ChainVerifier::new(scope);
        let mut after_seq = 0;
        loop {
            let page = self.db.scope_entries(scope, after_seq, self.page_size).await?;
            for entry in &page {
                verifier.push(entry)?;
            }
            match page.last() {
                Some(last) if page.len() as i64 == self.page_size => after_seq = last.chain_seq,
                _ => break,
            }
        }

        if let Some(head) = self.db.chain_head(scope).await? {
            verifier.expect_tail(head.last_seq, &head.last_log_id);
        }

        let report = verifier.finish();
        if report.is_valid {
            info!("Verified {}", report.summary());
        } else {
            warn!("Verification failed: {}", report.summary());
        }
        Ok(report)
    }

    /// Verify every scope that has a tail pointer.
    pub async fn verify_all(&self) -> AuditResult<Vec<VerificationReport>> {
        let heads = self.db.list_chain_scopes().await?;
        let mut reports = Vec::with_capacity(heads.len());
        for head in heads {
            reports.push(self.verify_scope(&head.chain_scope).await?);
        }
        Ok(reports)
    }
}
