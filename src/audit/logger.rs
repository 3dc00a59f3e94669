//! Audit Logger
//!
//! Ingestion pipeline: validate, redact, serialize per chain scope, hash and
//! append. A call returns only once its entries are committed.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::entry::{AuditEntry, LogReceipt, NewAuditEntry, ValidatedEntry};
use crate::audit::hash_chain::{self, GENESIS_HASH};
use crate::audit::redaction::RedactionPolicy;
use crate::audit::scope::{ChainScope, ScopeLocks};
use crate::config::AppConfig;
use crate::database::Database;
use crate::error::AuditResult;

/// Tail of a chain scope while a batch is being sealed.
#[derive(Debug, Clone, Default)]
struct Tail {
    last_hash: Option<String>,
    last_seq: i64,
}

#[derive(Clone)]
pub struct AuditLogger {
    db: Database,
    policy: Arc<RedactionPolicy>,
    scope: ChainScope,
    hashing: bool,
    locks: ScopeLocks,
}

impl AuditLogger {
    pub fn new(db: Database, policy: RedactionPolicy, scope: ChainScope, locks: ScopeLocks) -> Self {
        Self {
            db,
            policy: Arc::new(policy),
            scope,
            hashing: true,
            locks,
        }
    }

    pub fn from_config(db: Database, config: &AppConfig) -> Self {
        Self::new(
            db,
            RedactionPolicy::from_config(&config.redaction),
            config.chain.scope,
            ScopeLocks::new(config.chain.lock_timeout()),
        )
        .with_hashing(config.chain.enabled)
    }

    /// Disable to store entries without `hash`/`prev_hash`.
    pub fn with_hashing(mut self, enabled: bool) -> Self {
        self.hashing = enabled;
        self
    }

    pub fn hashing_enabled(&self) -> bool {
        self.hashing
    }

    pub fn chain_scope(&self) -> ChainScope {
        self.scope
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Record one field change.
    pub async fn log(&self, entry: NewAuditEntry) -> AuditResult<LogReceipt> {
        let validated = entry.validate(None)?;
        let (validated, redacted) = self.policy.apply(validated);
        let scope_key = self.scope.key_for(&validated.entity_type, &validated.entity_id);

        let _guard = self.locks.acquire(&scope_key).await?;
        let mut tail = self.load_tail(&scope_key).await?;
        let entry = self.seal(validated, redacted, scope_key, &mut tail)?;
        self.db.insert(&entry).await?;

        debug!("Appended audit entry: {}", entry.summary());
        Ok(LogReceipt::from(&entry))
    }

    /// Record several changes atomically. Every entry is validated before
    /// anything is locked or hashed; one invalid entry rejects the batch.
    pub async fn log_bulk(&self, entries: Vec<NewAuditEntry>) -> AuditResult<Vec<LogReceipt>> {
        let validated = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.validate(Some(index)))
            .collect::<AuditResult<Vec<_>>>()?;
        self.append(&validated).await
    }

    /// Redact, chain and commit already-validated entries in order.
    pub(crate) async fn append(&self, entries: &[ValidatedEntry]) -> AuditResult<Vec<LogReceipt>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let prepared: Vec<(ValidatedEntry, bool, String)> = entries
            .iter()
            .cloned()
            .map(|entry| {
                let (entry, redacted) = self.policy.apply(entry);
                let scope_key = self.scope.key_for(&entry.entity_type, &entry.entity_id);
                (entry, redacted, scope_key)
            })
            .collect();

        let scopes: Vec<String> = prepared.iter().map(|(_, _, s)| s.clone()).collect();
        let _guards = self.locks.acquire_many(&scopes).await?;

        let mut tails: HashMap<String, Tail> = HashMap::new();
        let mut sealed = Vec::with_capacity(prepared.len());
        for (entry, redacted, scope_key) in prepared {
            if !tails.contains_key(&scope_key) {
                let tail = self.load_tail(&scope_key).await?;
                tails.insert(scope_key.clone(), tail);
            }
            let tail = tails.entry(scope_key.clone()).or_default();
            sealed.push(self.seal(entry, redacted, scope_key, tail)?);
        }

        self.db.insert_batch(&sealed).await?;
        info!(
            "Appended {} audit entries across {} chain scopes",
            sealed.len(),
            tails.len()
        );
        Ok(sealed.iter().map(LogReceipt::from).collect())
    }

    async fn load_tail(&self, scope_key: &str) -> AuditResult<Tail> {
        Ok(match self.db.chain_head(scope_key).await? {
            Some(head) => Tail {
                last_hash: head.last_hash,
                last_seq: head.last_seq,
            },
            None => Tail::default(),
        })
    }

    /// Assign identity, position and digest, then advance `tail`.
    fn seal(
        &self,
        entry: ValidatedEntry,
        pii_redacted: bool,
        chain_scope: String,
        tail: &mut Tail,
    ) -> AuditResult<AuditEntry> {
        let mut sealed = AuditEntry {
            log_id: Uuid::new_v4().to_string(),
            entity_id: entry.entity_id,
            entity_type: entry.entity_type,
            field_name: entry.field_name,
            action: entry.action,
            old_value: entry.old_value,
            new_value: entry.new_value,
            actor_id: entry.actor_id,
            timestamp: entry.timestamp,
            metadata: entry.metadata,
            hash: None,
            prev_hash: None,
            pii_redacted,
            chain_scope,
            chain_seq: tail.last_seq + 1,
        };

        if self.hashing {
            let prev_hash = tail
                .last_hash
                .clone()
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            sealed.hash = Some(hash_chain::compute(&sealed.chain_fields(), &prev_hash)?);
            sealed.prev_hash = Some(prev_hash);
        }

        tail.last_hash = sealed.hash.clone();
        tail.last_seq = sealed.chain_seq;
        Ok(sealed)
    }
}
