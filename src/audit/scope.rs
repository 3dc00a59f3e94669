//! Chain scopes and per-scope write serialization.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{AuditError, AuditResult};

/// Granularity at which one hash chain is maintained.
///
/// `Global` gives a single total order but serializes every writer.
/// `Entity` and `Shard` localize contention at the cost of that total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainScope {
    Global,
    #[default]
    Entity,
    Shard { shards: u32 },
}

impl ChainScope {
    /// Key of the chain an entity's entries belong to.
    pub fn key_for(&self, entity_type: &str, entity_id: &str) -> String {
        match self {
            ChainScope::Global => "global".to_string(),
            ChainScope::Entity => format!("entity:{}:{}", entity_type, entity_id),
            ChainScope::Shard { shards } => {
                let digest = Sha256::digest(format!("{}:{}", entity_type, entity_id).as_bytes());
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&digest[..8]);
                let shard = u64::from_be_bytes(prefix) % u64::from((*shards).max(1));
                format!("shard:{}", shard)
            }
        }
    }
}

/// One async mutex per active chain scope.
#[derive(Clone)]
pub struct ScopeLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
}

/// Held while a writer owns a scope's tail. Released on drop.
pub struct ScopeGuard {
    scope: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock for `scope`, failing with a retryable contention
    /// error once the configured timeout elapses.
    pub async fn acquire(&self, scope: &str) -> AuditResult<ScopeGuard> {
        let started = Instant::now();
        self.acquire_until(scope, tokio::time::Instant::now() + self.timeout, started)
            .await
    }

    /// Acquire several scopes in sorted order so that overlapping bulk
    /// writers cannot deadlock each other. The timeout bounds the whole
    /// set, not each scope.
    pub async fn acquire_many(&self, scopes: &[String]) -> AuditResult<Vec<ScopeGuard>> {
        let mut ordered: Vec<&String> = scopes.iter().collect();
        ordered.sort();
        ordered.dedup();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut guards = Vec::with_capacity(ordered.len());
        for scope in ordered {
            guards.push(self.acquire_until(scope, deadline, started).await?);
        }
        Ok(guards)
    }

    async fn acquire_until(
        &self,
        scope: &str,
        deadline: tokio::time::Instant,
        started: Instant,
    ) -> AuditResult<ScopeGuard> {
        let mutex = self
            .locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
            Ok(guard) => Ok(ScopeGuard {
                scope: scope.to_string(),
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!("Timed out waiting {}ms for chain scope {}", waited_ms, scope);
                Err(AuditError::contention(scope, waited_ms))
            }
        }
    }

    pub fn active_scopes(&self) -> usize {
        self.locks.len()
    }
}

impl ScopeGuard {
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references an idle mutex.
        self.locks
            .remove_if(&self.scope, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_keys() {
        assert_eq!(ChainScope::Global.key_for("txn", "1"), "global");
        assert_eq!(ChainScope::Entity.key_for("txn", "1"), "entity:txn:1");

        let shard = ChainScope::Shard { shards: 8 };
        let key = shard.key_for("txn", "1");
        assert_eq!(key, shard.key_for("txn", "1"));
        let index: u64 = key.trim_start_matches("shard:").parse().unwrap();
        assert!(index < 8);
    }

    #[tokio::test]
    async fn test_same_scope_times_out_with_contention_error() {
        let locks = ScopeLocks::new(Duration::from_millis(50));
        let _held = locks.acquire("entity:txn:1").await.unwrap();

        let err = locks.acquire("entity:txn:1").await.err().unwrap();
        assert!(matches!(err, AuditError::ContentionError { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_different_scopes_do_not_block() {
        let locks = ScopeLocks::new(Duration::from_millis(50));
        let _a = locks.acquire("entity:txn:1").await.unwrap();
        let b = locks.acquire("entity:txn:2").await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_many_shares_one_deadline() {
        let locks = ScopeLocks::new(Duration::from_millis(200));
        let held_a = locks.acquire("a").await.unwrap();
        let _held_b = locks.acquire("b").await.unwrap();

        // "a" frees up late in the window, leaving too little time for "b".
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held_a);
        });

        let started = Instant::now();
        let err = locks
            .acquire_many(&["a".to_string(), "b".to_string()])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuditError::ContentionError { .. }));
        assert!(started.elapsed() < Duration::from_millis(340));
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let locks = ScopeLocks::new(Duration::from_millis(50));
        {
            let _guards = locks
                .acquire_many(&["b".to_string(), "a".to_string(), "a".to_string()])
                .await
                .unwrap();
            assert_eq!(locks.active_scopes(), 2);
        }
        assert_eq!(locks.active_scopes(), 0);
    }
}
