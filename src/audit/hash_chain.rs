//! Hash Chain Engine
//!
//! Computes the SHA-256 digest of an entry's redacted core fields chained to
//! the digest of the previous entry in the same scope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::audit::entry::{format_timestamp, AuditAction};
use crate::error::AuditResult;

/// `prev_hash` of the first entry in every chain scope.
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// The fields covered by an entry's digest.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChainFields<'a> {
    pub entity_id: &'a str,
    pub entity_type: &'a str,
    pub field_name: &'a str,
    pub action: AuditAction,
    pub old_value: Option<&'a Value>,
    pub new_value: Option<&'a Value>,
    pub actor_id: Option<&'a str>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: &'a DateTime<Utc>,
    pub metadata: &'a BTreeMap<String, Value>,
}

fn serialize_timestamp<S>(ts: &&DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

/// Canonical byte form: a JSON object with keys sorted at every level.
pub fn canonical_bytes(fields: &ChainFields<'_>) -> AuditResult<Vec<u8>> {
    // serde_json::Value objects are BTreeMap-backed, so the round trip
    // through Value sorts keys independently of declaration order.
    let value = serde_json::to_value(fields)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Digest of `fields` chained to `prev_hash`.
pub fn compute(fields: &ChainFields<'_>, prev_hash: &str) -> AuditResult<String> {
    let canonical = canonical_bytes(fields)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update(prev_hash.as_bytes());
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
