//! Redaction Filter
//!
//! Replaces values of sensitive fields with a fixed sentinel before they are
//! hashed or stored. The digest therefore covers the redacted view only: a
//! valid chain proves the redacted record is unchanged, not the plaintext.

use serde_json::Value;
use std::collections::HashSet;

use crate::audit::entry::ValidatedEntry;
use crate::config::RedactionConfig;

pub const DEFAULT_SENTINEL: &str = "[REDACTED]";

/// Static set of field names whose values must never be persisted.
#[derive(Debug, Clone)]
pub struct RedactionPolicy {
    sensitive_fields: HashSet<String>,
    sentinel: String,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self::from_config(&RedactionConfig::default())
    }
}

impl RedactionPolicy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sensitive_fields: fields
                .into_iter()
                .map(|f| f.as_ref().trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
            sentinel: DEFAULT_SENTINEL.to_string(),
        }
    }

    pub fn from_config(config: &RedactionConfig) -> Self {
        Self::new(&config.sensitive_fields).with_sentinel(config.sentinel.clone())
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn is_sensitive(&self, field_name: &str) -> bool {
        self.sensitive_fields.contains(&field_name.trim().to_lowercase())
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Returns the value to persist and whether it was replaced.
    pub fn redact(&self, field_name: &str, value: Option<Value>) -> (Option<Value>, bool) {
        match value {
            Some(_) if self.is_sensitive(field_name) => {
                (Some(Value::String(self.sentinel.clone())), true)
            }
            other => (other, false),
        }
    }

    /// Redact both values of an entry and report whether either changed.
    pub fn apply(&self, mut entry: ValidatedEntry) -> (ValidatedEntry, bool) {
        let (old_value, old_redacted) = self.redact(&entry.field_name, entry.old_value.take());
        let (new_value, new_redacted) = self.redact(&entry.field_name, entry.new_value.take());
        entry.old_value = old_value;
        entry.new_value = new_value;
        (entry, old_redacted || new_redacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::NewAuditEntry;
    use serde_json::json;

    #[test]
    fn test_sensitive_field_is_replaced() {
        let policy = RedactionPolicy::new(["ssn"]);
        let (value, redacted) = policy.redact("ssn", Some(json!("123-45-6789")));
        assert!(redacted);
        assert_eq!(value, Some(json!(DEFAULT_SENTINEL)));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let policy = RedactionPolicy::new(["Account_Number"]);
        assert!(policy.is_sensitive("account_number"));
        assert!(policy.is_sensitive("ACCOUNT_NUMBER"));
        assert!(!policy.is_sensitive("account"));
    }

    #[test]
    fn test_absent_value_stays_absent() {
        let policy = RedactionPolicy::new(["ssn"]);
        assert_eq!(policy.redact("ssn", None), (None, false));
    }

    #[test]
    fn test_non_sensitive_field_passes_through() {
        let policy = RedactionPolicy::new(["ssn"]);
        let (value, redacted) = policy.redact("category", Some(json!("Dining")));
        assert!(!redacted);
        assert_eq!(value, Some(json!("Dining")));
    }

    #[test]
    fn test_apply_redacts_both_values() {
        let policy = RedactionPolicy::new(["ssn"]).with_sentinel("***");
        let entry = NewAuditEntry::new("c1", "customer", "ssn", "override")
            .old_value("111-11-1111")
            .new_value("222-22-2222")
            .validate(None)
            .unwrap();

        let (entry, redacted) = policy.apply(entry);
        assert!(redacted);
        assert_eq!(entry.old_value, Some(json!("***")));
        assert_eq!(entry.new_value, Some(json!("***")));
    }
}
