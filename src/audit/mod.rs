//! Audit Log System
//!
//! Field-level, append-only change log with per-scope SHA-256 hash chains,
//! redaction of sensitive values and offline-verifiable exports.

pub mod buffer;
pub mod entry;
pub mod export;
pub mod hash_chain;
pub mod logger;
pub mod query;
pub mod redaction;
pub mod scope;
pub mod verify;

pub use buffer::BufferedAuditLogger;
pub use entry::{AuditAction, AuditEntry, LogReceipt, NewAuditEntry};
pub use export::{load_export_file, AuditExporter, ExportFormat, ExportSummary};
pub use logger::AuditLogger;
pub use query::{ActorActivity, QueryEngine, QueryPage, Timeline};
pub use redaction::RedactionPolicy;
pub use scope::{ChainScope, ScopeLocks};
pub use verify::{verify_chain, ChainVerifier, IntegrityVerifier, VerificationReport};
