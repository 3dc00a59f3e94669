use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info};

use field_audit::audit::verify::{ChainVerifier, VerificationReport};
use field_audit::audit::{load_export_file, AuditEntry};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify the hash chains of a certified audit export")
        .arg(
            Arg::new("export")
                .short('e')
                .long("export")
                .value_name("PATH")
                .help("Path to a JSON Lines export made with hashes")
                .required(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let path = matches
        .get_one::<String>("export")
        .ok_or_else(|| anyhow!("--export is required"))?;

    let reports = verify_export(Path::new(path)).await?;
    let failed: Vec<&VerificationReport> = reports.iter().filter(|r| !r.is_valid).collect();

    if !quiet {
        for report in &reports {
            println!("{}", report.summary());
            if verbose {
                for log_id in &report.tampered_entries {
                    println!("  tampered: {}", log_id);
                }
                for gap in &report.sequence_gaps {
                    println!("  missing: seq {}..{} before {}", gap.after_seq + 1, gap.next_seq, gap.log_id);
                }
                for violation in &report.timestamp_violations {
                    println!("  clock: {} is older than its predecessor", violation.log_id);
                }
            }
        }
    }

    if !failed.is_empty() {
        error!("{} of {} chain scopes failed verification", failed.len(), reports.len());
        std::process::exit(1);
    }

    info!("Export verified: {} chain scopes", reports.len());
    Ok(())
}

/// Group the export by chain scope and verify each run in sequence order.
async fn verify_export(path: &Path) -> Result<Vec<VerificationReport>> {
    if !path.exists() {
        return Err(anyhow!("export file does not exist: {}", path.display()));
    }

    let entries = load_export_file(path).await?;
    if entries.iter().any(|e| e.hash.is_none()) {
        return Err(anyhow!(
            "{} was exported without hashes and cannot be verified",
            path.display()
        ));
    }

    let mut scopes: BTreeMap<String, Vec<AuditEntry>> = BTreeMap::new();
    for entry in entries {
        scopes.entry(entry.chain_scope.clone()).or_default().push(entry);
    }

    let mut reports = Vec::with_capacity(scopes.len());
    for (scope, mut entries) in scopes {
        entries.sort_by_key(|e| e.chain_seq);
        let mut verifier = ChainVerifier::new(scope);
        for entry in &entries {
            verifier.push(entry)?;
        }
        reports.push(verifier.finish());
    }
    Ok(reports)
}
