use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use field_audit::audit::entry::{parse_timestamp, AuditAction, NewAuditEntry};
use field_audit::audit::{AuditExporter, AuditLogger, ExportFormat, IntegrityVerifier, QueryEngine};
use field_audit::database::models::{AuditFilter, SortOrder};
use field_audit::{AppConfig, Database};

#[derive(Parser)]
#[command(name = "field-audit")]
#[command(about = "Append-only, hash-chained field change audit log")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the configuration
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one field change
    Log {
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        field: String,
        /// recorded, override, revert or delete
        #[arg(long)]
        action: String,
        /// Previous value (JSON, or plain text)
        #[arg(long)]
        old: Option<String>,
        /// New value (JSON, or plain text)
        #[arg(long)]
        new: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        /// Metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, Value)>,
    },
    /// Changes of one entity, newest first
    History {
        entity_id: String,
        #[arg(long)]
        field: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Full change timeline of one field
    Timeline { entity_id: String, field: String },
    /// Filtered, paginated search
    Query {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Activity summary of one actor
    Activity {
        actor_id: String,
        #[arg(long, value_parser = parse_time)]
        since: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_time)]
        until: Option<DateTime<Utc>>,
    },
    /// Verify hash chains; exits non-zero on any finding
    Verify {
        /// Single chain scope; all scopes when omitted
        #[arg(long)]
        scope: Option<String>,
    },
    /// Export matching entries to a file
    Export {
        #[command(flatten)]
        filter: FilterArgs,
        /// jsonl or csv
        #[arg(long, default_value = "jsonl")]
        format: String,
        /// Omit hash and prev_hash (internal export)
        #[arg(long)]
        without_hashes: bool,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Inspect and archive monthly partitions
    Partitions {
        #[command(subcommand)]
        command: PartitionCommands,
    },
}

#[derive(Subcommand)]
enum PartitionCommands {
    /// List all partitions
    List,
    /// Partitions past the retention period
    Expired {
        /// Overrides retention.retention_days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Drop one partition (after it has been archived)
    Drop { name: String },
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    actor: Option<String>,
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long = "entity")]
    entity_ids: Vec<String>,
    #[arg(long = "field")]
    fields: Vec<String>,
    #[arg(long = "action")]
    actions: Vec<String>,
    #[arg(long, value_parser = parse_time)]
    since: Option<DateTime<Utc>>,
    #[arg(long, value_parser = parse_time)]
    until: Option<DateTime<Utc>>,
    /// Metadata equality as key=value, repeatable
    #[arg(long = "meta", value_parser = parse_key_value)]
    metadata: Vec<(String, Value)>,
    #[arg(long)]
    scope: Option<String>,
    #[arg(long)]
    oldest_first: bool,
}

impl FilterArgs {
    fn into_filter(self) -> Result<AuditFilter> {
        let mut filter = AuditFilter::new().between(self.since, self.until);
        filter.actor_id = self.actor;
        filter.entity_type = self.entity_type;
        filter.entity_ids = self.entity_ids;
        filter.field_names = self.fields;
        filter.chain_scope = self.scope;
        filter.actions = self
            .actions
            .iter()
            .map(|a| a.parse::<AuditAction>())
            .collect::<Result<_, _>>()?;
        for (key, value) in self.metadata {
            filter = filter.metadata_eq(key, value);
        }
        if self.oldest_first {
            filter = filter.order(SortOrder::OldestFirst);
        }
        Ok(filter)
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    Ok((key.to_string(), parse_value(value)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).map_err(|e| e.to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "field_audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    let db = Database::connect(&config.database).await?;

    match cli.command {
        Commands::Log {
            entity_id,
            entity_type,
            field,
            action,
            old,
            new,
            actor,
            metadata,
        } => {
            let mut entry = NewAuditEntry::new(entity_id, entity_type, field, action);
            entry.old_value = old.as_deref().map(parse_value);
            entry.new_value = new.as_deref().map(parse_value);
            entry.actor_id = actor;
            entry.metadata = metadata.into_iter().collect();

            let receipt = AuditLogger::from_config(db, &config).log(entry).await?;
            print_json(&receipt)?;
        }
        Commands::History {
            entity_id,
            field,
            limit,
        } => {
            let engine = QueryEngine::from_config(db, &config);
            let entries = engine
                .get_history(&entity_id, field.as_deref(), &[], limit)
                .await?;
            print_json(&entries)?;
        }
        Commands::Timeline { entity_id, field } => {
            let timeline = QueryEngine::from_config(db, &config)
                .get_timeline(&entity_id, &field)
                .await?;
            print_json(&timeline)?;
        }
        Commands::Query {
            filter,
            offset,
            limit,
        } => {
            let page = QueryEngine::from_config(db, &config)
                .query(&filter.into_filter()?, offset, limit)
                .await?;
            print_json(&page)?;
        }
        Commands::Activity {
            actor_id,
            since,
            until,
        } => {
            let activity = QueryEngine::from_config(db, &config)
                .get_actor_activity(&actor_id, since, until)
                .await?;
            print_json(&activity)?;
        }
        Commands::Verify { scope } => {
            let verifier = IntegrityVerifier::new(db, config.chain.enabled);
            let reports = match scope {
                Some(scope) => vec![verifier.verify_scope(&scope).await?],
                None => verifier.verify_all().await?,
            };
            print_json(&reports)?;
            if reports.iter().any(|r| !r.is_valid) {
                warn!("Integrity violations found");
                std::process::exit(1);
            }
            info!("All {} chain scopes verified", reports.len());
        }
        Commands::Export {
            filter,
            format,
            without_hashes,
            output,
        } => {
            let format: ExportFormat = format.parse()?;
            let summary = AuditExporter::from_config(db, &config)
                .export(&filter.into_filter()?, format, !without_hashes, &output)
                .await?;
            print_json(&summary)?;
        }
        Commands::Partitions { command } => match command {
            PartitionCommands::List => print_json(&db.list_partitions().await?)?,
            PartitionCommands::Expired { days } => {
                let days = days.unwrap_or(config.retention.retention_days);
                let cutoff = Utc::now() - chrono::Duration::days(days);
                print_json(&db.partitions_older_than(&cutoff).await?)?;
            }
            PartitionCommands::Drop { name } => {
                let known = db.list_partitions().await?;
                if !known.iter().any(|p| p.name == name) {
                    return Err(anyhow!("unknown partition '{}'", name));
                }
                db.drop_partition(&name).await?;
                println!("dropped {}", name);
            }
        },
    }

    Ok(())
}
