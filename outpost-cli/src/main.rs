use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use outpost_core::{into_record, EngineConfig, FileStore, Filters, LocalStore, Record};
use outpost_sync::{Engine, HttpRemote, RemoteBackend};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
}

#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Offline-first table client", long_about = None)]
struct Cli {
    /// Directory holding the local store
    #[arg(long, value_name = "PATH", default_value = ".outpost")]
    data_dir: PathBuf,

    /// Base URL of the REST backend
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:54321")]
    remote_url: String,

    /// API key sent with every request
    #[arg(long, default_value = "")]
    api_key: String,

    /// Bearer token of the signed-in user
    #[arg(long)]
    access_token: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity and queue state
    Status,
    /// List records of a table
    List {
        /// Table name
        table: String,
        /// Equality filter, `field=value` (repeatable)
        #[arg(short, long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        /// In-set filter, `field=a,b,c` (repeatable)
        #[arg(long = "in", value_name = "FIELD=V1,V2")]
        in_filters: Vec<String>,
    },
    /// Get a record by id
    Get {
        /// Table name
        table: String,
        /// Record id
        id: String,
    },
    /// Create a record
    Create {
        /// Table name
        table: String,
        /// Record as JSON
        data: String,
    },
    /// Update a record; include `version` to guard against concurrent edits
    Update {
        /// Table name
        table: String,
        /// Record id
        id: String,
        /// Changed fields as JSON
        data: String,
    },
    /// Delete a record
    Delete {
        /// Table name
        table: String,
        /// Record id
        id: String,
    },
    /// Drain the sync queue and reconcile every known table
    Sync,
    /// Pull and merge one table, or every known table
    Reconcile {
        /// Table name
        table: Option<String>,
    },
    /// Show queued operations
    Queue,
    /// Re-queue operations that exhausted their retries
    RetryFailed,
}

#[tokio::main]
async fn main() {
    // Default to info level, can override with RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        // Engine errors are reported in their structured form
        match err.downcast_ref::<outpost_core::Error>() {
            Some(engine_err) => match serde_json::to_string_pretty(&engine_err.to_failure()) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("Error: {}", engine_err),
            },
            None => eprintln!("Error: {:#}", err),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let engine = open_engine(&cli)?;
    let output = cli.output;

    match cli.command {
        Commands::Status => {
            let online = engine.is_available().await;
            let status = engine.sync_queue_status();
            match output {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "online": online,
                    "clientId": engine.client_id().as_str(),
                    "queue": status,
                }))?,
                OutputFormat::Table => {
                    let oldest = status
                        .oldest_timestamp
                        .map(|ts| ts.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}",
                        table::format_pairs_table(&[
                            ("online", online.to_string()),
                            ("client id", status.client_id.clone()),
                            ("pending", status.pending.to_string()),
                            ("failed", status.failed.to_string()),
                            ("inserts", status.inserts.to_string()),
                            ("updates", status.updates.to_string()),
                            ("deletes", status.deletes.to_string()),
                            ("oldest queued (ms)", oldest),
                        ])
                    );
                }
            }
        }

        Commands::List {
            table,
            filters,
            in_filters,
        } => {
            let filters = parse_filters(&filters, &in_filters)?;
            let response = engine.get_all(&table, &filters).await?;
            match output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    println!("{}", table::format_records_table(&response.data));
                    println!();
                    println!(
                        "Count: {}, Source: {:?}, Online: {}",
                        response.data.len(),
                        response.source,
                        response.online
                    );
                }
            }
        }

        Commands::Get { table, id } => {
            let response = engine.get_by_id(&table, &id).await?;
            print_record(output, &response.data, &response)?;
        }

        Commands::Create { table, data } => {
            let response = engine.create(&table, parse_record(&data)?).await?;
            print_record(output, &response.data, &response)?;
        }

        Commands::Update { table, id, data } => {
            let response = engine.update(&table, &id, parse_record(&data)?).await?;
            print_record(output, &response.data, &response)?;
        }

        Commands::Delete { table, id } => {
            let response = engine.remove(&table, &id).await?;
            match output {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table if response.online => println!("✓ Deleted {}/{}", table, id),
                OutputFormat::Table => println!("✓ Deleted {}/{} locally (queued)", table, id),
            }
        }

        Commands::Sync => {
            if !engine.is_available().await {
                anyhow::bail!("backend at {} is not reachable", cli.remote_url);
            }
            let report = engine.sync_now().await?;
            match output {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => {
                    let d = report.drain;
                    println!(
                        "✓ Synced {}, conflicts {}, errors {}, dropped {}, deferred {}",
                        d.synced, d.conflicts, d.errors, d.dropped, d.deferred
                    );
                    println!("✓ Reconciled {} tables", report.reconciled.len());
                }
            }
        }

        Commands::Reconcile { table } => {
            let reports = match table {
                Some(table) => vec![engine.reconcile(&table).await?],
                None => engine.reconcile_all().await?,
            };
            match output {
                OutputFormat::Json => print_json(&reports)?,
                OutputFormat::Table => {
                    for report in reports {
                        println!(
                            "✓ {}: {} from server, {} local only, {} total",
                            report.table, report.server_records, report.local_only, report.total
                        );
                    }
                }
            }
        }

        Commands::Queue => {
            let status = engine.sync_queue_status();
            match output {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => {
                    let rows = status
                        .operations
                        .iter()
                        .map(|op| -> Result<Record> { Ok(into_record(serde_json::to_value(op)?)?) })
                        .collect::<Result<Vec<_>>>()?;
                    println!("{}", table::format_records_table(&rows));
                    println!();
                    println!("Pending: {}, Failed: {}", status.pending, status.failed);
                }
            }
        }

        Commands::RetryFailed => {
            let count = engine.retry_failed()?;
            println!("✓ Re-queued {} operations", count);
        }
    }

    Ok(())
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let store = FileStore::open(&cli.data_dir)
        .with_context(|| format!("Failed to open data directory {}", cli.data_dir.display()))?;

    let mut remote = HttpRemote::new(&cli.remote_url, &cli.api_key)?;
    if let Some(token) = &cli.access_token {
        remote = remote.with_access_token(token);
    }

    let config = EngineConfig::default();
    remote = remote.with_probe_timeout(config.probe_timeout);

    let store: Arc<dyn LocalStore> = Arc::new(store);
    let remote: Arc<dyn RemoteBackend> = Arc::new(remote);
    let engine = Engine::builder()
        .with_store(store)
        .with_remote(remote)
        .with_config(config)
        .build()?;
    Ok(engine)
}

fn parse_record(data: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(data).context("Invalid JSON")?;
    Ok(into_record(value)?)
}

fn parse_filters(eq: &[String], in_set: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();
    for raw in eq {
        let (field, value) = split_filter(raw)?;
        filters = filters.eq(field, value);
    }
    for raw in in_set {
        let (field, values) = split_filter(raw)?;
        filters = filters.in_set(field, values.split(',').map(str::to_string));
    }
    Ok(filters)
}

fn split_filter(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .filter(|(field, _)| !field.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid filter '{}', expected FIELD=VALUE", raw))
}

fn print_record<T: Serialize>(output: OutputFormat, record: &Record, full: &T) -> Result<()> {
    match output {
        OutputFormat::Json => print_json(full),
        OutputFormat::Table => {
            println!("{}", table::format_records_table(std::slice::from_ref(record)));
            Ok(())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
