//! plur-watch - Mention polling daemon
//!
//! Polls every active connection for new mentions through the resilience
//! layer in libplurwatch: classified retries, per-platform circuit breakers
//! and a rate budget shared by every plur-watch process on the machine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libplurwatch::credentials::EnvCredentialProvider;
use libplurwatch::logging::LoggingConfig;
use libplurwatch::types::{AuditEntry, Connection, PollOutcome, PollResult, PollSummary};
use libplurwatch::{
    Config, Database, DistributedRateLimiter, PlurwatchError, PollCursorStore,
    PollingOrchestrator, RetryExecutor,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "plur-watch")]
#[command(version)]
#[command(about = "Poll social platforms for mentions, resiliently")]
#[command(long_about = "\
plur-watch - Mention polling daemon

DESCRIPTION:
    plur-watch polls each active connection for new mentions and stores
    them in the local database. Failed fetches are classified and retried
    with backoff; a platform that keeps failing is paused by a circuit
    breaker; every process sharing the database shares one rate budget
    per tenant.

    Mentions are fetched by an external command per platform, configured
    in the config file. The connection's token is passed to it in the
    PLURWATCH_TOKEN environment variable and read by plur-watch from
    PLURWATCH_TOKEN_<CONNECTION_ID>.

USAGE:
    # Register an account to poll
    plur-watch connections add --platform mastodon --account alice@example.social

    # Poll everything once
    plur-watch run --once

    # Run as a daemon
    plur-watch run --poll-interval 300

    # Poll one connection now
    plur-watch poll <CONNECTION_ID>

CONFIGURATION:
    Configuration file: ~/.config/plurwatch/config.toml (or $PLURWATCH_CONFIG)

    [database]
    path = \"~/.local/share/plurwatch/plurwatch.db\"

    [polling]
    interval_secs = 300
    min_interval_secs = 240

    [rate_limit]
    window_seconds = 900
    max_requests = 75

    [platforms.mastodon]
    fetch_command = \"mastodon-mentions --account {account} --since {since_id}\"

EXIT CODES:
    0 - Success
    1 - Runtime error (including a failed poll)
    2 - Authentication error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll all active connections, once or on an interval
    Run {
        /// Poll once and exit
        #[arg(long)]
        once: bool,

        /// Poll connections even if they were checked recently
        #[arg(long)]
        force: bool,

        /// Seconds between sweeps (overrides config)
        #[arg(long, value_name = "SECONDS")]
        poll_interval: Option<u64>,

        /// Output format for --once: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Poll one connection now
    Poll {
        connection_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage polled connections
    Connections {
        #[command(subcommand)]
        action: ConnectionCommand,
    },

    /// Show recent poll audit entries
    Audit {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show cursors and remaining rate budget
    Status {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConnectionCommand {
    /// List connections
    List {
        /// Include disabled connections
        #[arg(long)]
        all: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Register an account to poll
    Add {
        #[arg(long)]
        platform: String,

        #[arg(long)]
        account: String,

        /// Rate budget key shared with other connections (default: the platform)
        #[arg(long)]
        tenant: Option<String>,

        /// Connection id (default: a new UUID)
        #[arg(long)]
        id: Option<String>,
    },

    /// Stop polling a connection
    Disable { connection_id: String },

    /// Resume polling a connection
    Enable { connection_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

fn parse_format(format: &str) -> libplurwatch::Result<Format> {
    match format {
        "text" => Ok(Format::Text),
        "json" => Ok(Format::Json),
        other => Err(PlurwatchError::InvalidInput(format!(
            "Invalid format '{}'. Valid options: text, json",
            other
        ))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env().verbose(cli.verbose).init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<PlurwatchError>()
        .map_or(1, PlurwatchError::exit_code)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load_or_default().context("Failed to load configuration")?;
    let db = Database::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.path))?;

    match cli.command {
        Commands::Run {
            once,
            force,
            poll_interval,
            format,
        } => {
            let format = parse_format(&format)?;
            let orchestrator = orchestrator(db, &config);
            if once {
                let summary = orchestrator.poll_all(force).await?;
                print_summary(&orchestrator, &summary, format)?;
                Ok(if summary.failed > 0 { 1 } else { 0 })
            } else {
                let interval = poll_interval.unwrap_or(config.polling.interval_secs).max(1);
                run_daemon(&orchestrator, interval, force).await?;
                Ok(0)
            }
        }
        Commands::Poll {
            connection_id,
            format,
        } => {
            let format = parse_format(&format)?;
            let orchestrator = orchestrator(db, &config);
            let result = orchestrator.poll_one(&connection_id).await?;
            print_result(&result, format)?;
            Ok(match result.outcome {
                PollOutcome::Failed | PollOutcome::CircuitOpen => 1,
                _ => 0,
            })
        }
        Commands::Connections { action } => {
            cmd_connections(&db, action).await?;
            Ok(0)
        }
        Commands::Audit { limit, format } => {
            let format = parse_format(&format)?;
            print_audit(&db.list_audit(limit).await?, format)?;
            Ok(0)
        }
        Commands::Status { format } => {
            let format = parse_format(&format)?;
            cmd_status(&db, &config, format).await?;
            Ok(0)
        }
    }
}

fn orchestrator(db: Database, config: &Config) -> PollingOrchestrator {
    let executor = Arc::new(RetryExecutor::from_config(config));
    PollingOrchestrator::from_config(db, config, executor, Arc::new(EnvCredentialProvider::new()))
}

/// Daemon loop: sweep, then sleep in one-second steps so shutdown is prompt
async fn run_daemon(orchestrator: &PollingOrchestrator, interval: u64, force: bool) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    info!(interval_secs = interval, "plur-watch daemon starting");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        match orchestrator.poll_all(force).await {
            Ok(_) => {
                let health = orchestrator.executor().health_status();
                if !health.is_healthy() {
                    warn!(
                        open = ?health.open_platforms(),
                        recent_errors = health.recent_errors.total,
                        "Some platforms are failing"
                    );
                }
            }
            Err(e) => error!("Poll sweep failed: {}", e),
        }

        for _ in 0..interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    info!("plur-watch daemon stopped");
    Ok(())
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, finishing current sweep...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

async fn cmd_connections(db: &Database, action: ConnectionCommand) -> Result<()> {
    match action {
        ConnectionCommand::List { all, format } => {
            let format = parse_format(&format)?;
            let connections = db.list_connections(!all).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&connections)?),
                Format::Text => {
                    for c in &connections {
                        println!(
                            "{}\t{}\t{}\t{}\t{}",
                            c.id,
                            c.platform,
                            c.account,
                            c.tenant_id,
                            if c.active { "active" } else { "disabled" }
                        );
                    }
                }
            }
        }
        ConnectionCommand::Add {
            platform,
            account,
            tenant,
            id,
        } => {
            if platform.trim().is_empty() || account.trim().is_empty() {
                return Err(PlurwatchError::InvalidInput(
                    "Platform and account must not be empty".to_string(),
                )
                .into());
            }
            let tenant = tenant.unwrap_or_else(|| platform.clone());
            let mut connection = Connection::new(&tenant, &platform, &account);
            if let Some(id) = id {
                connection = connection.with_id(&id);
            }
            db.upsert_connection(&connection).await?;
            println!("{}", connection.id);
        }
        ConnectionCommand::Disable { connection_id } => {
            set_active(db, &connection_id, false).await?;
        }
        ConnectionCommand::Enable { connection_id } => {
            set_active(db, &connection_id, true).await?;
        }
    }
    Ok(())
}

async fn set_active(db: &Database, connection_id: &str, active: bool) -> Result<()> {
    if !db.set_connection_active(connection_id, active).await? {
        return Err(
            PlurwatchError::InvalidInput(format!("Unknown connection: {}", connection_id)).into(),
        );
    }
    info!(connection_id, active, "Updated connection");
    Ok(())
}

async fn cmd_status(db: &Database, config: &Config, format: Format) -> Result<()> {
    let cursors = PollCursorStore::new(db.clone());
    let limiter = DistributedRateLimiter::new(db.clone(), config.rate_limit.to_limiter_config());

    let connections = db.list_connections(false).await?;
    let mut rows = Vec::with_capacity(connections.len());
    let mut budgets = BTreeMap::new();
    for connection in &connections {
        let cursor = cursors.load(&connection.id).await?;
        if !budgets.contains_key(&connection.tenant_id) {
            let remaining = limiter.remaining(&connection.tenant_id).await?;
            budgets.insert(connection.tenant_id.clone(), remaining);
        }
        rows.push((connection, cursor));
    }

    match format {
        Format::Json => {
            let connections: Vec<_> = rows
                .iter()
                .map(|(c, cursor)| {
                    json!({
                        "id": c.id,
                        "platform": c.platform,
                        "account": c.account,
                        "tenant_id": c.tenant_id,
                        "active": c.active,
                        "since_id": cursor.since_id,
                        "last_checked_at": cursor.last_checked_at,
                    })
                })
                .collect();
            let output = json!({
                "connections": connections,
                "rate_limit": {
                    "window_seconds": config.rate_limit.window_seconds,
                    "max_requests": config.rate_limit.max_requests,
                    "remaining": budgets,
                },
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Format::Text => {
            for (c, cursor) in &rows {
                println!(
                    "{}\t{}\t{}\tsince={}\tchecked={}",
                    c.id,
                    c.platform,
                    if c.active { "active" } else { "disabled" },
                    cursor.since_id.as_deref().unwrap_or("-"),
                    cursor
                        .last_checked_at
                        .map(format_timestamp)
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
            for (tenant, remaining) in &budgets {
                println!(
                    "tenant {}: {}/{} requests left in window",
                    tenant, remaining, config.rate_limit.max_requests
                );
            }
        }
    }
    Ok(())
}

fn print_summary(
    orchestrator: &PollingOrchestrator,
    summary: &PollSummary,
    format: Format,
) -> Result<()> {
    match format {
        Format::Json => {
            let output = json!({
                "summary": summary,
                "health": orchestrator.executor().health_status(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Format::Text => {
            for result in &summary.results {
                print_result_line(result);
            }
            println!(
                "{} connection(s): {} polled, {} skipped, {} failed, {} new mention(s)",
                summary.connections,
                summary.polled,
                summary.skipped,
                summary.failed,
                summary.new_mentions
            );
        }
    }
    Ok(())
}

fn print_result(result: &PollResult, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(result)?),
        Format::Text => print_result_line(result),
    }
    Ok(())
}

fn print_result_line(result: &PollResult) {
    match &result.error {
        Some(error) => println!(
            "{}\t{}\t{}\t{}",
            result.connection_id, result.platform, result.outcome, error
        ),
        None => println!(
            "{}\t{}\t{}\tnew={}\tduplicates={}\tsince={}",
            result.connection_id,
            result.platform,
            result.outcome,
            result.new_mentions,
            result.duplicates,
            result.since_id.as_deref().unwrap_or("-")
        ),
    }
}

fn print_audit(entries: &[AuditEntry], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        Format::Text => {
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    format_timestamp(entry.created_at),
                    entry.action,
                    entry.platform,
                    entry.connection_id.as_deref().unwrap_or("-"),
                    entry.status,
                    entry.metadata
                );
            }
        }
    }
    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
