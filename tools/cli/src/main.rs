//! BizSync CLI - drive the sync engine against a live backend.
//!
//! Reads and writes go through the same engine an application embeds, with
//! the local cache and retry queue kept under the data directory.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bizsync_app::{ContextOptions, ResourceHandle, SyncContext};
use bizsync_common::BusinessType;
use bizsync_sync::EngineConfig;
use bizsync_transport::FetchOptions;

#[derive(Parser)]
#[command(name = "bizsync")]
#[command(about = "BizSync - offline-first business data sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base URL of the REST API.
    #[arg(long, env = "BIZSYNC_API_BASE", default_value = "http://localhost:3000", global = true)]
    api_base: String,

    /// Push channel URL (no push connection when omitted).
    #[arg(long, env = "BIZSYNC_SOCKET_URL", global = true)]
    socket_url: Option<String>,

    /// Bearer token for authenticated resources.
    #[arg(long, env = "BIZSYNC_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Local cache and queue directory.
    #[arg(long, env = "BIZSYNC_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Business vertical whose resources are registered.
    #[arg(short, long, env = "BIZSYNC_BUSINESS_TYPE", global = true)]
    business_type: Option<String>,

    /// Treat the network as unavailable; writes are queued.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered resources.
    Resources,

    /// Read a resource, cache first.
    Fetch {
        resource: String,

        /// Skip the cache.
        #[arg(short, long)]
        force: bool,

        /// Extra query parameter as key=value (repeatable).
        #[arg(short, long, value_parser = parse_key_value)]
        query: Vec<(String, String)>,

        /// Start of the date range (YYYY-MM-DD).
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,

        /// End of the date range (YYYY-MM-DD).
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,

        /// Page number for paginated resources.
        #[arg(long)]
        page: Option<u32>,
    },

    /// Create a record.
    Create {
        resource: String,

        /// Record as a JSON object.
        #[arg(short, long)]
        json: String,
    },

    /// Update a record (the JSON must carry its id).
    Update {
        resource: String,

        #[arg(short, long)]
        json: String,
    },

    /// Delete a record (the JSON must carry its id).
    Delete {
        resource: String,

        #[arg(short, long)]
        json: String,
    },

    /// Show queued writes.
    Queue,

    /// Deliver queued writes now.
    Drain,

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(Clone, Copy)]
enum WriteKind {
    Create,
    Update,
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "bizsync", &mut std::io::stdout());
        return Ok(());
    }

    let context = open_context(&cli).await?;
    let result = match &cli.command {
        Commands::Resources => cmd_resources(&context),
        Commands::Fetch {
            resource,
            force,
            query,
            start,
            end,
            page,
        } => {
            let mut options = FetchOptions {
                force: *force,
                ..Default::default()
            };
            for (key, value) in query {
                options = options.with_query(key, value);
            }
            if let (Some(start), Some(end)) = (start, end) {
                options = options.with_date_range(*start, *end);
            }
            if let Some(page) = page {
                options = options.with_page(*page, bizsync_transport::rest::DEFAULT_PAGE_SIZE);
            }
            cmd_fetch(&context, resource, &options).await
        }
        Commands::Create { resource, json } => {
            cmd_write(&context, resource, json, WriteKind::Create).await
        }
        Commands::Update { resource, json } => {
            cmd_write(&context, resource, json, WriteKind::Update).await
        }
        Commands::Delete { resource, json } => {
            cmd_write(&context, resource, json, WriteKind::Delete).await
        }
        Commands::Queue => cmd_queue(&context),
        Commands::Drain => cmd_drain(&context).await,
        Commands::Completions { .. } => Ok(()),
    };

    context.shutdown().await;
    result
}

/// Build and initialize the context from global flags.
async fn open_context(cli: &Cli) -> Result<SyncContext> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .map(|dir| dir.join("bizsync"))
            .context("No platform data directory; pass --data-dir")?,
    };

    let engine = EngineConfig {
        api_base_url: cli.api_base.clone(),
        socket_url: cli.socket_url.clone(),
        ..Default::default()
    };
    let context = SyncContext::connect(ContextOptions {
        engine,
        data_dir,
        token: cli.token.clone(),
    })
    .context("Failed to set up sync context")?;

    if cli.offline {
        context.set_online(false);
    }
    // Set before initialize so queued vertical writes resolve their endpoints.
    if let Some(business_type) = &cli.business_type {
        let business_type =
            BusinessType::new(business_type.as_str()).context("Invalid business type")?;
        context.set_business_type(business_type);
    }
    context
        .initialize()
        .await
        .context("Failed to initialize sync engine")?;
    Ok(context)
}

/// List registered resources.
fn cmd_resources(context: &SyncContext) -> Result<()> {
    let resources = context.engine().registry().get_all_resources();
    match context.engine().business_type() {
        Some(bt) => println!("Resources ({}):", bt),
        None => println!("Resources (no business type set):"),
    }

    for config in resources {
        let mut flags = Vec::new();
        if config.requires_auth {
            flags.push("auth");
        }
        if config.enable_offline {
            flags.push("offline");
        }
        if !config.push_event_names.is_empty() {
            flags.push("push");
        }
        if config.requires_date_range {
            flags.push("date-range");
        }
        if config.supports_pagination {
            flags.push("paged");
        }
        println!(
            "  {:<14} {:<7} {:<8} [{}]",
            config.name,
            format!("{:?}", config.priority).to_lowercase(),
            config.endpoints.get.as_deref().unwrap_or("-"),
            flags.join(", ")
        );
    }
    Ok(())
}

/// Read a resource and print it as JSON.
async fn cmd_fetch(context: &SyncContext, resource: &str, options: &FetchOptions) -> Result<()> {
    let outcome = context
        .engine()
        .get_data_with_fallback(resource, options)
        .await
        .with_context(|| format!("Failed to read {}", resource))?;

    if let Some(stale) = &outcome.stale {
        warn!(
            "Cached {} is stale ({} s old)",
            resource,
            stale.age_ms / 1000
        );
    }
    info!("{} served from {:?}", resource, outcome.source);
    println!("{}", serde_json::to_string_pretty(&outcome.data)?);
    Ok(())
}

/// Run one write through the resource handle.
async fn cmd_write(context: &SyncContext, resource: &str, json: &str, kind: WriteKind) -> Result<()> {
    let payload: Value = serde_json::from_str(json).context("--json is not valid JSON")?;
    anyhow::ensure!(payload.is_object(), "--json must be a JSON object");

    let handle = ResourceHandle::new(context.engine().clone(), resource, context.strategy());
    let stamped = match kind {
        WriteKind::Create => handle.create(payload).await,
        WriteKind::Update => handle.update(payload).await,
        WriteKind::Delete => handle.remove(payload).await,
    }
    .with_context(|| format!("Write to {} failed", resource))?;
    handle.teardown();

    let queued = context.engine().queued_items().len();
    if queued > 0 {
        println!("Write accepted; {} write(s) waiting in the queue.", queued);
    } else {
        println!("Write delivered.");
    }
    println!("{}", serde_json::to_string_pretty(&stamped)?);
    Ok(())
}

/// Show queued writes.
fn cmd_queue(context: &SyncContext) -> Result<()> {
    let items = context.engine().queued_items();
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} queued write(s):", items.len());
    for item in items {
        println!(
            "  {} {:<7} {:<14} attempts {}/{}{}",
            item.id,
            item.operation,
            item.resource,
            item.retry_count,
            item.max_retries,
            item.last_error
                .map(|e| format!(" (last error: {})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Deliver queued writes now.
async fn cmd_drain(context: &SyncContext) -> Result<()> {
    let report = context
        .engine()
        .process_sync_queue()
        .await
        .context("Queue drain failed")?;

    if report.skipped {
        println!("Drain skipped (offline or already running).");
        return Ok(());
    }
    println!("Queue drained:");
    println!("  Delivered: {}", report.processed);
    println!("  Retrying:  {}", report.retried);
    println!("  Dropped:   {}", report.failed);
    println!("  Deferred:  {}", report.deferred);
    println!("  Remaining: {}", report.remaining);
    Ok(())
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}
