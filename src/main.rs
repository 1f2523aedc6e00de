//! # ragspace CLI
//!
//! Drives a [`WorkspaceManager`] from the command line: ingest files into a
//! workspace, inspect document status, search chunks, and delete documents.
//!
//! ```bash
//! ragspace --config ./config/ragspace.toml ingest --workspace team-a ./docs
//! ragspace status --workspace team-a --status failed
//! ragspace search --workspace team-a "deployment checklist"
//! ragspace delete --workspace team-a doc-4f1c...
//! ragspace workspaces
//! ```
//!
//! Without a SQLite backend configured every invocation starts from empty
//! in-memory storage.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use ragspace::config::{load_config, Config};
use ragspace::connector_fs::scan_paths;
use ragspace::workspace::WorkspaceId;
use ragspace::WorkspaceManager;
use ragspace_core::models::DocStatus;

#[derive(Parser)]
#[command(
    name = "ragspace",
    about = "Workspace-isolated knowledge-base engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used when the file
    /// does not exist.
    #[arg(long, global = true, default_value = "./config/ragspace.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files or directories into a workspace and process them.
    Ingest {
        /// Target workspace. Defaults to `[workspace].default`.
        #[arg(long)]
        workspace: Option<String>,

        /// Chunk and embed only; skip entity extraction and graph merge.
        #[arg(long)]
        no_graph: bool,

        /// Glob applied under directory arguments (repeatable).
        #[arg(long = "include")]
        include: Vec<String>,

        /// Files or directories to ingest.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show document status records.
    Status {
        #[arg(long)]
        workspace: Option<String>,

        /// Only records in this state (pending, processing, processed, failed).
        #[arg(long)]
        status: Option<DocStatus>,

        /// Only records from this enqueue call.
        #[arg(long)]
        track_id: Option<String>,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a document and everything derived from it.
    Delete {
        #[arg(long)]
        workspace: Option<String>,

        doc_id: String,
    },

    /// Vector search over chunks.
    Search {
        #[arg(long)]
        workspace: Option<String>,

        query: String,

        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },

    /// List workspaces that have data under the working directory.
    Workspaces,
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ragspace=info"));

    match format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = read_config(&cli.config)?;

    if let Commands::Workspaces = cli.command {
        for name in stored_workspaces(&config)? {
            println!("{}", name);
        }
        return Ok(());
    }

    let manager = WorkspaceManager::new(config)?;
    let result = run(&manager, cli.command).await;
    let closed = manager.shutdown_all().await;
    tracing::debug!(closed, "workspaces shut down");
    result
}

async fn run(manager: &WorkspaceManager, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ingest {
            workspace,
            no_graph,
            include,
            paths,
        } => {
            let files = scan_paths(&paths, &include)?;
            if files.is_empty() {
                println!("No files matched.");
                return Ok(());
            }

            let engine = manager.get_or_create(workspace.as_deref()).await?;
            let contents: Vec<String> = files.iter().map(|f| f.content.clone()).collect();
            let labels: Vec<String> = files.iter().map(|f| f.label.clone()).collect();
            let enqueued = engine
                .enqueue_batch(&contents, Some(&[!no_graph][..]), Some(labels.as_slice()))
                .await?;
            let report = engine.process_pending().await?;

            println!(
                "workspace {}: enqueued {} document(s) under {}",
                engine.workspace(),
                enqueued.document_ids.len(),
                enqueued.track_id
            );
            println!("  processed: {}", report.processed);
            println!("  failed:    {}", report.failed);
            for (id, msg) in &report.failures {
                println!("  {} -> {}", id, msg);
            }
        }

        Commands::Status {
            workspace,
            status,
            track_id,
            json,
        } => {
            let engine = manager.get_or_create(workspace.as_deref()).await?;
            let mut records = match &track_id {
                Some(track) => engine.statuses_by_track_id(track).await?,
                None => engine.statuses(status).await?,
            };
            if let (Some(_), Some(filter)) = (&track_id, status) {
                records.retain(|r| r.status == filter);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }

            let counts = engine.status_counts().await?;
            let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{}={}", s, n)).collect();
            println!("workspace {}: {}", engine.workspace(), summary.join(" "));
            for record in records {
                println!(
                    "{}  {:<10}  chunks={:<4}  graph={:<5}  {}",
                    record.id,
                    record.status.as_str(),
                    record.chunks_count,
                    record.enable_graph,
                    record.file_path
                );
                if let Some(msg) = record.error_msg {
                    println!("    error: {}", msg);
                }
            }
        }

        Commands::Delete { workspace, doc_id } => {
            let engine = manager.get_or_create(workspace.as_deref()).await?;
            if engine.delete_document(&doc_id).await? {
                println!("Deleted {}", doc_id);
            } else {
                println!("No document {} in workspace {}", doc_id, engine.workspace());
            }
        }

        Commands::Search {
            workspace,
            query,
            top_k,
        } => {
            let engine = manager.get_or_create(workspace.as_deref()).await?;
            let hits = engine.search_chunks(&query, top_k).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                let snippet: String = hit.content.chars().take(160).collect();
                println!(
                    "{}. [{:.3}] {} ({})",
                    i + 1,
                    hit.score,
                    hit.id,
                    hit.document_id.as_deref().unwrap_or("-")
                );
                println!("   {}", snippet.replace('\n', " "));
            }
        }

        Commands::Workspaces => {}
    }

    Ok(())
}

fn stored_workspaces(config: &Config) -> anyhow::Result<Vec<String>> {
    let root = &config.storage.working_dir;
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read working dir: {}", root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if WorkspaceId::parse(&name).is_ok() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
