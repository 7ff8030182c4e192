//! # Estate Harness CLI (`estate`)
//!
//! ## Usage
//!
//! ```bash
//! estate --config ./config/estate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `estate init` | Create the SQLite database and run schema migrations |
//! | `estate ingest <files..>` | Classify, extract and store documents |
//! | `estate chat --session <id> "<utterance>"` | Route one chat turn and print the merged answer |
//! | `estate nurture` | Run one nurture pass over all leads |
//! | `estate lead <id> <action>` | Record `contacted`, `engaged`, `qualified` or `closed` |
//! | `estate serve` | Start the HTTP server with the background scheduler |
//!
//! Logs go to stderr (`RUST_LOG`, default `estate_harness=info`); command
//! output goes to stdout.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use estate_harness::config::{self, Config};
use estate_harness::harness::Harness;
use estate_harness::ingest::IngestRequest;
use estate_harness::nurture::{self, LeadAction, PassOutcome};
use estate_harness::{migrate, server};
use estate_harness_core::models::DocumentFormat;

/// Estate Harness: real-estate document ingestion, multi-intent retrieval
/// and lead nurturing.
#[derive(Parser)]
#[command(name = "estate", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/estate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest documents into the relational and vector stores.
    ///
    /// Files are processed concurrently (`ingest.concurrency`); one failing
    /// file does not stop the others.
    Ingest {
        files: Vec<PathBuf>,

        /// Declared format: `auto` (from the extension), `pdf`, `csv`,
        /// `excel` or `text`.
        #[arg(long, default_value = "auto")]
        format: String,
    },

    /// Route one chat turn and print the merged response as JSON.
    Chat {
        #[arg(long)]
        session: String,

        utterance: String,
    },

    /// Run one nurture pass now.
    Nurture,

    /// Record an agent action on a lead.
    Lead {
        id: String,

        /// `contacted`, `engaged`, `qualified` or `closed`.
        action: String,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("estate_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { files, format } => return ingest_files(&cfg, files, &format).await,
        Commands::Chat { session, utterance } => {
            let harness = Harness::open(&cfg).await?;
            let response = harness.router.route(&utterance, &session).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Nurture => {
            let harness = Harness::open(&cfg).await?;
            match harness.scheduler.run_pass().await? {
                PassOutcome::Completed(report) => println!(
                    "nurture: {} leads, {} transitions, {} events, {} suppressed, {} errors",
                    report.leads_scanned,
                    report.transitions,
                    report.events_emitted,
                    report.duplicates_suppressed,
                    report.lead_errors
                ),
                PassOutcome::Skipped => println!("nurture: skipped, a pass is already running"),
            }
        }
        Commands::Lead { id, action } => {
            let Some(action) = LeadAction::parse(&action) else {
                bail!("unknown lead action '{}'", action);
            };
            let harness = Harness::open(&cfg).await?;
            let lead = nurture::apply_action(harness.stores.leads.as_ref(), &id, action, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&lead)?);
        }
        Commands::Serve => server::run_server(&cfg).await?,
    }
    Ok(ExitCode::SUCCESS)
}

fn format_for(path: &Path, declared: &str) -> Result<String> {
    if declared != "auto" {
        return Ok(declared.to_string());
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    DocumentFormat::from_extension(ext)
        .map(|f| f.as_str().to_string())
        .with_context(|| format!("cannot detect format of {}; pass --format", path.display()))
}

async fn ingest_files(cfg: &Config, files: Vec<PathBuf>, format: &str) -> Result<ExitCode> {
    if files.is_empty() {
        bail!("no files given");
    }
    let mut requests = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        requests.push(IngestRequest {
            bytes,
            format_hint: format_for(path, format)?,
        });
    }

    let harness = Harness::open(cfg).await?;
    let results = harness.pipeline.ingest_many(requests).await;

    let mut failed = 0;
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(r) => {
                println!(
                    "ingest {}: category={} records={} chunks={} warnings={}",
                    path.display(),
                    r.category.as_str(),
                    r.records_written,
                    r.chunks_written,
                    r.warnings.len()
                );
                for w in &r.warnings {
                    println!("  warning: {}", w);
                }
            }
            Err(e) => {
                failed += 1;
                println!("ingest {}: error [{}] {}", path.display(), e.code(), e);
            }
        }
    }
    Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
