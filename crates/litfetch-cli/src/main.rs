//! `litfetch` — acquire full-text PDFs for documents in a JSON catalog.

mod catalog;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueHint};
use litfetch_acquire::{
    AcquisitionOrchestrator, AcquisitionReport, AcquisitionRequest, CatalogGateway, DocumentMeta,
    ProgressReporter,
};
use litfetch_config::{AcquisitionMode, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::JsonFileCatalog;

#[derive(Parser, Debug)]
#[command(name = "litfetch", author, version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $LITFETCH_CONFIG or ./litfetch.toml)
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Catalog file (defaults to storage.catalog_path)
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a document to the catalog
    Add {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        doi: Option<String>,
        #[arg(long)]
        pmid: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        /// First author, "Surname, Given" or "Given Surname"
        #[arg(long)]
        author: Option<String>,
        /// A URL where the full text is known to be
        #[arg(long)]
        url: Option<String>,
    },

    /// List catalog documents
    List,

    /// Find, download and verify the full text of a document
    Acquire {
        doc_id: i64,
        /// Download again even if a PDF is already recorded
        #[arg(short, long)]
        force: bool,
        /// No reviewer present: honour delete_on_mismatch
        #[arg(long)]
        unattended: bool,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Review downloads that failed verification
    Review {
        #[command(subcommand)]
        action: ReviewCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ReviewCommand {
    /// List files awaiting review
    List,

    /// File a quarantined download as the document's PDF anyway
    Accept {
        doc_id: i64,
        /// Path of the quarantined file, relative to the library or absolute
        path: String,
    },

    /// Delete a quarantined download
    Discard {
        doc_id: i64,
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("litfetch=debug,info")),
        )
        .init();

    let args = CliArgs::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load_or_default(),
    }
    .context("Could not load configuration")?;

    let catalog_path = args.catalog.clone().unwrap_or_else(|| config.storage.catalog_path.clone());
    let catalog = Arc::new(JsonFileCatalog::open(&catalog_path)?);
    info!(catalog = %catalog.path().display(), library = %config.storage.base_dir.display(), "litfetch starting");

    match args.command {
        Command::Add { title, doi, pmid, year, author, url } => {
            let meta = DocumentMeta {
                title,
                doi,
                pmid,
                year,
                first_author: author,
                known_url: url,
                existing_pdf_path: None,
            };
            let doc_id = catalog.add(meta).await?;
            println!("{doc_id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            for (doc_id, entry) in catalog.list().await {
                let meta = &entry.meta;
                println!(
                    "{doc_id:>5}  {:<6} {:<30} {}",
                    meta.year.map(|y| y.to_string()).unwrap_or_default(),
                    meta.doi.as_deref().unwrap_or("-"),
                    meta.title.as_deref().unwrap_or("(untitled)"),
                );
                if let Some(path) = &meta.existing_pdf_path {
                    println!("       pdf: {path}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Acquire { doc_id, force, unattended, json } => {
            let orchestrator = AcquisitionOrchestrator::from_config(&config, catalog.clone())?;
            acquire(&orchestrator, catalog.as_ref(), doc_id, force, unattended, json).await
        }
        Command::Review { action } => {
            let orchestrator = AcquisitionOrchestrator::from_config(&config, catalog.clone())?;
            review(&orchestrator, action).await
        }
    }
}

async fn acquire(
    orchestrator: &AcquisitionOrchestrator,
    catalog: &JsonFileCatalog,
    doc_id: i64,
    force: bool,
    unattended: bool,
    json: bool,
) -> Result<ExitCode> {
    let meta = catalog
        .get_document(doc_id)
        .await?
        .with_context(|| format!("Document {doc_id} is not in the catalog"))?;
    let mut request = AcquisitionRequest::new(meta.identifiers(doc_id));
    request.force = force;
    if unattended {
        request = request.with_mode(AcquisitionMode::Unattended);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling acquisition");
            on_interrupt.cancel();
        }
    });

    let progress = ProgressReporter::from_callback(|event| {
        eprintln!("[{:<10}] {}", event.stage.as_str(), event.status);
    });
    let result = orchestrator.acquire(request, &progress, &cancel).await;
    progress.flush().await;
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Acquisition failed");
            eprintln!("{}", e.user_message());
            return Ok(ExitCode::from(2));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_report(report: &AcquisitionReport) {
    println!("{}", report.user_message());
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    if !report.is_success() && !report.attempts.is_empty() {
        println!("  tried: {}", report.attempts.summary());
    }
    for failure in &report.fetch_failures {
        println!("  {}: {} ({})", failure.source.display_name(), failure.error, failure.location);
    }
}

async fn review(orchestrator: &AcquisitionOrchestrator, action: ReviewCommand) -> Result<ExitCode> {
    match action {
        ReviewCommand::List => {
            for file in orchestrator.quarantined_files().await? {
                println!("{file}");
            }
        }
        ReviewCommand::Accept { doc_id, path } => {
            let record = orchestrator.quarantined_record(doc_id, &path).await?;
            let outcome = orchestrator.accept_quarantined(&record).await?;
            match outcome.record() {
                Some(stored) => println!("Filed as {}", stored.relative_path),
                None => println!("Not filed: {}", outcome.as_str()),
            }
        }
        ReviewCommand::Discard { doc_id, path } => {
            let record = orchestrator.quarantined_record(doc_id, &path).await?;
            orchestrator.discard_quarantined(&record).await?;
            println!("Discarded {}", record.relative_path);
        }
    }
    Ok(ExitCode::SUCCESS)
}
