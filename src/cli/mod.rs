//! CLI commands implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::CommandBackend;
use crate::config::{BackendSpec, OrchestratorConfig, ResourceClass};
use crate::job::{JobEvent, JobStatus};
use crate::model::PageImage;
use crate::orchestrator::{DocumentRequest, Orchestrator};
use crate::registry::BackendRegistry;
use crate::router::RoutingMode;

#[derive(Parser)]
#[command(name = "textmill")]
#[command(about = "Complexity-driven OCR orchestration for document ingestion")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to ./textmill.toml when present)
    #[arg(long, global = true, env = "TEXTMILL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run OCR over a directory of page images (one document)
    Process {
        /// Directory of page images, or a single image file
        input: PathBuf,
        /// Routing mode: auto or hybrid
        #[arg(short, long, default_value = "auto")]
        mode: String,
        /// Pin a specific backend (overrides --mode)
        #[arg(short, long)]
        backend: Option<String>,
        /// Document-type hint consulted by auto routing
        #[arg(long)]
        doc_type: Option<String>,
        /// Source scan DPI
        #[arg(long, default_value = "300")]
        dpi: u32,
        /// Write results as JSON to this path instead of a text summary
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// List configured backends, their availability and health
    Backends,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = OrchestratorConfig::discover(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Process {
            input,
            mode,
            backend,
            doc_type,
            dpi,
            json,
        } => {
            let mode = match backend {
                Some(id) => RoutingMode::Explicit(id),
                None => match mode.as_str() {
                    "auto" => RoutingMode::Auto,
                    "hybrid" => RoutingMode::Hybrid,
                    other => anyhow::bail!("unknown mode: {} (expected auto or hybrid)", other),
                },
            };
            process_command(config, input, mode, doc_type, dpi, json).await
        }
        Commands::Backends => backends_command(config),
    }
}

/// Build the registry from configuration. Backends with no command default
/// to a tesseract invocation; the set is fixed for the process lifetime.
fn build_registry(config: &OrchestratorConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new(config.health.clone());
    let specs: Vec<BackendSpec> = if config.backends.is_empty() {
        vec![BackendSpec {
            id: "tesseract".into(),
            resource_class: ResourceClass::Cpu,
            vram_required_mb: 0,
            max_batch_size: 1,
            base_priority: 50,
            timeout_secs: None,
            command: None,
        }]
    } else {
        config.backends.clone()
    };
    for spec in specs {
        let program = spec.command.clone().unwrap_or_else(|| "tesseract".into());
        registry.register(spec, Arc::new(CommandBackend::new(program)));
    }
    registry
}

async fn process_command(
    config: OrchestratorConfig,
    input: PathBuf,
    mode: RoutingMode,
    doc_type: Option<String>,
    dpi: u32,
    json: Option<PathBuf>,
) -> anyhow::Result<()> {
    let pages = load_pages(&input, dpi)?;
    anyhow::ensure!(!pages.is_empty(), "no page images found in {}", input.display());

    let document_id = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());

    println!(
        "  {} Processing {} ({} pages)",
        style("→").cyan(),
        document_id,
        pages.len()
    );

    let registry = build_registry(&config);
    let orchestrator = Orchestrator::new(config, registry);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let total = pages.len() as u64;
    let progress_task = tokio::spawn(async move {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("  [{bar:30}] {pos}/{len} pages {msg}")
                .expect("valid template")
                .progress_chars("=> "),
        );
        while let Some(event) = event_rx.recv().await {
            match event {
                JobEvent::PageCompleted { .. } | JobEvent::PageFailed { .. } => bar.inc(1),
                JobEvent::JobFinalized { .. } => bar.finish_and_clear(),
                _ => {}
            }
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let job = orchestrator
        .process_document(
            DocumentRequest {
                document_id,
                pages,
                mode,
                doc_type_hint: doc_type,
            },
            cancel,
            event_tx,
        )
        .await;
    let _ = progress_task.await;

    if let Some(path) = json {
        let report = job_report(&job);
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("  {} Results written to {}", style("✓").green(), path.display());
    } else {
        print_summary(&job);
    }

    match job.status {
        JobStatus::Completed => Ok(()),
        JobStatus::PartiallyFailed => {
            anyhow::bail!("{} pages failed", job.failed_pages().count())
        }
        status => anyhow::bail!("document processing ended as {:?}", status),
    }
}

fn backends_command(config: OrchestratorConfig) -> anyhow::Result<()> {
    let registry = build_registry(&config);
    anyhow::ensure!(!registry.is_empty(), "no backends configured");

    for backend in registry.all() {
        let health = registry.health(&backend.spec.id);
        let disabled = health.as_ref().map(|h| h.is_disabled).unwrap_or(false);
        let mark = if backend.engine.is_available() && !disabled {
            style("✓").green()
        } else {
            style("✗").red()
        };
        let last_failure = health
            .as_ref()
            .and_then(|h| h.last_failure_at)
            .map(|at| format!(", last failure {}s ago", at.elapsed().as_secs()))
            .unwrap_or_default();
        println!(
            "  {} {} [{}] priority={} vram={}MB{} - {}",
            mark,
            backend.spec.id,
            backend.spec.resource_class,
            backend.spec.base_priority,
            backend.spec.vram_required_mb,
            last_failure,
            backend.engine.availability_hint(),
        );
    }
    Ok(())
}

/// Collect page images from a file or directory, ordered by file name.
fn load_pages(input: &Path, dpi: u32) -> anyhow::Result<Vec<PageImage>> {
    let mut paths: Vec<PathBuf> = if input.is_dir() {
        std::fs::read_dir(input)
            .with_context(|| format!("failed to read {}", input.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp")
                )
            })
            .collect()
    } else {
        vec![input.to_path_buf()]
    };
    paths.sort();

    let mut pages = Vec::with_capacity(paths.len());
    for (n, path) in paths.iter().enumerate() {
        let img = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        pages.push(PageImage::from_dynamic(n as u32, &img, dpi));
    }
    Ok(pages)
}

fn print_summary(job: &crate::job::ProcessingJob) {
    for page in &job.pages {
        match page.text() {
            Some(_) => {
                let review = if page.needs_review {
                    style(" (needs review)").yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "  {} page {}: confidence {:.2}{}",
                    style("✓").green(),
                    page.page_number + 1,
                    page.confidence().unwrap_or(0.0),
                    review
                );
            }
            None => {
                println!(
                    "  {} page {}: failed",
                    style("✗").red(),
                    page.page_number + 1
                );
            }
        }
    }
    println!(
        "  {} {:?} ({}/{} pages)",
        style("•").cyan(),
        job.status,
        job.pages.iter().filter(|p| p.outcome.is_success()).count(),
        job.total_pages
    );
}

/// JSON-friendly view of a finalized job.
fn job_report(job: &crate::job::ProcessingJob) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id.to_string(),
        "document_id": job.document_id,
        "status": job.status,
        "progress_percent": job.progress_percent,
        "pages": job.pages.iter().map(|p| {
            serde_json::json!({
                "page_number": p.page_number,
                "success": p.outcome.is_success(),
                "text": p.text(),
                "confidence": p.confidence(),
                "needs_review": p.needs_review,
                "attempts": p.attempts,
            })
        }).collect::<Vec<_>>(),
    })
}
