use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use atelier_contracts::artifacts::ArtifactSource;
use atelier_contracts::events::EventWriter;
use atelier_contracts::summary::{write_summary, JobSummary};
use atelier_contracts::telemetry::humanize_duration;
use atelier_contracts::variants::VariantRegistry;
use atelier_engine::{
    EngineError, GenerationSession, HttpBackend, JobBackend, PollConfig, SubmitRequest,
    ThreadSleeper,
};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Atelier generation job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a generation and follow it to completion.
    Generate(GenerateArgs),
    /// One-shot status check for an existing job.
    Status(StatusArgs),
    /// Fetch the artifact listing for a job (manual refresh).
    Artifacts(ArtifactsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    variant: String,
    /// Destination folder in the asset vault. Required by the backend.
    #[arg(long)]
    folder: String,
    #[arg(long)]
    prompt: Option<String>,
    /// Source image reference for image-conditioned variants.
    #[arg(long)]
    image: Option<String>,
    /// Workflow graph JSON file. Sent opaque to the backend.
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Extra parameter as key=value; value is parsed as JSON when possible.
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long)]
    user: Option<String>,
    /// Directory for summary.json, events.jsonl and downloads.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Download resolved artifacts into --out.
    #[arg(long)]
    download: bool,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,
    #[arg(long, default_value_t = 150)]
    max_attempts: u32,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long)]
    job_id: String,
    #[arg(long)]
    api_base: Option<String>,
}

#[derive(Debug, Parser)]
struct ArtifactsArgs {
    #[arg(long)]
    job_id: String,
    #[arg(long)]
    api_base: Option<String>,
}

fn main() {
    init_logging();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Status(args) => run_status(args),
        Command::Artifacts(args) => run_artifacts(args),
    }
}

fn backend_for(api_base: Option<&str>) -> HttpBackend {
    match api_base {
        Some(base) => HttpBackend::with_base(base),
        None => HttpBackend::new(),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let registry = VariantRegistry::builtin();
    let variant = registry.get(&args.variant).with_context(|| {
        format!(
            "unknown variant '{}'; known: {}",
            args.variant,
            registry.list().join(", ")
        )
    })?;

    let workflow = match &args.workflow {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))?
        }
        None => json!({}),
    };

    let request = SubmitRequest {
        prompt: args.prompt.clone(),
        source_image: args.image.clone(),
        folder: Some(args.folder.clone()),
        workflow,
        params: parse_params(&args.params)?,
        user_id: args.user.clone(),
    };

    let backend = backend_for(args.api_base.as_deref());
    let mut session = GenerationSession::with_config(
        backend,
        PollConfig {
            interval: Duration::from_millis(args.interval_ms),
            max_attempts: args.max_attempts,
        },
    );

    let events_path = args
        .events
        .clone()
        .or_else(|| args.out.as_ref().map(|out| out.join("events.jsonl")));
    if let Some(path) = events_path {
        // the writer binds to the job at submission, so the trail and
        // summary.json share the same request_ref
        session.set_event_writer(EventWriter::new(path));
    }

    session.submit(variant, &request).map_err(surface)?;
    let job = session.job().expect("submit stored a job").clone();
    println!("job {} submitted ({})", job.id, variant.name);

    let outcome = session.run_to_completion(&ThreadSleeper, |job, attempts, clock| {
        let clock = clock.unwrap_or_else(|| "--:--".to_string());
        let progress = job
            .progress
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "-".to_string());
        let message = job.message.as_deref().unwrap_or("");
        print!("\r[{clock}] {} {progress} {message}    ", job.status);
        let _ = io::stdout().flush();
        tracing::debug!(attempts, "status checked");
    });
    println!();

    let results = match outcome {
        Ok(results) => results,
        Err(err @ EngineError::ProcessingTimeout) => {
            eprintln!("{err}: the job may still be running; try `atelier status --job-id {}` later", job.id);
            return Ok(2);
        }
        Err(err) => return Err(anyhow::Error::new(err)),
    };

    let duration = session
        .final_duration()
        .map(|d| d.display.clone())
        .unwrap_or_else(|| humanize_duration(0));
    if results.is_pending() {
        println!(
            "completed in {duration}, but no artifacts are queryable yet; \
             run `atelier artifacts --job-id {}` to refresh",
            job.id
        );
    } else {
        println!("completed in {duration}:");
        for url in &results.urls {
            println!("  {url}");
        }
    }

    if let Some(out) = &args.out {
        fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
        if args.download && !results.urls.is_empty() {
            download_results(&backend_for(args.api_base.as_deref()), &results.urls, out)?;
        }
        let summary = JobSummary {
            job_id: job.id.clone(),
            request_ref: job.request_ref.clone(),
            variant: variant.name.clone(),
            status: session
                .job()
                .map(|job| job.status.to_string())
                .unwrap_or_default(),
            submitted_at: job
                .created_at
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            duration,
            artifact_count: results.urls.len() as u64,
            result_urls: results.urls.clone(),
        };
        let mut extra = Map::new();
        extra.insert("folder".to_string(), Value::String(args.folder.clone()));
        write_summary(&out.join("summary.json"), &summary, Some(&extra))?;
    }

    Ok(0)
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let backend = backend_for(args.api_base.as_deref());
    let report = backend.job_status(&args.job_id).map_err(surface)?;
    let status = report
        .normalized_status()
        .map(|status| status.to_string())
        .unwrap_or_else(|| format!("UNRECOGNIZED ({})", report.status));
    println!("job {}: {status}", args.job_id);
    if let Some(progress) = report.progress {
        println!("  progress: {progress}%");
    }
    if let Some(message) = &report.message {
        println!("  message: {message}");
    }
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
    for url in report.result_urls.iter().flatten() {
        println!("  result: {url}");
    }
    Ok(0)
}

fn run_artifacts(args: ArtifactsArgs) -> Result<i32> {
    let backend = backend_for(args.api_base.as_deref());
    let listing = backend.job_artifacts(&args.job_id).map_err(surface)?;
    if listing.images.is_empty() {
        println!("no artifacts recorded for job {} yet", args.job_id);
        return Ok(0);
    }
    for record in &listing.images {
        let name = record.filename.as_deref().unwrap_or(record.id.as_str());
        println!("{name}");
        for source in record.sources() {
            match source {
                ArtifactSource::ProxiedUrl(url) => println!("  proxied: {url}"),
                ArtifactSource::CloudUrl(url) => println!("  cloud:   {url}"),
            }
        }
    }
    Ok(0)
}

fn download_results(backend: &HttpBackend, urls: &[String], out: &Path) -> Result<()> {
    for (index, url) in urls.iter().enumerate() {
        let bytes = backend.fetch_bytes(url).map_err(surface)?;
        let path = out.join(format!("artifact-{index:02}.{}", extension_for(url)));
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        println!("  saved {}", path.display());
    }
    Ok(())
}

fn extension_for(url: &str) -> &str {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    match trimmed.rsplit('.').next() {
        Some(ext) if ext.len() <= 4 && !ext.contains('/') => ext,
        _ => "bin",
    }
}

fn parse_params(raw: &[String]) -> Result<IndexMap<String, Value>> {
    let mut params = IndexMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("expected key=value, got '{entry}'"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty parameter name in '{entry}'");
        }
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| Value::String(value.trim().to_string()));
        params.insert(key.to_string(), parsed);
    }
    Ok(params)
}

fn surface(err: EngineError) -> anyhow::Error {
    anyhow::Error::new(err)
}
