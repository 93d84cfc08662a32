//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use skillfactory_core::artifacts::{self, CONFLICTS_FILE, ConflictsFile};
use skillfactory_core::checkpoint;
use skillfactory_core::events::{LogLevel, PhaseEventStatus, QualityEvent};
use skillfactory_core::{JsonLinesReporter, Pipeline, PipelineEvent, PipelineReporter, RunOutcome};
use skillfactory_model::{AnthropicClient, ModelSession, RetryPolicy};
use skillfactory_shared::{
    AppConfig, BuildConfig, BuildManifest, BuildRecord, BuildStatus, PhaseId, Resolutions,
    database_path, init_config, load_config, validate_api_key,
};
use skillfactory_storage::Storage;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Skill Factory: build AI skills from expert knowledge.
#[derive(Parser)]
#[command(
    name = "skillfactory",
    version,
    about = "Turn expert transcripts and reference docs into a packaged, verified AI skill.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run (or continue) a build from a manifest.
    Build {
        /// Build manifest (TOML).
        #[arg(long)]
        manifest: PathBuf,

        /// Output directory (defaults to <defaults.output_dir>/<name>).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Seed for verification sampling.
        #[arg(long)]
        seed: Option<u64>,

        /// Emit JSON-line events on stdout instead of progress output.
        #[arg(long)]
        events: bool,
    },

    /// Apply conflict resolutions to a paused build and continue it.
    Resolve {
        /// Output directory of the paused build.
        #[arg(short, long)]
        out: PathBuf,

        /// JSON file mapping conflict ids to resolutions.
        #[arg(long)]
        resolutions: PathBuf,

        /// Emit JSON-line events on stdout instead of progress output.
        #[arg(long)]
        events: bool,
    },

    /// Show the checkpoint of a build.
    Status {
        /// Output directory of the build.
        #[arg(short, long)]
        out: PathBuf,
    },

    /// List registered builds.
    List,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Model response cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Remove cached model responses.
    Clear {
        /// Only remove entries older than the configured TTL.
        #[arg(long)]
        expired: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout stays
/// free for the event stream.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "skillfactory=info",
        1 => "skillfactory=debug",
        _ => "skillfactory=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
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

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command and return the process exit code.
pub(crate) async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Build {
            manifest,
            out,
            seed,
            events,
        } => cmd_build(&manifest, out, seed, events).await,
        Command::Resolve {
            out,
            resolutions,
            events,
        } => cmd_resolve(&out, &resolutions, events).await,
        Command::Status { out } => cmd_status(&out).map(|()| 0),
        Command::List => cmd_list().await.map(|()| 0),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().map(|()| 0),
            ConfigAction::Show => cmd_config_show().map(|()| 0),
        },
        Command::Cache {
            action: CacheAction::Clear { expired },
        } => cmd_cache_clear(expired).await.map(|()| 0),
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Human-facing reporter: a spinner for phase progress, printed lines for
/// warnings, conflicts and phase results.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PipelineReporter for CliProgress {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Phase {
                phase,
                name,
                status,
                progress,
                message,
            } => {
                let message = message.unwrap_or_default();
                match status {
                    PhaseEventStatus::Running => self
                        .spinner
                        .set_message(format!("[{phase}] {name} {progress:>3}%  {message}")),
                    PhaseEventStatus::Done => {
                        self.spinner.println(format!("  ✓ {phase} {name}: {message}"));
                    }
                    PhaseEventStatus::Failed => {
                        self.spinner.println(format!("  ✗ {phase} {name}: {message}"));
                    }
                    PhaseEventStatus::Paused => {
                        self.spinner.println(format!("  ⏸ {phase} {name}: {message}"));
                    }
                }
            }
            PipelineEvent::Log { level: LogLevel::Warn | LogLevel::Error, phase, message } => {
                let prefix = phase.map(|p| format!("[{p}] ")).unwrap_or_default();
                self.spinner.println(format!("    ! {prefix}{message}"));
            }
            PipelineEvent::Conflict { conflicts, count } => {
                self.spinner.println(format!("\n  {count} conflicts need review:"));
                for c in conflicts {
                    self.spinner.println(format!(
                        "    {}  {} vs {}: {}",
                        c.id, c.atom_a.id, c.atom_b.id, c.description
                    ));
                }
            }
            PipelineEvent::Quality(QualityEvent::Report {
                atoms_extracted,
                atoms_deduplicated,
                atoms_verified,
                ..
            }) => {
                self.spinner.println(format!(
                    "  atoms: {atoms_extracted} extracted, {atoms_deduplicated} after dedup, {atoms_verified} verified"
                ));
            }
            _ => {}
        }
    }
}

enum Output {
    Progress(Arc<CliProgress>),
    Events(Arc<JsonLinesReporter<std::io::Stdout>>),
}

impl Output {
    fn new(events: bool) -> Self {
        if events {
            Self::Events(Arc::new(JsonLinesReporter::new(std::io::stdout())))
        } else {
            Self::Progress(Arc::new(CliProgress::new()))
        }
    }

    fn reporter(&self) -> Arc<dyn PipelineReporter> {
        match self {
            Self::Progress(p) => p.clone() as Arc<dyn PipelineReporter>,
            Self::Events(e) => e.clone() as Arc<dyn PipelineReporter>,
        }
    }

    fn finish(&self) {
        if let Self::Progress(p) = self {
            p.finish();
        }
    }

    fn is_human(&self) -> bool {
        matches!(self, Self::Progress(_))
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// A model session per the `[model]` config, or `None` without an API key.
fn model_session(app: &AppConfig, registry: Option<&Arc<Storage>>) -> Result<Option<Arc<ModelSession>>> {
    let api_key = match validate_api_key(app) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "no model available");
            return Ok(None);
        }
    };
    let client = AnthropicClient::new(&app.model, api_key)?;
    let mut session = ModelSession::new(Arc::new(client))
        .with_retry(RetryPolicy::new(app.model.max_retries))
        .with_max_credit_errors(app.model.max_credit_errors);
    if app.model.cache_responses {
        if let Some(storage) = registry {
            session = session.with_cache(storage.clone());
        }
    }
    Ok(Some(Arc::new(session)))
}

/// The build registry. A broken registry never blocks a build.
async fn open_registry(app: &AppConfig) -> Option<Arc<Storage>> {
    let path = database_path().ok()?;
    match Storage::open(&path).await {
        Ok(storage) => Some(Arc::new(storage.with_cache_ttl_hours(app.model.cache_ttl_hours))),
        Err(e) => {
            warn!(error = %e, "build registry unavailable");
            None
        }
    }
}

fn status_for(outcome: &RunOutcome) -> (BuildStatus, Option<f64>) {
    match outcome {
        RunOutcome::Completed { quality_score, .. } => (BuildStatus::Completed, Some(*quality_score)),
        RunOutcome::Paused { .. } => (BuildStatus::Paused, None),
        RunOutcome::Failed { .. } => (BuildStatus::Failed, None),
    }
}

async fn record_outcome(registry: Option<&Arc<Storage>>, build_id: &str, outcome: &RunOutcome) {
    let Some(storage) = registry else { return };
    let (status, score) = status_for(outcome);
    if let Err(e) = storage.update_build_status(build_id, status, score).await {
        warn!(error = %e, "failed to update build registry");
    }
}

async fn cmd_build(manifest_path: &Path, out: Option<PathBuf>, seed: Option<u64>, events: bool) -> Result<i32> {
    let app = load_config()?;
    let manifest = BuildManifest::load(manifest_path)?;
    let manifest_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = BuildConfig::from_manifest(&app, manifest, &manifest_dir, out)?;
    if seed.is_some() {
        config.sample_seed = seed;
    }

    let registry = open_registry(&app).await;
    let model = model_session(&app, registry.as_ref())?;
    let output = Output::new(events);
    let mut pipeline = Pipeline::new(config.clone(), output.reporter());
    if let Some(model) = model {
        pipeline = pipeline.with_model(model);
    }

    let build_id = pipeline.build_id();
    if let Some(storage) = &registry {
        let now = Utc::now();
        let existing = storage.get_build(build_id.as_str()).await.ok().flatten();
        let record = BuildRecord {
            id: build_id.to_string(),
            name: config.name.clone(),
            domain: config.domain.clone(),
            output_dir: config.output_dir.display().to_string(),
            status: BuildStatus::Running,
            quality_score: None,
            created_at: existing.map_or(now, |b| b.created_at),
            updated_at: now,
        };
        if let Err(e) = storage.upsert_build(&record).await {
            warn!(error = %e, "failed to register build");
        }
    }

    info!(%build_id, name = %config.name, out = %config.output_dir.display(), "building skill");
    let outcome = pipeline.run().await;
    output.finish();
    let outcome = outcome?;
    record_outcome(registry.as_ref(), build_id.as_str(), &outcome).await;

    if output.is_human() {
        print_outcome(&config.output_dir, &outcome);
    }
    Ok(outcome.exit_code())
}

async fn cmd_resolve(out: &Path, resolutions_path: &Path, events: bool) -> Result<i32> {
    let app = load_config()?;
    let config = BuildConfig::load(out)?;
    let content = std::fs::read_to_string(resolutions_path)
        .wrap_err_with(|| format!("failed to read {}", resolutions_path.display()))?;
    let resolutions: Resolutions = serde_json::from_str(&content)
        .wrap_err_with(|| format!("invalid resolutions in {}", resolutions_path.display()))?;

    let registry = open_registry(&app).await;
    let model = model_session(&app, registry.as_ref())?;
    let output = Output::new(events);
    let mut pipeline = Pipeline::new(config, output.reporter());
    if let Some(model) = model {
        pipeline = pipeline.with_model(model);
    }
    let build_id = pipeline.build_id();

    let result = pipeline.resume_with(&resolutions).await;
    output.finish();
    let (report, outcome) = result?;
    record_outcome(registry.as_ref(), build_id.as_str(), &outcome).await;

    if output.is_human() {
        println!(
            "  Resolutions: {} applied, {} skipped, {} atoms removed",
            report.applied.len(),
            report.skipped.len(),
            report.removed_atoms
        );
        print_outcome(out, &outcome);
    }
    Ok(outcome.exit_code())
}

fn print_outcome(out: &Path, outcome: &RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed {
            quality_score,
            total_cost_usd,
            total_tokens,
        } => {
            println!("  Skill built successfully!");
            println!("  Quality: {quality_score:.1}/100");
            println!("  Cost:    ${total_cost_usd:.4} ({total_tokens} tokens)");
            println!("  Path:    {}", out.display());
        }
        RunOutcome::Paused { reason } => {
            println!("  Build paused: {reason}");
            println!("  Review {} and run:", out.join(CONFLICTS_FILE).display());
            println!("    skillfactory resolve --out {} --resolutions <file.json>", out.display());
        }
        RunOutcome::Failed { phase, error, fatal } => {
            println!("  Build failed in {phase} ({}): {error}", phase.name());
            if *fatal {
                println!("  The run was aborted. Fix the cause and run build again to resume.");
            }
        }
    }
    println!();
}

fn cmd_status(out: &Path) -> Result<()> {
    let state = checkpoint::load(out).ok_or_else(|| eyre!("no checkpoint found in {}", out.display()))?;

    println!();
    println!("  Build:   {}", state.build_id);
    println!("  Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    println!("  {:<4} {:<12} {:<8} {:>6} {:>7} {:>9}", "ID", "PHASE", "STATUS", "SCORE", "ITEMS", "COST");
    for phase in PhaseId::ALL {
        match state.result(phase) {
            Some(r) => println!(
                "  {:<4} {:<12} {:<8} {:>6.1} {:>7} {:>9.4}",
                phase.as_str(),
                phase.name(),
                format!("{:?}", r.status).to_lowercase(),
                r.score,
                r.item_count,
                r.api_cost_usd
            ),
            None => println!("  {:<4} {:<12} {:<8}", phase.as_str(), phase.name(), "pending"),
        }
    }
    println!();
    if state.is_paused {
        println!("  Paused: {}", state.pause_reason.as_deref().unwrap_or("yes"));
        if let Ok(conflicts) = artifacts::read_json::<ConflictsFile>(out, CONFLICTS_FILE, PhaseId::Dedup) {
            for c in conflicts.pending() {
                println!("    {}  {}: {}", c.id, c.conflict_type.as_str(), c.description);
            }
        }
    }
    println!("  Total:   ${:.4}, {} tokens", state.total_cost_usd, state.total_tokens);
    println!();
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let path = database_path()?;
    if !path.exists() {
        println!("No builds registered yet.");
        return Ok(());
    }
    let storage = Storage::open_readonly(&path).await?;
    let builds = storage.list_builds().await?;
    if builds.is_empty() {
        println!("No builds registered yet.");
        return Ok(());
    }

    println!();
    println!("  {:<30} {:<24} {:<10} {:>7}  {}", "ID", "NAME", "STATUS", "SCORE", "OUTPUT");
    for b in builds {
        println!(
            "  {:<30} {:<24} {:<10} {:>7}  {}",
            b.id,
            b.name,
            b.status.as_str(),
            b.quality_score.map(|s| format!("{s:.1}")).unwrap_or_else(|| "-".into()),
            b.output_dir
        );
    }
    println!();
    Ok(())
}

async fn cmd_cache_clear(expired_only: bool) -> Result<()> {
    let app = load_config()?;
    let path = database_path()?;
    if !path.exists() {
        println!("No cache to clear.");
        return Ok(());
    }
    let storage = Storage::open(&path)
        .await?
        .with_cache_ttl_hours(app.model.cache_ttl_hours);
    let removed = if expired_only {
        storage.prune_cache().await?
    } else {
        storage.clear_cache().await?
    };
    println!("Removed {removed} cached responses.");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
