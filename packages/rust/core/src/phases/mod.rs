//! The six build phases and the context they run in.

mod audit;
mod baseline;
mod build;
mod dedup;
mod extract;
mod verify;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use skillfactory_model::ModelSession;
use skillfactory_shared::{
    BaselineSummary, BuildConfig, PhaseId, PipelineState, Result, SkillFactoryError,
};
use tracing::warn;

pub use audit::AuditPhase;
pub use baseline::BaselinePhase;
pub use build::BuildPhase;
pub use dedup::DedupPhase;
pub use extract::ExtractPhase;
pub use verify::VerifyPhase;

use crate::artifacts::{self, BASELINE_SUMMARY_FILE};
use crate::events::{LogLevel, PhaseEventStatus, PipelineReporter};
use crate::packager::{DirectoryPackager, Packager};

/// Transcript chunk size in tokens.
pub const CHUNK_TOKENS: usize = 6000;
/// Context carried between adjacent chunks, in tokens.
pub const CHUNK_OVERLAP_TOKENS: usize = 200;

/// Everything a phase may read. Phases never hold state between runs; their
/// inputs are the artifacts on disk.
pub struct PhaseContext<'a> {
    pub config: &'a BuildConfig,
    pub state: &'a PipelineState,
    pub model: Option<&'a ModelSession>,
    pub reporter: &'a dyn PipelineReporter,
}

impl PhaseContext<'_> {
    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn model(&self, phase: PhaseId) -> Result<&ModelSession> {
        self.model.ok_or_else(|| {
            SkillFactoryError::config(format!(
                "phase {phase} ({}) needs a model client but none is configured",
                phase.name()
            ))
        })
    }

    pub fn progress(&self, phase: PhaseId, progress: u8, message: impl Into<String>) {
        self.reporter
            .phase(phase, PhaseEventStatus::Running, progress, Some(message.into()));
    }

    pub fn info(&self, phase: PhaseId, message: &str) {
        self.reporter.log(LogLevel::Info, Some(phase), message);
    }

    pub fn warn(&self, phase: PhaseId, message: &str) {
        warn!(%phase, "{message}");
        self.reporter.log(LogLevel::Warn, Some(phase), message);
    }

    /// Emit the session's running cost.
    pub async fn report_cost(&self) {
        if let Some(model) = self.model {
            let usage = model.usage().await;
            self.reporter.cost(usage.cost_usd, usage.total_tokens());
        }
    }

    /// The baseline written by p0.
    pub fn baseline(&self, phase: PhaseId) -> Result<BaselineSummary> {
        artifacts::read_json(self.output_dir(), BASELINE_SUMMARY_FILE, phase)
    }
}

/// What a successful phase hands back to the sequencer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub score: f64,
    pub item_count: usize,
    pub artifacts: Vec<String>,
    pub metrics: BTreeMap<String, Value>,
}

impl PhaseOutput {
    pub fn new(score: f64, item_count: usize) -> Self {
        Self {
            score,
            item_count,
            ..Self::default()
        }
    }

    pub fn artifact(mut self, name: impl Into<String>) -> Self {
        self.artifacts.push(name.into());
        self
    }

    pub fn metric(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}

/// One step of the build.
#[async_trait]
pub trait Phase: Send + Sync {
    fn id(&self) -> PhaseId;

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput>;
}

/// The standard phase list, in order.
pub fn default_phases() -> Vec<Box<dyn Phase>> {
    phases_with_packager(Box::new(DirectoryPackager))
}

pub fn phases_with_packager(packager: Box<dyn Packager>) -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(BaselinePhase),
        Box::new(AuditPhase),
        Box::new(ExtractPhase),
        Box::new(DedupPhase),
        Box::new(VerifyPhase),
        Box::new(BuildPhase::new(packager)),
    ]
}

/// A transcript read from disk.
pub struct Transcript {
    pub name: String,
    pub text: String,
}

/// Read the configured transcripts. Unreadable or empty files are skipped
/// with a warning; none at all is a phase error.
pub fn read_transcripts(ctx: &PhaseContext<'_>, phase: PhaseId) -> Result<Vec<Transcript>> {
    let mut out = Vec::new();
    for path in &ctx.config.transcripts {
        match std::fs::read_to_string(path) {
            Ok(text) if !text.trim().is_empty() => out.push(Transcript {
                name: display_name(path),
                text,
            }),
            Ok(_) => ctx.warn(phase, &format!("transcript {} is empty, skipped", path.display())),
            Err(e) => ctx.warn(
                phase,
                &format!("transcript {} unreadable, skipped: {e}", path.display()),
            ),
        }
    }
    if out.is_empty() {
        return Err(SkillFactoryError::phase(
            phase.as_str(),
            "no readable transcripts",
        ));
    }
    Ok(out)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
