//! Phase sequencer: runs the phases in order against a checkpoint, stopping
//! on failure or when the conflict gate pauses the build.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use skillfactory_model::{ModelSession, Usage};
use skillfactory_shared::{
    BuildConfig, BuildId, PhaseId, PhaseResult, PhaseStatus, PipelineState, Resolutions, Result,
    SkillFactoryError,
};
use tracing::{error, info, instrument, warn};

use crate::checkpoint::{self, METRIC_CONFLICTS_UNRESOLVED, METRIC_IS_PAUSED};
use crate::conflict::{ResolutionReport, apply_resolutions};
use crate::events::{LogLevel, PhaseEventStatus, PipelineEvent, PipelineReporter, QualityEvent};
use crate::phases::{Phase, PhaseContext, PhaseOutput, default_phases};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        quality_score: f64,
        total_cost_usd: f64,
        total_tokens: u64,
    },
    /// Waiting for conflict resolutions.
    Paused { reason: String },
    Failed {
        phase: PhaseId,
        error: String,
        /// The run was aborted, not just the phase (credit exhaustion).
        fatal: bool,
    },
}

impl RunOutcome {
    /// Process exit code: 0 completed, 1 failed, 2 paused.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } => 0,
            Self::Failed { .. } => 1,
            Self::Paused { .. } => 2,
        }
    }
}

pub struct Pipeline {
    config: BuildConfig,
    build_id: BuildId,
    model: Option<Arc<ModelSession>>,
    reporter: Arc<dyn PipelineReporter>,
    phases: Vec<Box<dyn Phase>>,
}

impl Pipeline {
    pub fn new(config: BuildConfig, reporter: Arc<dyn PipelineReporter>) -> Self {
        Self {
            config,
            build_id: BuildId::new(),
            model: None,
            reporter,
            phases: default_phases(),
        }
    }

    pub fn with_model(mut self, model: Arc<ModelSession>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_phases(mut self, phases: Vec<Box<dyn Phase>>) -> Self {
        self.phases = phases;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Id of the checkpointed build, or the one a fresh run will use.
    pub fn build_id(&self) -> BuildId {
        checkpoint::load(&self.config.output_dir)
            .map(|s| s.build_id)
            .unwrap_or_else(|| self.build_id.clone())
    }

    /// The checkpoint in the output directory, or a fresh state.
    pub fn load_state(&self) -> PipelineState {
        checkpoint::load(&self.config.output_dir)
            .unwrap_or_else(|| PipelineState::new(self.build_id.clone()))
    }

    /// Run every phase that is not already `done`.
    #[instrument(skip_all, fields(name = %self.config.name, output_dir = %self.config.output_dir.display()))]
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut state = self.load_state();
        if state.is_paused {
            let reason = state.pause_reason.clone().unwrap_or_else(|| "paused".to_string());
            info!(%reason, "build is paused, nothing to run");
            self.emit_paused(&state, &reason);
            return Ok(RunOutcome::Paused { reason });
        }

        let pending: Vec<&dyn Phase> = self
            .phases
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| !checkpoint::should_skip(&state, p.id()))
            .collect();
        if self.model.is_none() {
            if let Some(needs) = pending.iter().find(|p| p.id().requires_model()) {
                return Err(SkillFactoryError::config(format!(
                    "phase {} ({}) needs a model but no API key is configured",
                    needs.id(),
                    needs.id().name()
                )));
            }
        }

        self.config.save()?;
        checkpoint::save(&state, &self.config.output_dir)?;
        info!(build_id = %state.build_id, pending = pending.len(), "starting build");

        for phase in pending {
            let id = phase.id();
            self.reporter.phase(id, PhaseEventStatus::Running, 0, None);
            let started_at = Utc::now();
            let before = self.usage().await;

            let result = {
                let ctx = PhaseContext {
                    config: &self.config,
                    state: &state,
                    model: self.model.as_deref(),
                    reporter: self.reporter.as_ref(),
                };
                phase.run(&ctx).await
            };
            let spent = self.usage().await.since(&before);

            match result {
                Ok(output) => {
                    let record = done_result(id, started_at, &spent, output);
                    let score = record.score;
                    let items = record.item_count;
                    checkpoint::record_result(&mut state, record);
                    checkpoint::save(&state, &self.config.output_dir)?;

                    let pass = score >= self.config.quality.min_phase_score;
                    if !pass {
                        warn!(phase = %id, score, "phase score below threshold");
                    }
                    self.reporter
                        .phase(id, PhaseEventStatus::Done, 100, Some(format!("score {score:.1}")));
                    self.reporter.emit(PipelineEvent::Quality(QualityEvent::Phase {
                        phase: id,
                        score,
                        pass,
                        atoms_count: items,
                    }));
                    self.reporter.cost(state.total_cost_usd, state.total_tokens);

                    if state.is_paused {
                        let reason = state.pause_reason.clone().unwrap_or_default();
                        info!(phase = %id, %reason, "build paused");
                        self.emit_paused(&state, &reason);
                        return Ok(RunOutcome::Paused { reason });
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let fatal = e.is_fatal();
                    error!(phase = %id, error = %message, fatal, "phase failed");
                    checkpoint::record_result(&mut state, failed_result(id, started_at, &spent, &message));
                    checkpoint::save(&state, &self.config.output_dir)?;
                    self.reporter
                        .phase(id, PhaseEventStatus::Failed, 100, Some(message.clone()));
                    self.reporter.log(LogLevel::Error, Some(id), &message);
                    return Ok(RunOutcome::Failed {
                        phase: id,
                        error: message,
                        fatal,
                    });
                }
            }
        }

        let quality_score = state.done_score(PhaseId::Build).unwrap_or(0.0);
        info!(
            quality_score,
            cost_usd = state.total_cost_usd,
            tokens = state.total_tokens,
            "build complete"
        );
        Ok(RunOutcome::Completed {
            quality_score,
            total_cost_usd: state.total_cost_usd,
            total_tokens: state.total_tokens,
        })
    }

    /// Apply conflict resolutions and continue from verification. Stays
    /// paused when conflicts remain. When nothing was applied and the build
    /// is not paused, completed phases are left alone.
    #[instrument(skip_all, fields(resolutions = resolutions.len()))]
    pub async fn resume_with(&self, resolutions: &Resolutions) -> Result<(ResolutionReport, RunOutcome)> {
        let out = &self.config.output_dir;
        let mut state = checkpoint::load(out).ok_or_else(|| {
            SkillFactoryError::validation(format!("no checkpoint in {}", out.display()))
        })?;
        let report = apply_resolutions(out, resolutions)?;

        // a replayed or stale map on a build that is not waiting changes nothing
        if report.applied.is_empty() && !state.is_paused {
            info!(skipped = report.skipped.len(), "no resolutions applied, build not paused");
            let outcome = self.run().await?;
            return Ok((report, outcome));
        }

        if let Some(dedup) = state.phases.get_mut(&PhaseId::Dedup) {
            dedup
                .metrics
                .insert(METRIC_CONFLICTS_UNRESOLVED.into(), Value::from(report.remaining_unresolved));
            dedup
                .metrics
                .insert(METRIC_IS_PAUSED.into(), Value::from(report.remaining_unresolved > 0));
        }

        if report.remaining_unresolved > 0 {
            let reason = format!("{} unresolved conflicts", report.remaining_unresolved);
            state.is_paused = true;
            state.pause_reason = Some(reason.clone());
            state.updated_at = Utc::now();
            checkpoint::save(&state, out)?;
            self.emit_paused(&state, &reason);
            return Ok((report, RunOutcome::Paused { reason }));
        }

        checkpoint::clear_pause(&mut state);
        // everything after the gate reruns on the resolved set
        state.phases.retain(|phase, _| phase.index() <= PhaseId::Dedup.index());
        checkpoint::save(&state, out)?;
        info!(applied = report.applied.len(), "conflicts resolved, resuming");

        let outcome = self.run().await?;
        Ok((report, outcome))
    }

    async fn usage(&self) -> Usage {
        match &self.model {
            Some(model) => model.usage().await,
            None => Usage::default(),
        }
    }

    fn emit_paused(&self, state: &PipelineState, reason: &str) {
        let phase = state.current_phase.unwrap_or(PhaseId::Dedup);
        self.reporter
            .phase(phase, PhaseEventStatus::Paused, 100, Some(reason.to_string()));
        self.reporter.log(LogLevel::Warn, Some(phase), reason);
    }
}

fn done_result(phase: PhaseId, started_at: chrono::DateTime<Utc>, spent: &Usage, output: PhaseOutput) -> PhaseResult {
    PhaseResult {
        phase,
        status: PhaseStatus::Done,
        started_at,
        finished_at: Utc::now(),
        score: output.score,
        item_count: output.item_count,
        api_cost_usd: spent.cost_usd,
        tokens_used: spent.total_tokens(),
        artifacts: output.artifacts,
        metrics: output.metrics,
        error: None,
    }
}

fn failed_result(phase: PhaseId, started_at: chrono::DateTime<Utc>, spent: &Usage, message: &str) -> PhaseResult {
    PhaseResult {
        phase,
        status: PhaseStatus::Failed,
        started_at,
        finished_at: Utc::now(),
        score: 0.0,
        item_count: 0,
        api_cost_usd: spent.cost_usd,
        tokens_used: spent.total_tokens(),
        artifacts: Vec::new(),
        metrics: Default::default(),
        error: Some(message.to_string()),
    }
}
