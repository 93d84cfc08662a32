//! p0: load the baseline reference corpus.

use async_trait::async_trait;
use skillfactory_baseline::BaselineLoader;
use skillfactory_shared::{BaselineSummary, PhaseId, Result};
use tracing::instrument;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::artifacts::{self, BASELINE_SUMMARY_FILE};
use crate::scoring;

/// Score when no sources are configured: neutral, not a failure.
const NO_SOURCES_SCORE: f64 = 50.0;

pub struct BaselinePhase;

#[async_trait]
impl Phase for BaselinePhase {
    fn id(&self) -> PhaseId {
        PhaseId::Baseline
    }

    #[instrument(skip_all, fields(sources = ctx.config.baseline.len()))]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;

        let summary = if config.baseline.is_empty() {
            ctx.info(phase, "no baseline sources configured");
            BaselineSummary {
                score: NO_SOURCES_SCORE,
                ..BaselineSummary::default()
            }
        } else {
            ctx.progress(phase, 10, format!("loading {} baseline sources", config.baseline.len()));
            let loader = BaselineLoader::new(&config.fetch)?;
            let loaded = loader.load(&config.baseline).await;
            for failure in &loaded.failures {
                ctx.warn(phase, &format!("baseline source skipped: {failure}"));
            }
            let score = scoring::baseline_score(&loaded.references, &config.domain, &loaded.topics);
            BaselineSummary {
                total_tokens: loaded.references.iter().map(|r| r.tokens).sum(),
                references: loaded.references,
                topics: loaded.topics,
                score,
                sources: loaded.sources,
            }
        };

        artifacts::write_json(ctx.output_dir(), BASELINE_SUMMARY_FILE, &summary)?;
        ctx.info(
            phase,
            &format!(
                "baseline: {} references, {} topics, ~{} tokens",
                summary.references.len(),
                summary.topics.len(),
                summary.total_tokens
            ),
        );

        Ok(PhaseOutput::new(summary.score, summary.references.len())
            .artifact(BASELINE_SUMMARY_FILE)
            .metric("references", summary.references.len())
            .metric("topics", summary.topics.len())
            .metric("total_tokens", summary.total_tokens)
            .metric("sources_failed", config.baseline.len().saturating_sub(summary.sources.len())))
    }
}
