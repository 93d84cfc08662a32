//! p3: merge duplicates, reconcile transcript and baseline atoms, and gate
//! on contradictions.

use std::collections::HashSet;

use async_trait::async_trait;
use skillfactory_shared::{PhaseId, Result};
use tracing::instrument;

use super::{Phase, PhaseContext, PhaseOutput};
use crate::artifacts::{
    self, ATOMS_DEDUP_FILE, ATOMS_RAW_FILE, CONFLICTS_FILE, ConflictsFile, DedupFile, RawAtomsFile,
};
use crate::checkpoint::{METRIC_CONFLICTS_UNRESOLVED, METRIC_IS_PAUSED};
use crate::conflict::run_gate;
use crate::dedup::{
    DedupSettings, SOLO_GROUP_MIN, VERBATIM_GROUP_MAX, adaptive_threshold, cross_source_pass,
    dedup_batch, dedup_group, group_by_category, normalize_categories,
};
use crate::events::PipelineEvent;
use crate::scoring;

pub struct DedupPhase;

#[async_trait]
impl Phase for DedupPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Dedup
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;
        let model = ctx.model(phase)?;
        let raw: RawAtomsFile = artifacts::read_json(ctx.output_dir(), ATOMS_RAW_FILE, phase)?;
        let input_atoms = raw.atoms.len();

        if input_atoms == 0 {
            ctx.warn(phase, "no raw atoms to deduplicate");
            artifacts::write_json(ctx.output_dir(), ATOMS_DEDUP_FILE, &DedupFile::default())?;
            artifacts::write_json(ctx.output_dir(), CONFLICTS_FILE, &ConflictsFile::default())?;
            return Ok(PhaseOutput::new(0.0, 0)
                .artifact(ATOMS_DEDUP_FILE)
                .artifact(CONFLICTS_FILE)
                .metric("input_atoms", 0)
                .metric(METRIC_CONFLICTS_UNRESOLVED, 0)
                .metric(METRIC_IS_PAUSED, false));
        }

        let mut atoms = raw.atoms;
        let recategorised = normalize_categories(&mut atoms);
        if recategorised > 0 {
            ctx.info(phase, &format!("{recategorised} atoms without a category moved to general"));
        }

        ctx.progress(phase, 10, "comparing transcript and baseline atoms");
        let cross_threshold = adaptive_threshold(config.quality.cross_source_threshold, atoms.len());
        let cross = cross_source_pass(atoms, cross_threshold);
        let mut candidates = cross.conflicts;

        let settings = DedupSettings {
            base_threshold: config.quality.dedup_base_threshold,
            language: config.language.clone(),
            domain: config.domain.clone(),
        };
        let groups = group_by_category(cross.atoms);
        let group_count = groups.len();
        let mut kept = Vec::new();
        let mut group_merged = 0usize;
        let mut fallbacks = 0usize;
        let mut batched = Vec::new();
        let mut solo = Vec::new();
        for (category, group) in groups {
            match group.len() {
                n if n <= VERBATIM_GROUP_MAX => kept.extend(
                    dedup_group(model, &category, group, &settings).await?.atoms,
                ),
                n if n < SOLO_GROUP_MIN => batched.push((category, group)),
                _ => solo.push((category, group)),
            }
        }

        let mut outcomes = Vec::new();
        if !batched.is_empty() {
            let batch_atoms: usize = batched.iter().map(|(_, g)| g.len()).sum();
            ctx.progress(
                phase,
                20,
                format!("deduplicating {} small categories ({batch_atoms} atoms) together", batched.len()),
            );
            outcomes.push(dedup_batch(model, batched, &settings).await?);
            ctx.report_cost().await;
        }
        let solo_count = solo.len();
        for (i, (category, group)) in solo.into_iter().enumerate() {
            ctx.progress(
                phase,
                (30 + i * 60 / solo_count.max(1)) as u8,
                format!("deduplicating {category} ({} atoms)", group.len()),
            );
            let outcome = dedup_group(model, &category, group, &settings).await?;
            if outcome.model_called {
                ctx.report_cost().await;
            }
            outcomes.push(outcome);
        }
        for outcome in outcomes {
            for category in &outcome.fallback_categories {
                fallbacks += 1;
                ctx.warn(phase, &format!("kept category {category} as is"));
            }
            group_merged += outcome.duplicates_merged;
            candidates.extend(outcome.conflicts);
            kept.extend(outcome.atoms);
        }

        ctx.progress(phase, 92, "checking conflicts against the baseline");
        let references = if candidates.is_empty() {
            Vec::new()
        } else {
            ctx.baseline(phase)?.references
        };
        let gate = run_gate(candidates, &references, config.quality.auto_resolve_threshold);
        let removed: HashSet<&str> = gate.removed_atoms.iter().map(String::as_str).collect();
        kept.retain(|a| !removed.contains(a.id.as_str()));

        let score = scoring::dedup_score(input_atoms, &kept);
        let conflicts = ConflictsFile::new(gate.conflicts);
        let duplicates_merged = cross.stats.duplicates_merged + group_merged;
        let cross_stats = (cross.stats.total_actions > 0).then_some(cross.stats);
        let mut dedup = DedupFile {
            atoms: kept,
            input_atoms,
            duplicates_merged,
            score,
            cross_source: cross_stats,
            ..DedupFile::default()
        };
        dedup.refresh_counts();

        artifacts::write_json(ctx.output_dir(), ATOMS_DEDUP_FILE, &dedup)?;
        artifacts::write_json(ctx.output_dir(), CONFLICTS_FILE, &conflicts)?;

        if conflicts.unresolved > 0 {
            let pending = conflicts.pending();
            ctx.reporter.emit(PipelineEvent::Conflict {
                count: pending.len(),
                conflicts: pending,
            });
            ctx.warn(
                phase,
                &format!("{} conflicts need a decision before the build continues", conflicts.unresolved),
            );
        }
        ctx.info(
            phase,
            &format!(
                "{input_atoms} -> {} atoms, {duplicates_merged} merged, {} conflicts ({} auto-resolved)",
                dedup.total_atoms, conflicts.total, conflicts.auto_resolved
            ),
        );

        Ok(PhaseOutput::new(score, dedup.total_atoms)
            .artifact(ATOMS_DEDUP_FILE)
            .artifact(CONFLICTS_FILE)
            .metric("input_atoms", input_atoms)
            .metric("output_atoms", dedup.total_atoms)
            .metric("duplicates_merged", duplicates_merged)
            .metric("groups", group_count)
            .metric("group_fallbacks", fallbacks)
            .metric("cross_source_duplicates", cross.stats.duplicates_merged)
            .metric("cross_source_contradictions", cross.stats.contradictions_flagged)
            .metric("cross_source_outdated", cross.stats.outdated_replaced)
            .metric("conflicts_total", conflicts.total)
            .metric("conflicts_auto_resolved", conflicts.auto_resolved)
            .metric(METRIC_CONFLICTS_UNRESOLVED, conflicts.unresolved)
            .metric(METRIC_IS_PAUSED, conflicts.unresolved > 0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillfactory_shared::{Atom, AtomStatus, BaselineSummary, ConflictResolution};

    use super::*;
    use crate::artifacts::BASELINE_SUMMARY_FILE;
    use crate::events::{RecordingReporter, SilentReporter};
    use crate::phases::fixtures;
    use crate::testing::ScriptedModel;

    fn atom(id: &str, title: &str, content: &str, category: &str) -> Atom {
        let mut a = Atom::new(id, title, content, category);
        a.tags = vec!["t".into()];
        a
    }

    fn write_raw(dir: &std::path::Path, atoms: Vec<Atom>) {
        let file = RawAtomsFile {
            total_atoms: atoms.len(),
            atoms,
            score: 80.0,
        };
        artifacts::write_json(dir, ATOMS_RAW_FILE, &file).unwrap();
        artifacts::write_json(dir, BASELINE_SUMMARY_FILE, &BaselineSummary::default()).unwrap();
    }

    #[tokio::test]
    async fn empty_input_is_done_with_zero_score() {
        let dir = fixtures::temp_dir("p3-empty");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        write_raw(&dir, vec![]);
        let model = ScriptedModel::new(vec![]);
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        let out = DedupPhase.run(&ctx).await.unwrap();
        assert_eq!(out.score, 0.0);
        assert_eq!(model.calls(), 0);
        let dedup: DedupFile = artifacts::read_json(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        assert!(dedup.atoms.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn merges_groups_and_pauses_on_conflict() {
        let dir = fixtures::temp_dir("p3");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        write_raw(
            &dir,
            vec![
                atom("atom_0001", "Daily budget floor", "Never set a daily budget under five times the target CPA.", "budget"),
                atom("atom_0002", "Budget floor per ad set", "Keep each ad set's daily budget at five times the target CPA.", "budget"),
                atom("atom_0003", "Budget ramp", "Raise budgets by at most twenty percent per day.", "budget"),
                atom("atom_0004", "Creative refresh", "Refresh creatives every two weeks.", ""),
            ],
        );
        let model = ScriptedModel::new(vec![json!({
            "unique_atoms": [
                {"id": "atom_0001", "title": "Daily budget floor", "content": "Never set a daily budget under five times the target CPA.", "category": "budget", "tags": ["t"], "confidence": 0.8, "merged_from": ["atom_0002"]},
                {"id": "atom_0003", "title": "Budget ramp", "content": "Raise budgets by at most twenty percent per day.", "category": "budget", "tags": ["t"], "confidence": 0.7}
            ],
            "conflicts": [
                {"atom_a_id": "atom_0001", "atom_b_id": "atom_0003", "conflict_type": "contradiction", "description": "ramp vs floor"},
                {"atom_a_id": "atom_0001", "atom_b_id": "atom_9999", "conflict_type": "contradiction", "description": "unknown"}
            ]
        })
        .to_string()]);
        let session = model.session();
        let reporter = RecordingReporter::new();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &reporter,
        };
        let out = DedupPhase.run(&ctx).await.unwrap();

        // the single-atom "general" group never reaches the model
        assert_eq!(model.calls(), 1);
        assert_eq!(out.item_count, 3);
        assert_eq!(out.metrics[METRIC_IS_PAUSED], json!(true));
        assert_eq!(out.metrics[METRIC_CONFLICTS_UNRESOLVED], json!(1));
        assert_eq!(out.metrics["duplicates_merged"], json!(1));

        let dedup: DedupFile = artifacts::read_json(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        assert!(dedup.atoms.iter().all(|a| a.status == AtomStatus::Deduplicated));
        assert!(dedup.atoms.iter().any(|a| a.category == "general"));
        let conflicts: ConflictsFile = artifacts::read_json(&dir, CONFLICTS_FILE, PhaseId::Verify).unwrap();
        assert_eq!(conflicts.total, 1);
        assert_eq!(conflicts.conflicts[0].id, "conflict_001");
        assert_eq!(conflicts.conflicts[0].resolution, ConflictResolution::Pending);

        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Conflict { count: 1, .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn ctx_run<'a>(
        config: &'a skillfactory_shared::BuildConfig,
        state: &'a skillfactory_shared::PipelineState,
        session: &'a skillfactory_model::ModelSession,
    ) -> PhaseContext<'a> {
        PhaseContext {
            config,
            state,
            model: Some(session),
            reporter: &SilentReporter,
        }
    }

    #[tokio::test]
    async fn small_categories_share_one_model_call() {
        let dir = fixtures::temp_dir("p3-batch");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        let mut atoms = Vec::new();
        for (n, category) in [(3, "budget"), (5, "creative"), (14, "targeting")] {
            for i in 1..=n {
                atoms.push(atom(
                    &format!("{category}_{i:02}"),
                    &format!("{category} tip number {i}"),
                    &format!("Advice {i} about {category} for paid campaigns."),
                    category,
                ));
            }
        }
        write_raw(&dir, atoms.clone());
        let unique: Vec<serde_json::Value> = atoms
            .iter()
            .map(|a| json!({"id": a.id, "title": a.title, "content": a.content, "category": a.category, "tags": ["t"]}))
            .collect();
        let model = ScriptedModel::new(vec![json!({"unique_atoms": unique, "conflicts": []}).to_string()]);
        let session = model.session();
        let out = DedupPhase.run(&ctx_run(&config, &state, &session)).await.unwrap();

        assert_eq!(model.calls(), 1);
        assert_eq!(out.item_count, 22);
        assert_eq!(out.metrics["group_fallbacks"], json!(0));
        let dedup: DedupFile = artifacts::read_json(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        assert_eq!(dedup.atoms.iter().filter(|a| a.category == "targeting").count(), 14);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn large_category_gets_its_own_call() {
        let dir = fixtures::temp_dir("p3-solo");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        let mut atoms = Vec::new();
        for (n, category) in [(3, "budget"), (15, "targeting")] {
            for i in 1..=n {
                atoms.push(atom(
                    &format!("{category}_{i:02}"),
                    &format!("{category} tip number {i}"),
                    &format!("Advice {i} about {category} for paid campaigns."),
                    category,
                ));
            }
        }
        write_raw(&dir, atoms);
        // unparseable replies keep both inputs
        let model = ScriptedModel::new(vec!["no".into(), "no".into()]);
        let session = model.session();
        let out = DedupPhase.run(&ctx_run(&config, &state, &session)).await.unwrap();
        assert_eq!(model.calls(), 2);
        assert_eq!(out.item_count, 18);
        assert_eq!(out.metrics["group_fallbacks"], json!(2));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn three_atoms_kept_whole_score_at_most_95() {
        let dir = fixtures::temp_dir("p3-three");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        let atoms = vec![
            atom("atom_0001", "Daily budget floor", "Never set a daily budget under five times the target CPA.", "budget"),
            atom("atom_0002", "Budget ramp", "Raise budgets by at most twenty percent per day.", "budget"),
            atom("atom_0003", "Budget review cadence", "Review budget pacing every Monday morning.", "budget"),
        ];
        write_raw(&dir, atoms.clone());
        let unique: Vec<serde_json::Value> = atoms
            .iter()
            .map(|a| json!({"id": a.id, "title": a.title, "content": a.content, "category": a.category, "tags": ["t"]}))
            .collect();
        let model = ScriptedModel::new(vec![json!({"unique_atoms": unique}).to_string()]);
        let session = model.session();
        let out = DedupPhase.run(&ctx_run(&config, &state, &session)).await.unwrap();

        assert_eq!(out.item_count, 3);
        assert!(out.score <= 95.0, "score {}", out.score);
        assert!(out.score >= 90.0, "score {}", out.score);
        let dedup: DedupFile = artifacts::read_json(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        assert_eq!(dedup.total_atoms, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
