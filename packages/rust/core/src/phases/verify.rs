//! p4: check a sample of atoms against the baseline.

use async_trait::async_trait;
use serde::Deserialize;
use skillfactory_model::{ModelRequest, ModelSession};
use skillfactory_shared::{Atom, AtomStatus, Evidence, EvidenceStrength, PhaseId, Result};
use tracing::{debug, instrument};

use super::{Phase, PhaseContext, PhaseOutput};
use crate::artifacts::{self, ATOMS_DEDUP_FILE, ATOMS_VERIFIED_FILE, DedupFile, VerifiedFile};
use crate::checkpoint::METRIC_EVIDENCE_RATE;
use crate::{evidence, prompts, sampling, scoring};

const CONFIDENCE_BOOST: f64 = 0.05;
pub const NOT_FOUND_NOTE: &str = "Expert insight: not found in baseline";
pub const NOT_SAMPLED_NOTE: &str = "Not sampled: passed through";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Review {
    status: String,
    note: Option<String>,
    updated_content: Option<String>,
}

pub struct VerifyPhase;

#[async_trait]
impl Phase for VerifyPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Verify
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;
        let dedup: DedupFile = artifacts::read_json(ctx.output_dir(), ATOMS_DEDUP_FILE, phase)?;
        let references = ctx.baseline(phase)?.references;

        let mut atoms = dedup.atoms;
        let picked = sampling::sample_indices(atoms.len(), config.quality_tier, config.sample_seed);
        let mut sampled = vec![false; atoms.len()];
        for &i in &picked {
            sampled[i] = true;
        }
        ctx.info(
            phase,
            &format!("verifying {} of {} atoms ({:?} tier)", picked.len(), atoms.len(), config.quality_tier),
        );

        let mut found = 0usize;
        for (n, &i) in picked.iter().enumerate() {
            ctx.progress(
                phase,
                (n * 95 / picked.len().max(1)) as u8,
                format!("checking {}", atoms[i].id),
            );
            let atom = &mut atoms[i];
            let ev = evidence::search(&atom.title, &atom.content, &references);
            if ev.found {
                found += 1;
                apply_found(atom, ev);
                if let Some(model) = ctx.model {
                    if atom.evidence.as_ref().is_some_and(|e| e.strength == EvidenceStrength::Weak) {
                        review(model, atom).await?;
                        ctx.report_cost().await;
                    }
                }
            } else {
                atom.status = AtomStatus::Unverified;
                atom.baseline_reference = ev.reference.clone();
                atom.verification_note = Some(NOT_FOUND_NOTE.to_string());
                atom.evidence = Some(ev);
            }
        }

        for (atom, _) in atoms.iter_mut().zip(&sampled).filter(|(_, s)| !**s) {
            atom.status = AtomStatus::Passthrough;
            atom.verification_note = Some(NOT_SAMPLED_NOTE.to_string());
        }

        let count = |status: AtomStatus| atoms.iter().filter(|a| a.status == status).count();
        let (verified, unverified, flagged, passthrough) = (
            count(AtomStatus::Verified),
            count(AtomStatus::Unverified),
            count(AtomStatus::Flagged),
            count(AtomStatus::Passthrough),
        );
        let evidence_rate = if picked.is_empty() {
            0.0
        } else {
            found as f64 / picked.len() as f64
        };
        let score = scoring::verification_score(picked.len(), found, flagged);

        let file = VerifiedFile {
            total_atoms: atoms.len(),
            atoms,
            sampled: picked.len(),
            verified,
            unverified,
            flagged,
            passthrough,
            evidence_rate,
            score,
        };
        artifacts::write_json(ctx.output_dir(), ATOMS_VERIFIED_FILE, &file)?;
        ctx.info(
            phase,
            &format!(
                "{verified} verified, {unverified} unverified, {flagged} flagged, evidence rate {:.0}%",
                evidence_rate * 100.0
            ),
        );

        Ok(PhaseOutput::new(score, file.total_atoms)
            .artifact(ATOMS_VERIFIED_FILE)
            .metric("sampled", file.sampled)
            .metric("verified", verified)
            .metric("unverified", unverified)
            .metric("flagged", flagged)
            .metric("passthrough", passthrough)
            .metric(METRIC_EVIDENCE_RATE, evidence_rate))
    }
}

fn apply_found(atom: &mut Atom, ev: Evidence) {
    atom.status = AtomStatus::Verified;
    atom.confidence = (atom.confidence + CONFIDENCE_BOOST).min(1.0);
    atom.baseline_reference = ev.reference.clone();
    atom.verification_note = Some(format!(
        "{} evidence ({:.1}%) in {}",
        if ev.strength == EvidenceStrength::Strong { "Strong" } else { "Weak" },
        ev.score,
        ev.reference.as_deref().unwrap_or("baseline")
    ));
    atom.evidence = Some(ev);
}

/// Ask the model whether weak evidence actually supports the atom. A failed
/// or unparseable review leaves the evidence verdict in place.
async fn review(model: &ModelSession, atom: &mut Atom) -> Result<()> {
    let (reference, snippet) = atom
        .evidence
        .as_ref()
        .map(|e| (e.reference.clone().unwrap_or_default(), e.snippet.clone().unwrap_or_default()))
        .unwrap_or_default();
    let request = ModelRequest::new(
        prompts::VERIFY_SYSTEM,
        prompts::verify_user(&atom.title, &atom.content, &reference, &snippet),
    )
    .light();
    let review: Review = match model.call_json_as(&request).await {
        Ok(r) => r,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            debug!(atom = %atom.id, error = %e, "review failed, keeping evidence verdict");
            return Ok(());
        }
    };

    match review.status.trim().to_lowercase().as_str() {
        "flagged" | "contradicted" => {
            atom.status = AtomStatus::Flagged;
            atom.verification_note = Some(
                review
                    .note
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("Contradicted by {reference}")),
            );
        }
        "updated" => {
            if let Some(content) = review.updated_content.filter(|c| !c.trim().is_empty()) {
                atom.content = content.trim().to_string();
                atom.verification_note = Some(format!("Updated from {reference}"));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillfactory_shared::{BaselineReference, BaselineSummary, QualityTier};

    use super::*;
    use crate::artifacts::BASELINE_SUMMARY_FILE;
    use crate::events::SilentReporter;
    use crate::phases::fixtures;
    use crate::testing::ScriptedModel;

    fn seed(dir: &std::path::Path, atoms: Vec<Atom>) {
        let mut dedup = DedupFile {
            atoms,
            ..DedupFile::default()
        };
        dedup.refresh_counts();
        artifacts::write_json(dir, ATOMS_DEDUP_FILE, &dedup).unwrap();
        let summary = BaselineSummary {
            references: vec![BaselineReference::new(
                "bidding.md",
                "Cost cap bidding keeps average cost near the cap. Bid cap bidding limits each auction bid.",
            )],
            ..BaselineSummary::default()
        };
        artifacts::write_json(dir, BASELINE_SUMMARY_FILE, &summary).unwrap();
    }

    fn atoms() -> Vec<Atom> {
        vec![
            Atom::new("atom_0001", "Cost cap bidding", "Cost cap keeps average cost near the cap.", "bidding"),
            Atom::new("atom_0002", "Story hooks", "Open every video with a question in the first second.", "creative"),
        ]
    }

    #[tokio::test]
    async fn evidence_only_without_model() {
        let dir = fixtures::temp_dir("p4");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        seed(&dir, atoms());
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: None,
            reporter: &SilentReporter,
        };
        let out = VerifyPhase.run(&ctx).await.unwrap();
        assert_eq!(out.metrics[METRIC_EVIDENCE_RATE], json!(0.5));

        let file: VerifiedFile = artifacts::read_json(&dir, ATOMS_VERIFIED_FILE, PhaseId::Build).unwrap();
        assert_eq!((file.sampled, file.verified, file.unverified), (2, 1, 1));
        let verified = &file.atoms[0];
        assert_eq!(verified.status, AtomStatus::Verified);
        assert!((verified.confidence - 0.55).abs() < 1e-9);
        assert_eq!(verified.baseline_reference.as_deref(), Some("bidding.md"));
        let unverified = &file.atoms[1];
        assert_eq!(unverified.verification_note.as_deref(), Some(NOT_FOUND_NOTE));
        assert_eq!(unverified.baseline_reference.as_deref(), Some("bidding.md"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unsampled_atoms_pass_through() {
        let dir = fixtures::temp_dir("p4-draft");
        let mut config = fixtures::config(dir.clone());
        config.quality_tier = QualityTier::Draft;
        let state = fixtures::state();
        seed(&dir, atoms());
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: None,
            reporter: &SilentReporter,
        };
        VerifyPhase.run(&ctx).await.unwrap();
        let file: VerifiedFile = artifacts::read_json(&dir, ATOMS_VERIFIED_FILE, PhaseId::Build).unwrap();
        assert_eq!(file.sampled, 1);
        assert_eq!(file.passthrough, 1);
        let passed = file.atoms.iter().find(|a| a.status == AtomStatus::Passthrough).unwrap();
        assert_eq!(passed.verification_note.as_deref(), Some(NOT_SAMPLED_NOTE));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn weak_evidence_review_can_flag() {
        let dir = fixtures::temp_dir("p4-review");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        // half the keywords match: weak evidence
        seed(
            &dir,
            vec![Atom::new("atom_0001", "Bidding cap", "Auction limits mostly ignored otherwise", "bidding")],
        );
        let model = ScriptedModel::new(vec![
            json!({"status": "flagged", "confidence": 0.9, "note": "Reference says caps are enforced"}).to_string(),
        ]);
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        let out = VerifyPhase.run(&ctx).await.unwrap();
        assert_eq!(model.calls(), 1);
        assert_eq!(out.metrics["flagged"], json!(1));
        let file: VerifiedFile = artifacts::read_json(&dir, ATOMS_VERIFIED_FILE, PhaseId::Build).unwrap();
        assert_eq!(file.atoms[0].status, AtomStatus::Flagged);
        assert_eq!(file.evidence_rate, 1.0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
