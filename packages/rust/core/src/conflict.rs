//! Conflict gate: numbering, evidence-based auto-resolution, and applying
//! human resolutions to the persisted deduplicated set.

use std::collections::HashSet;
use std::path::Path;

use skillfactory_shared::{
    Atom, AtomRef, AtomStatus, BaselineReference, Conflict, ConflictResolution, PhaseId,
    ResolutionAction, Resolutions, Result,
};
use tracing::{debug, info, warn};

use crate::artifacts::{self, ATOMS_DEDUP_FILE, CONFLICTS_FILE, ConflictsFile, DedupFile};
use crate::dedup::{ConflictCandidate, DEFAULT_CATEGORY};
use crate::evidence;
use crate::text::truncate_chars;

const EVIDENCE_EXCERPT_CHARS: usize = 500;

/// `conflict_001`, `conflict_002`, …
pub fn conflict_id(n: usize) -> String {
    format!("conflict_{n:03}")
}

/// Conflicts after the gate, plus the atoms auto-resolution removed.
#[derive(Debug, Default)]
pub struct GateOutcome {
    pub conflicts: Vec<Conflict>,
    pub removed_atoms: Vec<String>,
}

impl GateOutcome {
    pub fn unresolved(&self) -> usize {
        self.conflicts.iter().filter(|c| c.is_pending()).count()
    }
}

/// Number the candidates and try to settle each one from the baseline.
///
/// Both claims are searched. A side whose evidence score (as a fraction)
/// exceeds `threshold` and is at least the other side's wins, with ties
/// going to A. Everything else stays pending.
pub fn run_gate(
    candidates: Vec<ConflictCandidate>,
    references: &[BaselineReference],
    threshold: f64,
) -> GateOutcome {
    let mut outcome = GateOutcome::default();
    let mut removed: HashSet<String> = HashSet::new();

    for (idx, candidate) in candidates.into_iter().enumerate() {
        let mut conflict = Conflict {
            id: conflict_id(idx + 1),
            atom_a: AtomRef::from(&candidate.atom_a),
            atom_b: AtomRef::from(&candidate.atom_b),
            conflict_type: candidate.kind,
            description: candidate.description,
            baseline_evidence: None,
            auto_resolved: false,
            resolution: ConflictResolution::Pending,
            resolution_note: None,
        };

        // a side already dropped by an earlier resolution settles this one
        let (a_gone, b_gone) = (
            removed.contains(&conflict.atom_a.id),
            removed.contains(&conflict.atom_b.id),
        );
        if a_gone || b_gone {
            let (resolution, gone) = match (a_gone, b_gone) {
                (true, true) => (ConflictResolution::Discard, "both atoms"),
                (true, false) => (ConflictResolution::KeepB, "atom_a"),
                _ => (ConflictResolution::KeepA, "atom_b"),
            };
            conflict.auto_resolved = true;
            conflict.resolution = resolution;
            conflict.resolution_note = Some(format!("Auto-resolved: {gone} already removed by an earlier resolution"));
            debug!(conflict = %conflict.id, "conflict settled by an earlier resolution");
            outcome.conflicts.push(conflict);
            continue;
        }

        if !references.is_empty() {
            let a = evidence::search(&conflict.atom_a.title, &conflict.atom_a.content, references);
            let b = evidence::search(&conflict.atom_b.title, &conflict.atom_b.content, references);
            let (conf_a, conf_b) = (a.score / 100.0, b.score / 100.0);

            let verdict = if conf_a > threshold && conf_a >= conf_b {
                Some((ConflictResolution::KeepA, conf_a, a, conflict.atom_b.id.clone()))
            } else if conf_b > threshold && conf_b > conf_a {
                Some((ConflictResolution::KeepB, conf_b, b, conflict.atom_a.id.clone()))
            } else {
                let best = if a.score >= b.score { a } else { b };
                conflict.baseline_evidence = best.snippet.map(|s| truncate_chars(&s, EVIDENCE_EXCERPT_CHARS).to_string());
                None
            };

            if let Some((resolution, confidence, winner, loser)) = verdict {
                conflict.auto_resolved = true;
                conflict.resolution = resolution;
                conflict.baseline_evidence = winner
                    .snippet
                    .map(|s| truncate_chars(&s, EVIDENCE_EXCERPT_CHARS).to_string());
                conflict.resolution_note = Some(format!(
                    "Auto-resolved: baseline supports {} (confidence {confidence:.2}, {})",
                    if resolution == ConflictResolution::KeepA { "atom_a" } else { "atom_b" },
                    winner.reference.unwrap_or_default()
                ));
                debug!(conflict = %conflict.id, loser = %loser, "conflict auto-resolved");
                removed.insert(loser.clone());
                outcome.removed_atoms.push(loser);
            }
        }
        outcome.conflicts.push(conflict);
    }
    outcome
}

/// What applying a resolution map changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub removed_atoms: usize,
    pub remaining_unresolved: usize,
}

/// Apply human decisions to `atoms_deduplicated.json` and `conflicts.json`.
///
/// The whole map is validated before anything is touched. Unknown ids and
/// conflicts that are no longer pending are skipped, so replaying the same
/// map is a no-op.
pub fn apply_resolutions(output_dir: &Path, resolutions: &Resolutions) -> Result<ResolutionReport> {
    for (id, request) in resolutions {
        request.validate(id)?;
    }

    let mut dedup: DedupFile = artifacts::read_json(output_dir, ATOMS_DEDUP_FILE, PhaseId::Dedup)?;
    let mut conflicts: ConflictsFile =
        artifacts::read_json(output_dir, CONFLICTS_FILE, PhaseId::Dedup)?;
    let mut report = ResolutionReport::default();
    let before = dedup.atoms.len();

    for (id, request) in resolutions {
        let Some(conflict) = conflicts
            .conflicts
            .iter_mut()
            .find(|c| &c.id == id && c.is_pending())
        else {
            debug!(conflict = %id, "unknown or already resolved conflict, skipped");
            report.skipped.push(id.clone());
            continue;
        };

        let a_id = request.atom_a_id.clone().unwrap_or_else(|| conflict.atom_a.id.clone());
        let b_id = request.atom_b_id.clone().unwrap_or_else(|| conflict.atom_b.id.clone());
        match request.action {
            ResolutionAction::KeepA => dedup.atoms.retain(|a| a.id != b_id),
            ResolutionAction::KeepB => dedup.atoms.retain(|a| a.id != a_id),
            ResolutionAction::Discard => dedup.atoms.retain(|a| a.id != a_id && a.id != b_id),
            ResolutionAction::Merge => {
                let merged = request.merged_content.clone().unwrap_or_default();
                match dedup.atoms.iter_mut().find(|a| a.id == a_id) {
                    Some(atom) => {
                        atom.content = merged;
                        atom.status = AtomStatus::Deduplicated;
                        if !atom.merged_from.contains(&b_id) {
                            atom.merged_from.push(b_id.clone());
                        }
                    }
                    None => {
                        warn!(conflict = %id, atom = %a_id, "merge target missing, restoring it");
                        let mut atom = Atom::new(
                            a_id.clone(),
                            conflict.atom_a.title.clone(),
                            merged,
                            DEFAULT_CATEGORY,
                        );
                        atom.confidence = conflict.atom_a.confidence;
                        atom.source = conflict.atom_a.source;
                        atom.status = AtomStatus::Deduplicated;
                        atom.merged_from.push(b_id.clone());
                        dedup.atoms.push(atom);
                    }
                }
                dedup.atoms.retain(|a| a.id != b_id);
            }
        }
        conflict.resolution = request.action.into();
        conflict.resolution_note = Some("Resolved by reviewer".to_string());
        report.applied.push(id.clone());
    }

    conflicts.refresh_counts();
    report.remaining_unresolved = conflicts.unresolved;
    report.removed_atoms = before.saturating_sub(dedup.atoms.len());

    if !report.applied.is_empty() {
        dedup.refresh_counts();
        artifacts::write_json(output_dir, ATOMS_DEDUP_FILE, &dedup)?;
        artifacts::write_json(output_dir, CONFLICTS_FILE, &conflicts)?;
    }
    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        remaining = report.remaining_unresolved,
        "resolutions applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use skillfactory_shared::{ConflictKind, ResolutionRequest, SkillFactoryError};
    use uuid::Uuid;

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sf-conflict-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn atom(id: &str, content: &str) -> Atom {
        Atom::new(id, format!("Title {id}"), content, "tools")
    }

    fn candidate(a: &Atom, b: &Atom) -> ConflictCandidate {
        ConflictCandidate {
            atom_a: a.clone(),
            atom_b: b.clone(),
            kind: ConflictKind::Contradiction,
            description: "they disagree".into(),
        }
    }

    fn seed(dir: &Path, atoms: Vec<Atom>, conflicts: Vec<Conflict>) {
        let dedup = DedupFile {
            total_atoms: atoms.len(),
            atoms,
            ..DedupFile::default()
        };
        artifacts::write_json(dir, ATOMS_DEDUP_FILE, &dedup).unwrap();
        artifacts::write_json(dir, CONFLICTS_FILE, &ConflictsFile::new(conflicts)).unwrap();
    }

    fn ids(dir: &Path) -> Vec<String> {
        let dedup: DedupFile = artifacts::read_json(dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        dedup.atoms.into_iter().map(|a| a.id).collect()
    }

    #[test]
    fn ids_are_zero_padded() {
        assert_eq!(conflict_id(1), "conflict_001");
        assert_eq!(conflict_id(42), "conflict_042");
    }

    #[test]
    fn gate_without_references_leaves_everything_pending() {
        let (a, b) = (atom("atom_0001", "Do X."), atom("atom_0002", "Never do X."));
        let out = run_gate(vec![candidate(&a, &b)], &[], 0.8);
        assert_eq!(out.unresolved(), 1);
        assert!(out.removed_atoms.is_empty());
        assert_eq!(out.conflicts[0].id, "conflict_001");
    }

    #[test]
    fn strong_evidence_auto_resolves() {
        let a = Atom::new(
            "atom_0001",
            "Lookalike seed size",
            "Lookalike audiences work best seeded from one thousand recent purchasers.",
            "audience_targeting",
        );
        let b = Atom::new(
            "atom_0002",
            "Broad targeting",
            "Skip custom seeds entirely and rely on broad delivery.",
            "audience_targeting",
        );
        let refs = vec![BaselineReference::new(
            "lookalikes.md",
            "Lookalike audiences are seeded from recent purchasers; one thousand works best.",
        )];
        let out = run_gate(vec![candidate(&a, &b)], &refs, 0.8);
        let conflict = &out.conflicts[0];
        assert!(conflict.auto_resolved);
        assert_eq!(conflict.resolution, ConflictResolution::KeepA);
        assert_eq!(out.removed_atoms, vec!["atom_0002".to_string()]);
        assert!(conflict.baseline_evidence.is_some());
        assert_eq!(out.unresolved(), 0);
    }

    #[test]
    fn conflict_with_an_already_removed_atom_does_not_pause() {
        let a = Atom::new(
            "atom_0001",
            "Lookalike seed size",
            "Lookalike audiences work best seeded from one thousand recent purchasers.",
            "audience_targeting",
        );
        let b = Atom::new(
            "atom_0002",
            "Broad targeting",
            "Skip custom seeds entirely and rely on broad delivery.",
            "audience_targeting",
        );
        let c = Atom::new("atom_0003", "Interest stacks", "Stack three interests per ad set.", "audience_targeting");
        let refs = vec![BaselineReference::new(
            "lookalikes.md",
            "Lookalike audiences are seeded from recent purchasers; one thousand works best.",
        )];
        let out = run_gate(vec![candidate(&a, &b), candidate(&b, &c)], &refs, 0.8);
        assert_eq!(out.unresolved(), 0);
        assert_eq!(out.removed_atoms, vec!["atom_0002".to_string()]);
        let second = &out.conflicts[1];
        assert_eq!(second.id, "conflict_002");
        assert!(second.auto_resolved);
        assert_eq!(second.resolution, ConflictResolution::KeepB);
        assert!(second.resolution_note.as_deref().unwrap().contains("atom_a"));
    }

    #[test]
    fn discard_then_replay_is_idempotent() {
        let dir = temp_dir();
        let (a, b, c) = (atom("atom_0001", "A."), atom("atom_0002", "B."), atom("atom_0003", "C."));
        let gate = run_gate(vec![candidate(&a, &b)], &[], 0.8);
        seed(&dir, vec![a, b, c], gate.conflicts);

        let mut map = Resolutions::new();
        map.insert("conflict_001".into(), ResolutionRequest::new(ResolutionAction::Discard));
        map.insert("conflict_999".into(), ResolutionRequest::new(ResolutionAction::KeepA));

        let first = apply_resolutions(&dir, &map).unwrap();
        assert_eq!(first.applied, vec!["conflict_001".to_string()]);
        assert_eq!(first.skipped, vec!["conflict_999".to_string()]);
        assert_eq!(first.removed_atoms, 2);
        assert_eq!(first.remaining_unresolved, 0);
        let after_once = ids(&dir);
        assert_eq!(after_once, vec!["atom_0003".to_string()]);

        let second = apply_resolutions(&dir, &map).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(ids(&dir), after_once);

        let conflicts: ConflictsFile = artifacts::read_json(&dir, CONFLICTS_FILE, PhaseId::Verify).unwrap();
        assert_eq!(conflicts.conflicts[0].resolution, ConflictResolution::Discard);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn keep_and_merge_actions() {
        let dir = temp_dir();
        let atoms: Vec<Atom> = (1..=4).map(|i| atom(&format!("atom_{i:04}"), "Body.")).collect();
        let gate = run_gate(
            vec![candidate(&atoms[0], &atoms[1]), candidate(&atoms[2], &atoms[3])],
            &[],
            0.8,
        );
        seed(&dir, atoms, gate.conflicts);

        let mut map = Resolutions::new();
        map.insert("conflict_001".into(), ResolutionRequest::new(ResolutionAction::KeepB));
        let mut merge = ResolutionRequest::new(ResolutionAction::Merge);
        merge.merged_content = Some("Combined claim.".into());
        map.insert("conflict_002".into(), merge);
        apply_resolutions(&dir, &map).unwrap();

        let dedup: DedupFile = artifacts::read_json(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap();
        let ids: Vec<&str> = dedup.atoms.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["atom_0002", "atom_0003"]);
        assert_eq!(dedup.atoms[1].content, "Combined claim.");
        assert_eq!(dedup.atoms[1].merged_from, vec!["atom_0004".to_string()]);
        assert_eq!(dedup.total_atoms, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_map_mutates_nothing() {
        let dir = temp_dir();
        let (a, b) = (atom("atom_0001", "A."), atom("atom_0002", "B."));
        let gate = run_gate(vec![candidate(&a, &b)], &[], 0.8);
        seed(&dir, vec![a, b], gate.conflicts);

        let mut map = Resolutions::new();
        map.insert("conflict_001".into(), ResolutionRequest::new(ResolutionAction::Discard));
        map.insert("conflict_002".into(), ResolutionRequest::new(ResolutionAction::Merge));
        let err = apply_resolutions(&dir, &map).unwrap_err();
        assert!(matches!(err, SkillFactoryError::Validation { .. }));
        assert_eq!(ids(&dir).len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
