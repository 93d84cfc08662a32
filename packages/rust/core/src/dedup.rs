//! Deduplication engine: cross-source pass, per-category model merge with an
//! adaptive threshold, and the over-reduction safeguard.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Deserialize;
use skillfactory_model::{ModelRequest, ModelSession};
use skillfactory_shared::{Atom, AtomSource, AtomStatus, ConflictKind, Result};
use tracing::{debug, warn};

use crate::artifacts::CrossSourceStats;
use crate::atoms::{ModelAtom, parse_items};
use crate::prompts;
use crate::text::{has_negation, keyword_overlap, keyword_set, numbers};

/// Groups of this size or smaller are kept verbatim.
pub const VERBATIM_GROUP_MAX: usize = 2;
/// Groups at least this large get a model call of their own; smaller
/// groups above the verbatim size share one batched call.
pub const SOLO_GROUP_MIN: usize = 15;
/// Lowest threshold the adaptive curve may reach.
pub const THRESHOLD_FLOOR: f64 = 0.50;
/// A merge result keeping less than this share of its input is rejected.
pub const MIN_KEPT_SHARE: f64 = 0.30;
/// Label for atoms without a category.
pub const DEFAULT_CATEGORY: &str = "general";

/// Relax `base` for small inputs: <30 items −0.15, <50 −0.10, <100 −0.05.
pub fn adaptive_threshold(base: f64, count: usize) -> f64 {
    let adjusted = match count {
        0..30 => base - 0.15,
        30..50 => base - 0.10,
        50..100 => base - 0.05,
        _ => base,
    };
    // round away float noise from the subtraction
    ((adjusted.max(THRESHOLD_FLOOR)) * 100.0).round() / 100.0
}

/// Give empty or whitespace categories the default label.
pub fn normalize_categories(atoms: &mut [Atom]) -> usize {
    let mut changed = 0;
    for atom in atoms.iter_mut() {
        if atom.category.trim().is_empty() {
            debug!(id = %atom.id, "missing category, assigned '{DEFAULT_CATEGORY}'");
            atom.category = DEFAULT_CATEGORY.to_string();
            changed += 1;
        }
    }
    changed
}

/// Partition by category, preserving first-seen order within each group.
pub fn group_by_category(atoms: Vec<Atom>) -> BTreeMap<String, Vec<Atom>> {
    let mut groups: BTreeMap<String, Vec<Atom>> = BTreeMap::new();
    for atom in atoms {
        groups.entry(atom.category.clone()).or_default().push(atom);
    }
    groups
}

/// Whether a merge step kept implausibly few atoms.
pub fn safeguard_rejects(input: usize, kept: usize) -> bool {
    kept == 0 || (kept as f64) < input as f64 * MIN_KEPT_SHARE
}

/// A contradiction to be handed to the conflict gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCandidate {
    pub atom_a: Atom,
    pub atom_b: Atom,
    pub kind: ConflictKind,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Cross-source pass
// ---------------------------------------------------------------------------

/// What to do about a transcript/baseline atom pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairIssue {
    Duplicate,
    Contradiction,
    Outdated,
}

/// Classify a transcript atom against a baseline atom with the given
/// keyword overlap. Below two thirds of the threshold the pair is unrelated.
pub fn detect_issue(transcript: &Atom, baseline: &Atom, overlap: f64, threshold: f64) -> Option<PairIssue> {
    if overlap < threshold * 2.0 / 3.0 {
        return None;
    }
    if overlap >= threshold {
        return Some(PairIssue::Duplicate);
    }
    if has_negation(&transcript.content) != has_negation(&baseline.content) {
        return Some(PairIssue::Contradiction);
    }
    let (nums_t, nums_b) = (numbers(&transcript.content), numbers(&baseline.content));
    if !nums_t.is_empty() && !nums_b.is_empty() && nums_t != nums_b {
        return Some(if baseline.gap_filled {
            PairIssue::Outdated
        } else {
            PairIssue::Contradiction
        });
    }
    None
}

#[derive(Debug, Default)]
pub struct CrossSourceOutcome {
    pub atoms: Vec<Atom>,
    pub conflicts: Vec<ConflictCandidate>,
    pub stats: CrossSourceStats,
}

/// Compare every transcript atom with every baseline atom.
///
/// Duplicates keep the higher-confidence side (ties keep the transcript
/// atom). A transcript atom whose numbers disagree with a gap-filled
/// baseline atom is replaced as outdated. Other contradictions are flagged.
pub fn cross_source_pass(atoms: Vec<Atom>, threshold: f64) -> CrossSourceOutcome {
    let transcript: Vec<usize> = (0..atoms.len())
        .filter(|&i| atoms[i].source == AtomSource::Transcript)
        .collect();
    let baseline: Vec<usize> = (0..atoms.len())
        .filter(|&i| atoms[i].source == AtomSource::Baseline)
        .collect();
    if transcript.is_empty() || baseline.is_empty() {
        return CrossSourceOutcome {
            atoms,
            ..CrossSourceOutcome::default()
        };
    }

    let keywords: Vec<BTreeSet<String>> = atoms
        .iter()
        .map(|a| keyword_set(&format!("{} {}", a.title, a.content)))
        .collect();
    let mut removed: HashSet<usize> = HashSet::new();
    let mut conflicts = Vec::new();
    let mut stats = CrossSourceStats::default();

    for &t in &transcript {
        if removed.contains(&t) {
            continue;
        }
        for &b in &baseline {
            if removed.contains(&b) {
                continue;
            }
            let overlap = keyword_overlap(&keywords[t], &keywords[b]);
            match detect_issue(&atoms[t], &atoms[b], overlap, threshold) {
                None => {}
                Some(PairIssue::Duplicate) => {
                    if atoms[t].confidence >= atoms[b].confidence {
                        removed.insert(b);
                    } else {
                        removed.insert(t);
                    }
                    stats.duplicates_merged += 1;
                    debug!(transcript = %atoms[t].id, baseline = %atoms[b].id, overlap, "cross-source duplicate");
                    break;
                }
                Some(PairIssue::Contradiction) => {
                    conflicts.push(ConflictCandidate {
                        atom_a: atoms[t].clone(),
                        atom_b: atoms[b].clone(),
                        kind: ConflictKind::Contradiction,
                        description: format!(
                            "Transcript and baseline disagree on '{}'",
                            atoms[t].title
                        ),
                    });
                    stats.contradictions_flagged += 1;
                }
                Some(PairIssue::Outdated) => {
                    removed.insert(t);
                    stats.outdated_replaced += 1;
                    debug!(transcript = %atoms[t].id, baseline = %atoms[b].id, "outdated, using baseline version");
                    break;
                }
            }
        }
    }

    stats.total_actions =
        stats.duplicates_merged + stats.contradictions_flagged + stats.outdated_replaced;
    let atoms = atoms
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, a)| a)
        .collect();
    CrossSourceOutcome {
        atoms,
        conflicts,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Per-category merge
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelConflict {
    atom_a_id: String,
    atom_b_id: String,
    conflict_type: String,
    description: String,
}

/// Result of deduplicating one category group or a batch of groups.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub atoms: Vec<Atom>,
    pub duplicates_merged: usize,
    pub conflicts: Vec<ConflictCandidate>,
    pub model_called: bool,
    /// Categories whose merge result was discarded and input kept.
    pub fallback_categories: Vec<String>,
}

impl GroupOutcome {
    pub fn fell_back(&self) -> bool {
        !self.fallback_categories.is_empty()
    }

    fn kept_as_is(atoms: Vec<Atom>, categories: Vec<String>) -> Self {
        Self {
            atoms: mark_deduplicated(atoms),
            model_called: true,
            fallback_categories: categories,
            ..Self::default()
        }
    }
}

/// Settings shared by every group of a run.
#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub base_threshold: f64,
    pub language: String,
    pub domain: String,
}

fn mark_deduplicated(mut atoms: Vec<Atom>) -> Vec<Atom> {
    for atom in &mut atoms {
        atom.status = AtomStatus::Deduplicated;
    }
    atoms
}

/// Ask the light model to merge `atoms`. `None` when the call or its JSON
/// failed; credit exhaustion propagates.
async fn request_merge(
    session: &ModelSession,
    label: &str,
    atoms: &[Atom],
    settings: &DedupSettings,
) -> Result<Option<serde_json::Value>> {
    let threshold = adaptive_threshold(settings.base_threshold, atoms.len());
    let atoms_json = serde_json::to_string_pretty(&prompt_view(atoms)).unwrap_or_default();
    let request = ModelRequest::new(
        prompts::DEDUP_SYSTEM,
        prompts::dedup_user(&atoms_json, atoms.len(), threshold, &settings.language, &settings.domain),
    )
    .light();

    match session.call_json(&request).await {
        Ok(v) => {
            debug!(label, input = atoms.len(), threshold, "dedup reply received");
            Ok(Some(v))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(label, error = %e, "dedup call failed, keeping atoms as they are");
            Ok(None)
        }
    }
}

/// Conflicts from the reply whose atoms are both in `atoms`.
fn reply_conflicts(reply: &serde_json::Value, atoms: &[Atom]) -> Vec<ConflictCandidate> {
    let by_id: HashMap<&str, &Atom> = atoms.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut conflicts = Vec::new();
    for c in parse_items::<ModelConflict>(reply, "conflicts") {
        match (by_id.get(c.atom_a_id.as_str()), by_id.get(c.atom_b_id.as_str())) {
            (Some(a), Some(b)) if a.id != b.id => conflicts.push(ConflictCandidate {
                atom_a: (*a).clone(),
                atom_b: (*b).clone(),
                kind: ConflictKind::from_label(&c.conflict_type),
                description: c.description,
            }),
            _ => debug!(a = %c.atom_a_id, b = %c.atom_b_id, "conflict references unknown atoms, ignored"),
        }
    }
    conflicts
}

/// Deduplicate one category group.
///
/// Small groups are returned as they are without a model call. A failed
/// call, an unparseable reply, or a reply the safeguard rejects keeps the
/// group's input. Credit exhaustion propagates.
pub async fn dedup_group(
    session: &ModelSession,
    category: &str,
    atoms: Vec<Atom>,
    settings: &DedupSettings,
) -> Result<GroupOutcome> {
    if atoms.len() <= VERBATIM_GROUP_MAX {
        return Ok(GroupOutcome {
            atoms: mark_deduplicated(atoms),
            ..GroupOutcome::default()
        });
    }

    let Some(reply) = request_merge(session, category, &atoms, settings).await? else {
        return Ok(GroupOutcome::kept_as_is(atoms, vec![category.to_string()]));
    };

    let merged = merge_reply(category, &atoms, parse_items::<ModelAtom>(&reply, "unique_atoms"));
    if safeguard_rejects(atoms.len(), merged.len()) {
        warn!(
            category,
            input = atoms.len(),
            kept = merged.len(),
            "dedup reply removed too much, keeping original atoms"
        );
        return Ok(GroupOutcome::kept_as_is(atoms, vec![category.to_string()]));
    }

    let conflicts = reply_conflicts(&reply, &atoms);
    debug!(category, input = atoms.len(), kept = merged.len(), conflicts = conflicts.len(), "group deduplicated");
    Ok(GroupOutcome {
        duplicates_merged: atoms.len().saturating_sub(merged.len()),
        atoms: merged,
        conflicts,
        model_called: true,
        fallback_categories: Vec::new(),
    })
}

/// Deduplicate several medium-sized groups with a single model call.
///
/// Every returned atom goes back to the category of the input it came
/// from. The safeguard is applied per category: a category that lost too
/// much keeps its input while the others take the merged result.
pub async fn dedup_batch(
    session: &ModelSession,
    groups: Vec<(String, Vec<Atom>)>,
    settings: &DedupSettings,
) -> Result<GroupOutcome> {
    let categories: Vec<String> = groups.iter().map(|(c, _)| c.clone()).collect();
    let atoms: Vec<Atom> = groups.into_iter().flat_map(|(_, g)| g).collect();
    if atoms.is_empty() {
        return Ok(GroupOutcome::default());
    }

    let Some(reply) = request_merge(session, "batch", &atoms, settings).await? else {
        return Ok(GroupOutcome::kept_as_is(atoms, categories));
    };

    let merged = merge_reply(DEFAULT_CATEGORY, &atoms, parse_items::<ModelAtom>(&reply, "unique_atoms"));
    let mut merged_by_category: HashMap<String, Vec<Atom>> = HashMap::new();
    for atom in merged {
        merged_by_category.entry(atom.category.clone()).or_default().push(atom);
    }

    let mut out = GroupOutcome {
        model_called: true,
        ..GroupOutcome::default()
    };
    for category in &categories {
        let input: Vec<Atom> = atoms.iter().filter(|a| &a.category == category).cloned().collect();
        let kept = merged_by_category.remove(category).unwrap_or_default();
        if safeguard_rejects(input.len(), kept.len()) {
            warn!(
                category = %category,
                input = input.len(),
                kept = kept.len(),
                "batched dedup removed too much, keeping original atoms"
            );
            out.atoms.extend(mark_deduplicated(input));
            out.fallback_categories.push(category.clone());
        } else {
            out.duplicates_merged += input.len().saturating_sub(kept.len());
            out.atoms.extend(kept);
        }
    }
    // new categories the model invented are kept as returned
    let mut extra: Vec<(String, Vec<Atom>)> = merged_by_category.into_iter().collect();
    extra.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, kept) in extra {
        out.atoms.extend(kept);
    }

    out.conflicts = reply_conflicts(&reply, &atoms);
    debug!(
        groups = categories.len(),
        input = atoms.len(),
        kept = out.atoms.len(),
        fallbacks = out.fallback_categories.len(),
        "batch deduplicated"
    );
    Ok(out)
}

/// Fields the model needs to see.
fn prompt_view(atoms: &[Atom]) -> Vec<serde_json::Value> {
    atoms
        .iter()
        .map(|a| {
            serde_json::json!({
                "id": a.id,
                "title": a.title,
                "content": a.content,
                "category": a.category,
                "tags": a.tags,
                "confidence": a.confidence,
            })
        })
        .collect()
}

/// Build the surviving atoms from the reply. A returned id that matches an
/// input keeps that atom's provenance; new or repeated ids get a derived id.
fn merge_reply(category: &str, input: &[Atom], reply: Vec<ModelAtom>) -> Vec<Atom> {
    let by_id: HashMap<&str, &Atom> = input.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut used: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for (idx, model) in reply.into_iter().enumerate() {
        let original = model
            .id
            .as_deref()
            .and_then(|id| by_id.get(id).copied())
            .or_else(|| {
                model
                    .merged_from
                    .iter()
                    .find_map(|id| by_id.get(id.as_str()).copied())
            });
        let id = match model.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() && !used.contains(id) => id.to_string(),
            _ => format!("{}_m{}", input[0].id, idx + 1),
        };
        let Some(mut atom) = model.into_atom(id, original.map_or(0.5, |o| o.confidence)) else {
            continue;
        };
        if let Some(original) = original {
            atom.source = original.source;
            atom.source_file = original.source_file.clone();
            atom.source_timestamp = atom
                .source_timestamp
                .or_else(|| original.source_timestamp.clone());
            atom.gap_filled = original.gap_filled;
            atom.baseline_reference = original.baseline_reference.clone();
            atom.created_at = original.created_at;
            atom.category = original.category.clone();
            if atom.tags.is_empty() {
                atom.tags = original.tags.clone();
            }
        }
        if atom.category.trim().is_empty() {
            atom.category = category.to_string();
        }
        atom.merged_from.retain(|m| m != &atom.id);
        atom.status = AtomStatus::Deduplicated;
        used.insert(atom.id.clone());
        out.push(atom);
    }
    out
}
