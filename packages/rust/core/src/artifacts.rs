//! Phase artifact files. Later phases and the resume path read these as
//! their only source of truth.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skillfactory_shared::{Atom, Conflict, PhaseId, QualityTier, Result, SkillFactoryError};

pub const BASELINE_SUMMARY_FILE: &str = "baseline_summary.json";
pub const INVENTORY_FILE: &str = "inventory.json";
pub const ATOMS_RAW_FILE: &str = "atoms_raw.json";
pub const ATOMS_DEDUP_FILE: &str = "atoms_deduplicated.json";
pub const CONFLICTS_FILE: &str = "conflicts.json";
pub const ATOMS_VERIFIED_FILE: &str = "atoms_verified.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const SKILL_FILE: &str = "SKILL.md";
pub const README_FILE: &str = "README.md";
pub const KNOWLEDGE_DIR: &str = "knowledge";
pub const REFERENCES_DIR: &str = "references";

/// Write bytes via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SkillFactoryError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp, contents).map_err(|e| SkillFactoryError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| SkillFactoryError::io(path, e))?;
    Ok(())
}

/// Pretty-print `data` to `dir/name`.
pub fn write_json<T: Serialize>(dir: &Path, name: &str, data: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| SkillFactoryError::parse(format!("failed to serialize {name}: {e}")))?;
    let path = dir.join(name);
    write_atomic(&path, json.as_bytes())?;
    Ok(path)
}

/// Read an upstream artifact. A missing or unreadable file is a phase error
/// for `phase`, the consumer.
pub fn read_json<T: DeserializeOwned>(dir: &Path, name: &str, phase: PhaseId) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(SkillFactoryError::phase(
            phase.as_str(),
            format!("missing upstream artifact {name}"),
        ));
    }
    let content =
        std::fs::read_to_string(&path).map_err(|e| SkillFactoryError::io(&path, e))?;
    serde_json::from_str(&content).map_err(|e| {
        SkillFactoryError::phase(phase.as_str(), format!("invalid artifact {name}: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// How deeply a transcript treats a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Deep,
    Moderate,
    #[default]
    Surface,
    MentionOnly,
}

impl Depth {
    /// Unknown labels count as surface coverage.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "deep" | "advanced" | "expert" => Self::Deep,
            "moderate" | "medium" => Self::Moderate,
            "mention_only" | "mention" => Self::MentionOnly,
            _ => Self::Surface,
        }
    }
}

/// A topic found in the transcripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub mentions: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub depth: Depth,
    #[serde(default)]
    pub source_files: Vec<String>,
}

/// Transcript topics set against the baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageMatrix {
    /// Transcript topics also covered by the baseline.
    #[serde(default)]
    pub overlap: Vec<String>,
    /// Transcript topics absent from the baseline.
    #[serde(default)]
    pub unique_expert: Vec<String>,
    /// Baseline topics the transcripts never touch.
    #[serde(default)]
    pub gap_to_fill: Vec<String>,
}

impl CoverageMatrix {
    /// (overlap, unique, gap) ratios over all classified topics.
    pub fn ratios(&self) -> (f64, f64, f64) {
        let total = self.overlap.len() + self.unique_expert.len() + self.gap_to_fill.len();
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let t = total as f64;
        (
            self.overlap.len() as f64 / t,
            self.unique_expert.len() as f64 / t,
            self.gap_to_fill.len() as f64 / t,
        )
    }
}

/// `inventory.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub topics: Vec<Topic>,
    pub total_topics: usize,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageMatrix>,
}

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

/// `atoms_raw.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAtomsFile {
    pub atoms: Vec<Atom>,
    pub total_atoms: usize,
    #[serde(default)]
    pub score: f64,
}

/// Outcome of the transcript-vs-baseline pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSourceStats {
    pub duplicates_merged: usize,
    pub contradictions_flagged: usize,
    pub outdated_replaced: usize,
    pub total_actions: usize,
}

/// `atoms_deduplicated.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupFile {
    pub atoms: Vec<Atom>,
    pub total_atoms: usize,
    #[serde(default)]
    pub input_atoms: usize,
    #[serde(default)]
    pub duplicates_merged: usize,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_source: Option<CrossSourceStats>,
}

impl DedupFile {
    /// Keep `total_atoms` in step after the atom list is edited.
    pub fn refresh_counts(&mut self) {
        self.total_atoms = self.atoms.len();
    }
}

/// `conflicts.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictsFile {
    pub conflicts: Vec<Conflict>,
    pub total: usize,
    pub unresolved: usize,
    pub auto_resolved: usize,
}

impl ConflictsFile {
    pub fn new(conflicts: Vec<Conflict>) -> Self {
        let mut file = Self {
            conflicts,
            ..Self::default()
        };
        file.refresh_counts();
        file
    }

    pub fn refresh_counts(&mut self) {
        self.total = self.conflicts.len();
        self.unresolved = self.conflicts.iter().filter(|c| c.is_pending()).count();
        self.auto_resolved = self.conflicts.iter().filter(|c| c.auto_resolved).count();
    }

    pub fn pending(&self) -> Vec<Conflict> {
        self.conflicts.iter().filter(|c| c.is_pending()).cloned().collect()
    }
}

/// `atoms_verified.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifiedFile {
    pub atoms: Vec<Atom>,
    pub total_atoms: usize,
    pub sampled: usize,
    pub verified: usize,
    pub unverified: usize,
    pub flagged: usize,
    pub passthrough: usize,
    pub evidence_rate: f64,
    pub score: f64,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// One knowledge file of the finished skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PillarInfo {
    pub name: String,
    pub file: String,
    pub atoms: usize,
}

/// `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub name: String,
    pub build_id: String,
    pub domain: String,
    pub language: String,
    pub quality_tier: QualityTier,
    pub quality_score: f64,
    pub phase_scores: BTreeMap<String, f64>,
    pub atoms_total: usize,
    pub atoms_verified: usize,
    pub pillars: Vec<PillarInfo>,
    pub references: Vec<String>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub built_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use skillfactory_shared::{AtomRef, ConflictKind, ConflictResolution};
    use uuid::Uuid;

    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sf-artifacts-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn json_roundtrip_leaves_no_temp_files() {
        let dir = temp_dir();
        let file = RawAtomsFile {
            atoms: vec![Atom::new("atom_0001", "Title", "Body text.", "tools")],
            total_atoms: 1,
            score: 88.0,
        };
        write_json(&dir, ATOMS_RAW_FILE, &file).unwrap();
        let back: RawAtomsFile = read_json(&dir, ATOMS_RAW_FILE, PhaseId::Dedup).unwrap();
        assert_eq!(back.atoms[0].id, "atom_0001");

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_artifact_is_phase_error() {
        let dir = temp_dir();
        let err = read_json::<DedupFile>(&dir, ATOMS_DEDUP_FILE, PhaseId::Verify).unwrap_err();
        assert!(err.to_string().contains("phase p4 failed"));
        assert!(err.to_string().contains(ATOMS_DEDUP_FILE));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn conflict_counts() {
        let a = Atom::new("atom_0001", "A", "Always do X.", "tools");
        let b = Atom::new("atom_0002", "B", "Never do X.", "tools");
        let pending = Conflict {
            id: "conflict_001".into(),
            atom_a: AtomRef::from(&a),
            atom_b: AtomRef::from(&b),
            conflict_type: ConflictKind::Contradiction,
            description: "opposite advice".into(),
            baseline_evidence: None,
            auto_resolved: false,
            resolution: ConflictResolution::Pending,
            resolution_note: None,
        };
        let mut auto = pending.clone();
        auto.id = "conflict_002".into();
        auto.auto_resolved = true;
        auto.resolution = ConflictResolution::KeepA;

        let file = ConflictsFile::new(vec![pending, auto]);
        assert_eq!((file.total, file.unresolved, file.auto_resolved), (2, 1, 1));
        assert_eq!(file.pending()[0].id, "conflict_001");
    }

    #[test]
    fn depth_labels_are_lenient() {
        assert_eq!(Depth::from_label("Deep"), Depth::Deep);
        assert_eq!(Depth::from_label("mention only"), Depth::MentionOnly);
        assert_eq!(Depth::from_label("?"), Depth::Surface);
    }
}
