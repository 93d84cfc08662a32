//! Core domain types for Skill Factory builds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SkillFactoryError};

/// Current schema version for the checkpoint (`state.json`) format.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// BuildId
// ---------------------------------------------------------------------------

/// Build identifier of the form `build_YYYYmmdd_HHMMSS_xxxxxx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub String);

impl BuildId {
    /// Generate a new identifier from the current time and a random suffix.
    pub fn new() -> Self {
        let uuid = Uuid::now_v7().simple().to_string();
        let suffix = &uuid[uuid.len() - 6..];
        Self(format!(
            "build_{}_{suffix}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// The six build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhaseId {
    #[serde(rename = "p0")]
    Baseline,
    #[serde(rename = "p1")]
    Audit,
    #[serde(rename = "p2")]
    Extract,
    #[serde(rename = "p3")]
    Dedup,
    #[serde(rename = "p4")]
    Verify,
    #[serde(rename = "p5")]
    Build,
}

impl PhaseId {
    pub const ALL: [PhaseId; 6] = [
        PhaseId::Baseline,
        PhaseId::Audit,
        PhaseId::Extract,
        PhaseId::Dedup,
        PhaseId::Verify,
        PhaseId::Build,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "p0",
            Self::Audit => "p1",
            Self::Extract => "p2",
            Self::Dedup => "p3",
            Self::Verify => "p4",
            Self::Build => "p5",
        }
    }

    /// Human-readable phase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Baseline => "Baseline",
            Self::Audit => "Audit",
            Self::Extract => "Extract",
            Self::Dedup => "Deduplicate",
            Self::Verify => "Verify",
            Self::Build => "Build",
        }
    }

    /// Whether the phase cannot run without a model client.
    /// Verify uses the model only for an optional review pass.
    pub fn requires_model(self) -> bool {
        matches!(self, Self::Audit | Self::Extract | Self::Dedup | Self::Build)
    }

    /// Position in [`PhaseId::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseId {
    type Err = SkillFactoryError;

    fn from_str(s: &str) -> Result<Self> {
        PhaseId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| SkillFactoryError::validation(format!("unknown phase '{s}'")))
    }
}

/// Terminal status of a single phase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Done,
    Failed,
    Skipped,
}

/// Result of one phase. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Phase quality score, 0–100.
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub item_count: usize,
    #[serde(default)]
    pub api_cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
    /// Artifact file names, relative to the output directory.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(serde_json::Value::as_f64)
    }

    pub fn metric_bool(&self, key: &str) -> bool {
        self.metrics
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Durable pipeline state, persisted as `state.json` after every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub build_id: BuildId,
    #[serde(default)]
    pub current_phase: Option<PhaseId>,
    #[serde(default)]
    pub phases: BTreeMap<PhaseId, PhaseResult>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    CHECKPOINT_SCHEMA_VERSION
}

impl PipelineState {
    /// Fresh state for a new build.
    pub fn new(build_id: BuildId) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            build_id,
            current_phase: None,
            phases: BTreeMap::new(),
            is_paused: false,
            pause_reason: None,
            total_cost_usd: 0.0,
            total_tokens: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn result(&self, phase: PhaseId) -> Option<&PhaseResult> {
        self.phases.get(&phase)
    }

    /// Recorded score for a phase that finished `done`.
    pub fn done_score(&self, phase: PhaseId) -> Option<f64> {
        self.phases
            .get(&phase)
            .filter(|r| r.status == PhaseStatus::Done)
            .map(|r| r.score)
    }

    /// Most recently executed phase result.
    pub fn latest(&self) -> Option<&PhaseResult> {
        self.current_phase.and_then(|p| self.phases.get(&p))
    }
}

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

/// Lifecycle status of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomStatus {
    #[default]
    Raw,
    Deduplicated,
    Verified,
    Unverified,
    Flagged,
    /// Not sampled for verification.
    Passthrough,
}

impl AtomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Deduplicated => "deduplicated",
            Self::Verified => "verified",
            Self::Unverified => "unverified",
            Self::Flagged => "flagged",
            Self::Passthrough => "passthrough",
        }
    }
}

/// Where an atom came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomSource {
    #[default]
    Transcript,
    Baseline,
}

/// A single, self-contained unit of extracted knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub status: AtomStatus,
    #[serde(default)]
    pub source: AtomSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<String>,
    /// Created from the baseline to fill a coverage gap.
    #[serde(default)]
    pub gap_filled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    /// Ids of atoms folded into this one during deduplication.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Atom {
    /// A raw transcript atom with neutral confidence.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            category: category.into(),
            tags: Vec::new(),
            confidence: 0.5,
            status: AtomStatus::Raw,
            source: AtomSource::Transcript,
            source_file: None,
            source_timestamp: None,
            gap_filled: false,
            baseline_reference: None,
            verification_note: None,
            evidence: None,
            merged_from: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Strength of an evidence match against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStrength {
    Strong,
    Weak,
    None,
}

/// Outcome of searching the baseline for support of a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub found: bool,
    pub strength: EvidenceStrength,
    /// Match score, 0–100.
    pub score: f64,
    pub matched_keywords: Vec<String>,
    pub total_keywords: usize,
    /// Best reference. When not found this is the closest one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Category of disagreement between two atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Contradiction,
    Outdated,
    Inconsistent,
    Other,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contradiction => "contradiction",
            Self::Outdated => "outdated",
            Self::Inconsistent => "inconsistent",
            Self::Other => "other",
        }
    }

    /// Lenient mapping from model-produced labels.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("contradict") {
            Self::Contradiction
        } else if label.contains("outdated") || label.contains("stale") {
            Self::Outdated
        } else if label.contains("inconsist") || label.contains("partial") {
            Self::Inconsistent
        } else {
            Self::Other
        }
    }
}

/// Snapshot of an atom as it was when a conflict was detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRef {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub source: AtomSource,
}

impl From<&Atom> for AtomRef {
    fn from(atom: &Atom) -> Self {
        Self {
            id: atom.id.clone(),
            title: atom.title.clone(),
            content: atom.content.clone(),
            confidence: atom.confidence,
            source: atom.source,
        }
    }
}

/// Resolution state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    Pending,
    KeepA,
    KeepB,
    Merge,
    Discard,
}

/// A detected contradiction between two atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub atom_a: AtomRef,
    pub atom_b: AtomRef,
    pub conflict_type: ConflictKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_evidence: Option<String>,
    #[serde(default)]
    pub auto_resolved: bool,
    #[serde(default)]
    pub resolution: ConflictResolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl Conflict {
    pub fn is_pending(&self) -> bool {
        self.resolution == ConflictResolution::Pending
    }
}

/// Human resolution action for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    KeepA,
    KeepB,
    Merge,
    Discard,
}

impl From<ResolutionAction> for ConflictResolution {
    fn from(action: ResolutionAction) -> Self {
        match action {
            ResolutionAction::KeepA => Self::KeepA,
            ResolutionAction::KeepB => Self::KeepB,
            ResolutionAction::Merge => Self::Merge,
            ResolutionAction::Discard => Self::Discard,
        }
    }
}

/// One entry of the resolutions input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_a_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_b_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
}

impl ResolutionRequest {
    pub fn new(action: ResolutionAction) -> Self {
        Self {
            action,
            atom_a_id: None,
            atom_b_id: None,
            merged_content: None,
        }
    }

    /// `merge` requires non-empty replacement content.
    pub fn validate(&self, conflict_id: &str) -> Result<()> {
        if self.action == ResolutionAction::Merge
            && self
                .merged_content
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(SkillFactoryError::validation(format!(
                "resolution for {conflict_id}: merge requires merged_content"
            )));
        }
        Ok(())
    }
}

/// Conflict id to resolution request.
pub type Resolutions = BTreeMap<String, ResolutionRequest>;

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// A read-only reference document used as the evidence oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineReference {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub tokens: usize,
}

impl BaselineReference {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            tokens: estimate_tokens(&content),
            content,
        }
    }
}

/// Rough token estimate used for budgeting (4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Output of the baseline phase (`baseline_summary.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineSummary {
    #[serde(default)]
    pub references: Vec<BaselineReference>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub total_tokens: usize,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Quality tiers
// ---------------------------------------------------------------------------

/// Build tier controlling how much of the atom set is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    Premium,
}

impl QualityTier {
    /// Fraction of atoms sampled for verification.
    pub fn sample_fraction(self) -> f64 {
        match self {
            Self::Draft => 0.3,
            Self::Standard => 0.6,
            Self::Premium => 1.0,
        }
    }
}

impl std::str::FromStr for QualityTier {
    type Err = SkillFactoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            other => Err(SkillFactoryError::validation(format!(
                "unknown quality tier '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Build registry
// ---------------------------------------------------------------------------

/// Overall status of a build as tracked in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = SkillFactoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SkillFactoryError::validation(format!(
                "unknown build status '{other}'"
            ))),
        }
    }
}

/// A registered build, stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub output_dir: String,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
