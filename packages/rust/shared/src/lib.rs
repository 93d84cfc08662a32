//! Shared types, error model, and configuration for Skill Factory.
//!
//! This crate is the foundation depended on by all other Skill Factory crates.
//! It provides:
//! - [`SkillFactoryError`] — the unified error type
//! - Domain types ([`Atom`], [`Conflict`], [`PipelineState`], [`PhaseResult`])
//! - Configuration ([`AppConfig`], [`BuildManifest`], [`BuildConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BUILD_CONFIG_FILE, BaselineFetchConfig, BaselineSource, BuildConfig,
    BuildManifest, DefaultsConfig, ModelConfig, QualityConfig, config_dir, config_file_path,
    database_path, expand_home, init_config, load_config, load_config_from, slugify,
    validate_api_key,
};
pub use error::{Result, SkillFactoryError};
pub use types::{
    Atom, AtomRef, AtomSource, AtomStatus, BaselineReference, BaselineSummary, BuildId,
    BuildRecord, BuildStatus, CHECKPOINT_SCHEMA_VERSION, Conflict, ConflictKind,
    ConflictResolution, Evidence, EvidenceStrength, PhaseId, PhaseResult, PhaseStatus,
    PipelineState, QualityTier, ResolutionAction, ResolutionRequest, Resolutions,
    estimate_tokens,
};
