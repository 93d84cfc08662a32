//! Application configuration for Skill Factory.
//!
//! User config lives at `~/.skillfactory/skillfactory.toml`.
//! A build manifest (TOML) describes a single build; CLI flags override
//! manifest values, which override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkillFactoryError};
use crate::types::QualityTier;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "skillfactory.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".skillfactory";

/// Registry database file name inside the config directory.
const DB_FILE_NAME: &str = "skillfactory.db";

/// Snapshot of the resolved build config inside the output directory.
pub const BUILD_CONFIG_FILE: &str = "build.json";

// ---------------------------------------------------------------------------
// Config structs (matching skillfactory.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Language model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Quality gates and thresholds.
    #[serde(default)]
    pub quality: QualityConfig,

    /// Baseline fetch policy.
    #[serde(default)]
    pub baseline: BaselineFetchConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Parent directory for build outputs.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub quality_tier: QualityTier,

    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            language: default_language(),
            quality_tier: QualityTier::default(),
            domain: default_domain(),
        }
    }
}

fn default_output_dir() -> String {
    "~/skillfactory-builds".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_domain() -> String {
    "custom".into()
}

/// `[model]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for audit, extraction and build.
    #[serde(default = "default_model")]
    pub model: String,

    /// Cheaper model used for deduplication.
    #[serde(default = "default_light_model")]
    pub light_model: String,

    /// Total attempts for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive billing errors before the run is aborted.
    #[serde(default = "default_max_credit_errors")]
    pub max_credit_errors: u32,

    #[serde(default = "default_true")]
    pub cache_responses: bool,

    /// Hours a cached response stays valid.
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            light_model: default_light_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_credit_errors: default_max_credit_errors(),
            cache_responses: true,
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_light_model() -> String {
    "claude-haiku-4-5-20251001".into()
}
fn default_cache_ttl_hours() -> u64 {
    168
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_credit_errors() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// `[quality]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Phase score below which a warning is logged.
    #[serde(default = "default_min_phase_score")]
    pub min_phase_score: f64,

    /// Evidence confidence a conflict side needs to win automatically.
    #[serde(default = "default_auto_resolve")]
    pub auto_resolve_threshold: f64,

    /// Similarity threshold for model merges before size adaptation.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_base_threshold: f64,

    /// Keyword-overlap threshold for transcript vs baseline duplicates.
    #[serde(default = "default_cross_threshold")]
    pub cross_source_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_phase_score: default_min_phase_score(),
            auto_resolve_threshold: default_auto_resolve(),
            dedup_base_threshold: default_dedup_threshold(),
            cross_source_threshold: default_cross_threshold(),
        }
    }
}

fn default_min_phase_score() -> f64 {
    70.0
}
fn default_auto_resolve() -> f64 {
    0.8
}
fn default_dedup_threshold() -> f64 {
    0.8
}
fn default_cross_threshold() -> f64 {
    0.6
}

/// `[baseline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineFetchConfig {
    /// Minimum ms between web fetches.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,

    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

impl Default for BaselineFetchConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: default_rate_limit(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_rate_limit() -> u64 {
    6000
}
fn default_fetch_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Build manifest
// ---------------------------------------------------------------------------

/// A baseline source declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BaselineSource {
    /// Local directory of Markdown/text/HTML references.
    Directory { path: PathBuf },
    /// JSON file with pre-collected references.
    Prebuilt { path: PathBuf },
    /// Single web page.
    Url { url: String },
}

impl BaselineSource {
    pub fn label(&self) -> String {
        match self {
            Self::Directory { path } => format!("directory:{}", path.display()),
            Self::Prebuilt { path } => format!("prebuilt:{}", path.display()),
            Self::Url { url } => format!("url:{url}"),
        }
    }
}

/// The build manifest passed to `skillfactory build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub quality_tier: Option<QualityTier>,
    /// Transcript files or directories.
    #[serde(default)]
    pub transcripts: Vec<PathBuf>,
    #[serde(default)]
    pub baseline: Vec<BaselineSource>,
    #[serde(default)]
    pub sample_seed: Option<u64>,
}

impl BuildManifest {
    /// Load a manifest from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SkillFactoryError::io(path, e))?;
        toml::from_str(&content).map_err(|e| {
            SkillFactoryError::config(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

// ---------------------------------------------------------------------------
// Build config (runtime, merged from config + manifest + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime build configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub name: String,
    pub domain: String,
    pub language: String,
    pub quality_tier: QualityTier,
    pub output_dir: PathBuf,
    /// Transcript files, directories already expanded.
    pub transcripts: Vec<PathBuf>,
    pub baseline: Vec<BaselineSource>,
    #[serde(default)]
    pub sample_seed: Option<u64>,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub fetch: BaselineFetchConfig,
}

impl BuildConfig {
    /// Merge the app config with a manifest. Relative manifest paths resolve
    /// against `manifest_dir`.
    pub fn from_manifest(
        app: &AppConfig,
        manifest: BuildManifest,
        manifest_dir: &Path,
        output_override: Option<PathBuf>,
    ) -> Result<Self> {
        if manifest.name.trim().is_empty() {
            return Err(SkillFactoryError::validation("manifest name is empty"));
        }

        let output_dir = match output_override {
            Some(dir) => dir,
            None => expand_home(&app.defaults.output_dir).join(slugify(&manifest.name)),
        };

        let mut transcripts = Vec::new();
        for entry in &manifest.transcripts {
            let path = resolve_relative(manifest_dir, entry);
            transcripts.extend(expand_transcripts(&path)?);
        }

        let baseline = manifest
            .baseline
            .into_iter()
            .map(|source| match source {
                BaselineSource::Directory { path } => BaselineSource::Directory {
                    path: resolve_relative(manifest_dir, &path),
                },
                BaselineSource::Prebuilt { path } => BaselineSource::Prebuilt {
                    path: resolve_relative(manifest_dir, &path),
                },
                url @ BaselineSource::Url { .. } => url,
            })
            .collect();

        Ok(Self {
            name: manifest.name,
            domain: manifest.domain.unwrap_or_else(|| app.defaults.domain.clone()),
            language: manifest
                .language
                .unwrap_or_else(|| app.defaults.language.clone()),
            quality_tier: manifest.quality_tier.unwrap_or(app.defaults.quality_tier),
            output_dir,
            transcripts,
            baseline,
            sample_seed: manifest.sample_seed,
            quality: app.quality.clone(),
            fetch: app.baseline.clone(),
        })
    }

    /// Persist this config to `<output_dir>/build.json`.
    pub fn save(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| SkillFactoryError::io(&self.output_dir, e))?;
        let path = self.output_dir.join(BUILD_CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SkillFactoryError::parse(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| SkillFactoryError::io(&path, e))?;
        Ok(path)
    }

    /// Load the snapshot written by [`BuildConfig::save`].
    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(BUILD_CONFIG_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|e| SkillFactoryError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            SkillFactoryError::parse(format!("invalid {}: {e}", path.display()))
        })
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Expand a transcript entry: files pass through, directories yield their
/// `.txt`/`.md` files in sorted order.
fn expand_transcripts(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = std::fs::read_dir(path).map_err(|e| SkillFactoryError::io(path, e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "txt" | "md"))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

/// Lowercase, dash-separated directory name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.skillfactory/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SkillFactoryError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.skillfactory/skillfactory.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path to the build registry database.
pub fn database_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(DB_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SkillFactoryError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        SkillFactoryError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SkillFactoryError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SkillFactoryError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SkillFactoryError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the model API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.model.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(SkillFactoryError::config(format!(
            "model API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.model.max_credit_errors, 3);
        assert_eq!(parsed.quality.auto_resolve_threshold, 0.8);
        assert_eq!(parsed.baseline.rate_limit_ms, 6000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
quality_tier = "premium"

[quality]
min_phase_score = 60
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.quality_tier, QualityTier::Premium);
        assert_eq!(config.defaults.language, "en");
        assert_eq!(config.quality.min_phase_score, 60.0);
        assert_eq!(config.quality.dedup_base_threshold, 0.8);
    }

    #[test]
    fn manifest_resolves_paths_and_overrides() {
        let dir = std::env::temp_dir().join(format!("sf_manifest_{}", uuid::Uuid::now_v7()));
        let transcripts = dir.join("talks");
        std::fs::create_dir_all(&transcripts).unwrap();
        std::fs::write(transcripts.join("b.txt"), "second").unwrap();
        std::fs::write(transcripts.join("a.md"), "first").unwrap();
        std::fs::write(transcripts.join("notes.pdf"), "skip").unwrap();

        let manifest: BuildManifest = toml::from_str(
            r#"
name = "Pricing Strategy"
domain = "saas"
transcripts = ["talks"]

[[baseline]]
kind = "directory"
path = "docs"

[[baseline]]
kind = "url"
url = "https://example.com/guide"
"#,
        )
        .expect("parse manifest");

        let app = AppConfig::default();
        let config = BuildConfig::from_manifest(&app, manifest, &dir, Some(dir.join("out")))
            .expect("build config");

        assert_eq!(config.domain, "saas");
        assert_eq!(config.language, "en");
        assert_eq!(config.quality_tier, QualityTier::Standard);
        assert_eq!(
            config.transcripts,
            vec![transcripts.join("a.md"), transcripts.join("b.txt")]
        );
        assert_eq!(
            config.baseline[0],
            BaselineSource::Directory {
                path: dir.join("docs")
            }
        );
        assert_eq!(config.output_dir, dir.join("out"));

        config.save().expect("save snapshot");
        let loaded = BuildConfig::load(&dir.join("out")).expect("load snapshot");
        assert_eq!(loaded, config);
    }

    #[test]
    fn default_output_dir_uses_slug() {
        let manifest: BuildManifest = toml::from_str("name = \"My Skill: v2\"").unwrap();
        let config =
            BuildConfig::from_manifest(&AppConfig::default(), manifest, Path::new("/tmp"), None)
                .unwrap();
        assert!(config.output_dir.ends_with("my-skill-v2"));
    }

    #[test]
    fn empty_manifest_name_rejected() {
        let manifest: BuildManifest = toml::from_str("name = \"  \"").unwrap();
        let result =
            BuildConfig::from_manifest(&AppConfig::default(), manifest, Path::new("/tmp"), None);
        assert!(result.is_err());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.model.api_key_env = "SF_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
