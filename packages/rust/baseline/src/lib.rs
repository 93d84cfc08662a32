//! Baseline reference loading for Skill Factory.
//!
//! Turns the manifest's baseline sources (local directories, prebuilt JSON,
//! web pages) into [`BaselineReference`]s. Per-source failures are logged and
//! skipped; the references are a read-only evidence oracle downstream.

pub mod convert;
pub mod fetch;
pub mod local;

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use skillfactory_shared::{BaselineFetchConfig, BaselineReference, BaselineSource, Result};

pub use convert::html_to_markdown;
pub use fetch::Fetcher;
pub use local::{load_directory, load_prebuilt};

/// Everything loaded from the configured sources.
#[derive(Debug, Clone, Default)]
pub struct LoadedBaseline {
    pub references: Vec<BaselineReference>,
    pub topics: Vec<String>,
    /// Labels of sources that loaded successfully.
    pub sources: Vec<String>,
    /// `label: error` for sources that failed.
    pub failures: Vec<String>,
}

/// Loads baseline sources in order.
pub struct BaselineLoader {
    fetcher: Fetcher,
}

impl BaselineLoader {
    pub fn new(config: &BaselineFetchConfig) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(config)?,
        })
    }

    pub fn with_fetcher(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    pub async fn load(&self, sources: &[BaselineSource]) -> LoadedBaseline {
        let mut loaded = LoadedBaseline::default();
        let mut declared_topics = Vec::new();

        for source in sources {
            let label = source.label();
            let result = match source {
                BaselineSource::Directory { path } => load_directory(path),
                BaselineSource::Prebuilt { path } => load_prebuilt(path).map(|(refs, topics)| {
                    declared_topics.extend(topics);
                    refs
                }),
                BaselineSource::Url { url } => self.fetcher.fetch(url).await.map(|r| vec![r]),
            };

            match result {
                Ok(refs) => {
                    tracing::info!(source = %label, count = refs.len(), "baseline source loaded");
                    loaded.references.extend(refs);
                    loaded.sources.push(label);
                }
                Err(e) => {
                    tracing::warn!(source = %label, error = %e, "baseline source failed, skipping");
                    loaded.failures.push(format!("{label}: {e}"));
                }
            }
        }

        loaded.topics = collect_topics(&loaded.references, declared_topics);
        loaded
    }
}

/// Unique topics from `#`..`###` headings plus any declared topics,
/// case-insensitively deduplicated, in first-seen order.
pub fn collect_topics(references: &[BaselineReference], declared: Vec<String>) -> Vec<String> {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#{1,3}\s+(.+?)\s*#*\s*$").expect("valid regex"));

    let mut seen = HashSet::new();
    let mut topics = Vec::new();
    let headings = references
        .iter()
        .flat_map(|r| HEADING_RE.captures_iter(&r.content).map(|c| c[1].to_string()));

    for topic in declared.into_iter().chain(headings) {
        let topic = topic.trim().to_string();
        if !topic.is_empty() && seen.insert(topic.to_lowercase()) {
            topics.push(topic);
        }
    }
    topics
}
