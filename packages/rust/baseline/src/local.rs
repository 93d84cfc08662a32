//! Local baseline sources: reference directories and prebuilt JSON.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use skillfactory_shared::{BaselineReference, Result, SkillFactoryError};

use crate::convert::html_to_markdown;

const TEXT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];
const HTML_EXTENSIONS: &[&str] = &["html", "htm"];

/// Load every text/Markdown/HTML file under `dir`, recursively, sorted by
/// path. Reference paths are relative to `dir`.
pub fn load_directory(dir: &Path) -> Result<Vec<BaselineReference>> {
    if !dir.is_dir() {
        return Err(SkillFactoryError::validation(format!(
            "baseline directory {} does not exist",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut references = Vec::new();
    for path in files {
        let ext = extension(&path);
        let raw = std::fs::read_to_string(&path).map_err(|e| SkillFactoryError::io(&path, e))?;
        let content = if HTML_EXTENSIONS.contains(&ext.as_str()) {
            html_to_markdown(&raw, None)?
        } else {
            raw
        };
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "skipping empty reference");
            continue;
        }

        let rel = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        references.push(BaselineReference::new(rel, content));
    }

    tracing::info!(dir = %dir.display(), count = references.len(), "loaded baseline directory");
    Ok(references)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| SkillFactoryError::io(dir, e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            let ext = extension(&path);
            if TEXT_EXTENSIONS.contains(&ext.as_str()) || HTML_EXTENSIONS.contains(&ext.as_str())
            {
                out.push(path);
            }
        }
    }
    Ok(())
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct PrebuiltFile {
    #[serde(default)]
    references: Vec<PrebuiltReference>,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct PrebuiltReference {
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tokens: Option<usize>,
}

/// Load a prebuilt baseline JSON file. Returns references plus any topics
/// it declares. References with empty content are dropped.
pub fn load_prebuilt(path: &Path) -> Result<(Vec<BaselineReference>, Vec<String>)> {
    let raw = std::fs::read_to_string(path).map_err(|e| SkillFactoryError::io(path, e))?;
    let file: PrebuiltFile = serde_json::from_str(&raw).map_err(|e| {
        SkillFactoryError::parse(format!("invalid prebuilt baseline {}: {e}", path.display()))
    })?;

    let references = file
        .references
        .into_iter()
        .filter(|r| !r.content.trim().is_empty())
        .map(|r| {
            let mut reference = BaselineReference::new(r.path, r.content);
            if let Some(tokens) = r.tokens {
                reference.tokens = tokens;
            }
            reference
        })
        .collect();

    Ok((references, file.topics))
}
