//! Packaging of the finished skill directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skillfactory_shared::{Result, SkillFactoryError};
use tracing::{debug, info, instrument};

use crate::artifacts::{
    self, KNOWLEDGE_DIR, METADATA_FILE, README_FILE, REFERENCES_DIR, SKILL_FILE,
};

pub const PACKAGE_DIR: &str = "package";
pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// Turns a built output directory into a distributable package.
pub trait Packager: Send + Sync {
    /// Package `output_dir` and return the package location.
    fn package(&self, output_dir: &Path) -> Result<PathBuf>;
}

/// One packaged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagedFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub files: Vec<PackagedFile>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Copies the deliverables into `<output>/package/` with a checksum
/// manifest. The package directory is rebuilt from scratch every time.
pub struct DirectoryPackager;

impl Packager for DirectoryPackager {
    #[instrument(skip_all, fields(output_dir = %output_dir.display()))]
    fn package(&self, output_dir: &Path) -> Result<PathBuf> {
        let package_dir = output_dir.join(PACKAGE_DIR);
        if package_dir.exists() {
            std::fs::remove_dir_all(&package_dir)
                .map_err(|e| SkillFactoryError::io(&package_dir, e))?;
        }
        std::fs::create_dir_all(&package_dir).map_err(|e| SkillFactoryError::io(&package_dir, e))?;

        let mut files = Vec::new();
        for name in [SKILL_FILE, README_FILE, METADATA_FILE] {
            let source = output_dir.join(name);
            if source.is_file() {
                files.push(copy_file(&source, &package_dir, Path::new(name))?);
            }
        }
        for dir in [KNOWLEDGE_DIR, REFERENCES_DIR] {
            let source = output_dir.join(dir);
            if source.is_dir() {
                copy_tree(&source, &package_dir, Path::new(dir), &mut files)?;
            }
        }

        let manifest = PackageManifest {
            files,
            created_at: chrono::Utc::now(),
        };
        artifacts::write_json(&package_dir, MANIFEST_FILE, &manifest)?;
        info!(files = manifest.files.len(), "package written");
        Ok(package_dir)
    }
}

fn copy_tree(source: &Path, package_dir: &Path, relative: &Path, files: &mut Vec<PackagedFile>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(source)
        .map_err(|e| SkillFactoryError::io(source, e))?
        .filter_map(std::result::Result::ok)
        .collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let rel = relative.join(entry.file_name());
        if path.is_dir() {
            copy_tree(&path, package_dir, &rel, files)?;
        } else {
            files.push(copy_file(&path, package_dir, &rel)?);
        }
    }
    Ok(())
}

fn copy_file(source: &Path, package_dir: &Path, relative: &Path) -> Result<PackagedFile> {
    let bytes = std::fs::read(source).map_err(|e| SkillFactoryError::io(source, e))?;
    let target = package_dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SkillFactoryError::io(parent, e))?;
    }
    std::fs::write(&target, &bytes).map_err(|e| SkillFactoryError::io(&target, e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = format!("{:x}", hasher.finalize());
    let path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    debug!(file = %path, size = bytes.len(), "packaged");
    Ok(PackagedFile {
        path,
        size: bytes.len() as u64,
        sha256,
    })
}
