//! p5: write the skill: knowledge files, references, SKILL.md, metadata,
//! and the package.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use skillfactory_model::{ModelRequest, ModelSession};
use skillfactory_shared::{
    Atom, AtomStatus, BaselineReference, BuildConfig, PhaseId, Result, SkillFactoryError,
};
use tracing::{debug, instrument};

use super::verify::NOT_FOUND_NOTE;
use super::{Phase, PhaseContext, PhaseOutput};
use crate::artifacts::{
    self, ATOMS_VERIFIED_FILE, BuildMetadata, KNOWLEDGE_DIR, METADATA_FILE, PillarInfo,
    README_FILE, REFERENCES_DIR, SKILL_FILE, VerifiedFile,
};
use crate::dedup::group_by_category;
use crate::events::{PipelineEvent, QualityEvent};
use crate::packager::Packager;
use crate::scoring::{self, PhaseScores};
use crate::{prompts, taxonomy};

const MAX_ADVANCED: usize = 10;
const ADVANCED_CONFIDENCE: f64 = 0.9;

pub struct BuildPhase {
    packager: Box<dyn Packager>,
}

impl BuildPhase {
    pub fn new(packager: Box<dyn Packager>) -> Self {
        Self { packager }
    }
}

/// A knowledge pillar and the atoms written into it.
struct Pillar {
    name: String,
    file: String,
    atoms: Vec<Atom>,
}

#[async_trait]
impl Phase for BuildPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Build
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;
        let out = ctx.output_dir();
        let model = ctx.model(phase)?;
        let verified: VerifiedFile = artifacts::read_json(out, ATOMS_VERIFIED_FILE, phase)?;
        let baseline = ctx.baseline(phase)?;

        let total = verified.atoms.len();
        let usable: Vec<Atom> = verified
            .atoms
            .iter()
            .filter(|a| a.status != AtomStatus::Flagged)
            .cloned()
            .collect();
        let excluded = total - usable.len();
        if excluded > 0 {
            ctx.info(phase, &format!("{excluded} flagged atoms left out"));
        }

        let pillars: Vec<Pillar> = group_by_category(usable.clone())
            .into_iter()
            .map(|(name, atoms)| Pillar {
                file: format!("{}.md", slug(&name)),
                name,
                atoms,
            })
            .collect();

        let knowledge_dir = out.join(KNOWLEDGE_DIR);
        recreate_dir(&knowledge_dir)?;
        for (i, pillar) in pillars.iter().enumerate() {
            ctx.progress(
                phase,
                (i * 60 / pillars.len().max(1)) as u8,
                format!("writing knowledge/{}", pillar.file),
            );
            let markdown = knowledge_markdown(model, config, pillar).await?;
            ctx.report_cost().await;
            artifacts::write_atomic(&knowledge_dir.join(&pillar.file), markdown.as_bytes())?;
        }

        ctx.progress(phase, 65, "copying references");
        let references = copy_references(&out.join(REFERENCES_DIR), &baseline.references)?;

        ctx.progress(phase, 75, "writing SKILL.md");
        let skill = if references.is_empty() {
            let written = skill_markdown(model, config, &pillars).await?;
            ctx.report_cost().await;
            written
        } else {
            routing_skill(config, &pillars, &usable, &references)
        };
        artifacts::write_atomic(&out.join(SKILL_FILE), skill.as_bytes())?;

        let scores = PhaseScores {
            baseline: ctx.state.done_score(PhaseId::Baseline),
            audit: ctx.state.done_score(PhaseId::Audit),
            extract: ctx.state.done_score(PhaseId::Extract),
            dedup: ctx.state.done_score(PhaseId::Dedup),
            verify: ctx.state.done_score(PhaseId::Verify),
        };
        let evidence_rate = (verified.sampled > 0).then_some(verified.evidence_rate);
        let quality_score = scoring::final_score(&scores, evidence_rate);

        let phase_scores: BTreeMap<String, f64> = PhaseId::ALL
            .iter()
            .filter_map(|&p| ctx.state.done_score(p).map(|s| (p.as_str().to_string(), s)))
            .collect();
        let metadata = BuildMetadata {
            name: config.name.clone(),
            build_id: ctx.state.build_id.to_string(),
            domain: config.domain.clone(),
            language: config.language.clone(),
            quality_tier: config.quality_tier,
            quality_score,
            phase_scores,
            atoms_total: usable.len(),
            atoms_verified: verified.verified,
            pillars: pillars
                .iter()
                .map(|p| PillarInfo {
                    name: p.name.clone(),
                    file: format!("{KNOWLEDGE_DIR}/{}", p.file),
                    atoms: p.atoms.len(),
                })
                .collect(),
            references: references.clone(),
            total_cost_usd: ctx.state.total_cost_usd,
            total_tokens: ctx.state.total_tokens,
            built_at: Utc::now(),
        };
        artifacts::write_json(out, METADATA_FILE, &metadata)?;
        artifacts::write_atomic(&out.join(README_FILE), readme(&metadata).as_bytes())?;

        ctx.progress(phase, 90, "packaging");
        let package = self.packager.package(out)?;

        let extracted = ctx.state.result(PhaseId::Extract).map_or(0, |r| r.item_count);
        let deduplicated = ctx.state.result(PhaseId::Dedup).map_or(0, |r| r.item_count);
        let compression_ratio = if extracted == 0 {
            0.0
        } else {
            (deduplicated as f64 / extracted as f64 * 1000.0).round() / 1000.0
        };
        ctx.reporter.emit(PipelineEvent::Quality(QualityEvent::Report {
            quality_score,
            atoms_extracted: extracted,
            atoms_deduplicated: deduplicated,
            atoms_verified: verified.verified,
            compression_ratio,
        }));
        ctx.reporter.emit(PipelineEvent::Package {
            path: package.display().to_string(),
            output_dir: out.display().to_string(),
        });
        ctx.info(
            phase,
            &format!("skill built: {} pillars, quality {quality_score:.1}", pillars.len()),
        );

        Ok(PhaseOutput::new(quality_score, usable.len())
            .artifact(SKILL_FILE)
            .artifact(README_FILE)
            .artifact(METADATA_FILE)
            .artifact(KNOWLEDGE_DIR)
            .metric("pillars", pillars.len())
            .metric("references", references.len())
            .metric("excluded_flagged", excluded)
            .metric("compression_ratio", compression_ratio)
            .metric("package", package.display().to_string()))
    }
}

fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| SkillFactoryError::io(dir, e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| SkillFactoryError::io(dir, e))
}

/// Lowercase ASCII file stem. Non-alphanumerics collapse to `_`.
pub fn slug(name: &str) -> String {
    let mut out = String::new();
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "general".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Drop a surrounding ```markdown fence if the model added one anyway.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, b)| b);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

async fn knowledge_markdown(model: &ModelSession, config: &BuildConfig, pillar: &Pillar) -> Result<String> {
    let atoms_json = serde_json::to_string_pretty(&pillar.atoms).unwrap_or_default();
    let request = ModelRequest::new(
        prompts::KNOWLEDGE_SYSTEM,
        prompts::knowledge_user(&pillar.name, &atoms_json, &config.language, &config.domain),
    );
    match model.call(&request).await {
        Ok(text) if !strip_fences(&text).is_empty() => Ok(format!("{}\n", strip_fences(&text))),
        Ok(_) => {
            debug!(pillar = %pillar.name, "empty knowledge reply, using atom listing");
            Ok(fallback_knowledge(pillar))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!(pillar = %pillar.name, error = %e, "knowledge call failed, using atom listing");
            Ok(fallback_knowledge(pillar))
        }
    }
}

fn fallback_knowledge(pillar: &Pillar) -> String {
    let mut md = format!("# {}\n", title_case(&pillar.name));
    for atom in &pillar.atoms {
        let _ = write!(md, "\n## {}\n\n{}\n", atom.title, atom.content);
        if !atom.tags.is_empty() {
            let _ = writeln!(md, "\n*Tags: {}*", atom.tags.join(", "));
        }
    }
    md
}

fn title_case(name: &str) -> String {
    name.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars
                .next()
                .map(|c| c.to_uppercase().chain(chars).collect::<String>())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Copy each reference to `references/`, keeping its relative path but
/// never escaping the directory. Returns the written paths.
fn copy_references(dir: &Path, references: &[BaselineReference]) -> Result<Vec<String>> {
    recreate_dir(dir)?;
    let mut written = Vec::new();
    for (i, reference) in references.iter().enumerate() {
        let mut rel = safe_relative(&reference.path).unwrap_or_else(|| PathBuf::from(format!("reference_{:03}", i + 1)));
        if rel.extension().is_none() {
            rel.set_extension("md");
        }
        let target = dir.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SkillFactoryError::io(parent, e))?;
        }
        artifacts::write_atomic(&target, reference.content.as_bytes())?;
        written.push(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        );
    }
    Ok(written)
}

/// Relative path made of normal components only; URLs keep their host and path.
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let raw = raw
        .split_once("://")
        .map_or(raw, |(_, rest)| rest)
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let path: PathBuf = Path::new(raw)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => {
                let cleaned: String = part
                    .to_string_lossy()
                    .chars()
                    .map(|c| if c.is_alphanumeric() || "._-".contains(c) { c } else { '_' })
                    .collect();
                (!cleaned.is_empty() && cleaned != "." && cleaned != "..").then_some(cleaned)
            }
            _ => None,
        })
        .collect();
    (path.components().count() > 0).then_some(path)
}

async fn skill_markdown(model: &ModelSession, config: &BuildConfig, pillars: &[Pillar]) -> Result<String> {
    let listing: String = pillars
        .iter()
        .map(|p| format!("- {KNOWLEDGE_DIR}/{}: {} ({} atoms)\n", p.file, p.name, p.atoms.len()))
        .collect();
    let request = ModelRequest::new(
        prompts::SKILL_SYSTEM,
        prompts::skill_user(&config.name, &config.domain, &config.language, &listing),
    );
    match model.call(&request).await {
        Ok(text) if !strip_fences(&text).is_empty() => Ok(format!("{}\n", strip_fences(&text))),
        Err(e) if e.is_fatal() => Err(e),
        other => {
            if let Err(e) = other {
                debug!(error = %e, "SKILL.md call failed, writing it from the pillar list");
            }
            Ok(fallback_skill(config, pillars))
        }
    }
}

fn front_matter(config: &BuildConfig) -> String {
    let domain = taxonomy::normalize_domain(&config.domain);
    format!(
        "---\nname: {}\ndescription: Expert knowledge for {} ({domain}), built from transcripts and reference documentation.\nlanguage: {}\n---\n\n",
        slug(&config.name).replace('_', "-"),
        config.name,
        config.language
    )
}

fn pillar_lines(md: &mut String, pillars: &[Pillar]) {
    for p in pillars {
        let _ = writeln!(
            md,
            "- **{}**: `{KNOWLEDGE_DIR}/{}` ({} atoms)",
            title_case(&p.name),
            p.file,
            p.atoms.len()
        );
    }
}

fn fallback_skill(config: &BuildConfig, pillars: &[Pillar]) -> String {
    let mut md = front_matter(config);
    let _ = writeln!(md, "# {}\n\n## Knowledge Pillars\n", config.name);
    pillar_lines(&mut md, pillars);
    md
}

/// SKILL.md as a routing document over references and knowledge files.
fn routing_skill(config: &BuildConfig, pillars: &[Pillar], atoms: &[Atom], references: &[String]) -> String {
    let mut md = front_matter(config);
    let _ = writeln!(md, "# {}\n", config.name);

    md.push_str("## Routing Logic\n\n");
    md.push_str("### Reference Docs\n\nFor platform rules, definitions and official procedures, read:\n\n");
    for r in references {
        let _ = writeln!(md, "- `{REFERENCES_DIR}/{r}`");
    }
    md.push_str("\n### Knowledge Files\n\nFor practitioner strategy and field experience, read:\n\n");
    for p in pillars {
        let _ = writeln!(md, "- `{KNOWLEDGE_DIR}/{}`: {}", p.file, title_case(&p.name));
    }

    md.push_str("\n## Knowledge Pillars\n\n");
    pillar_lines(&mut md, pillars);

    let tips: Vec<&Atom> = atoms
        .iter()
        .filter(|a| {
            a.status == AtomStatus::Unverified && a.verification_note.as_deref() == Some(NOT_FOUND_NOTE)
        })
        .collect();
    if !tips.is_empty() {
        md.push_str("\n## Expert Tips\n\nNot covered by the reference docs:\n\n");
        for a in tips {
            let _ = writeln!(md, "- **{}**: {}", a.title, first_sentence(&a.content));
        }
    }

    let mut advanced: Vec<&Atom> = atoms
        .iter()
        .filter(|a| a.status == AtomStatus::Verified && a.confidence >= ADVANCED_CONFIDENCE)
        .collect();
    advanced.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    if !advanced.is_empty() {
        md.push_str("\n## Advanced Strategies\n\n");
        for a in advanced.into_iter().take(MAX_ADVANCED) {
            let _ = writeln!(md, "- **{}**: {}", a.title, first_sentence(&a.content));
        }
    }

    md.push_str("\n## References\n\n");
    for r in references {
        let _ = writeln!(md, "- [{r}]({REFERENCES_DIR}/{r})");
    }
    md
}

fn first_sentence(text: &str) -> &str {
    text.find(". ").map_or(text, |i| &text[..=i])
}

fn readme(meta: &BuildMetadata) -> String {
    let mut md = format!(
        "# {}\n\nBuild `{}` ({} tier), quality score **{:.1}**/100.\n\n",
        meta.name,
        meta.build_id,
        serde_json::to_value(meta.quality_tier)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        meta.quality_score
    );
    md.push_str("| Phase | Score |\n|---|---|\n");
    for (phase, score) in &meta.phase_scores {
        let _ = writeln!(md, "| {phase} | {score:.1} |");
    }
    let _ = write!(
        md,
        "\n{} atoms ({} verified) across {} knowledge files and {} references.\n\n\
         Start with `{SKILL_FILE}`.\n",
        meta.atoms_total,
        meta.atoms_verified,
        meta.pillars.len(),
        meta.references.len()
    );
    md
}
