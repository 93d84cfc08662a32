//! p2: turn transcripts into atoms and fill baseline gaps.

use async_trait::async_trait;
use skillfactory_model::ModelRequest;
use skillfactory_shared::{Atom, AtomSource, BaselineReference, PhaseId, Result, SkillFactoryError};
use tracing::instrument;

use super::{CHUNK_OVERLAP_TOKENS, CHUNK_TOKENS, Phase, PhaseContext, PhaseOutput, read_transcripts};
use crate::artifacts::{self, ATOMS_RAW_FILE, INVENTORY_FILE, Inventory, RawAtomsFile};
use crate::atoms::{ModelAtom, atom_id, parse_items};
use crate::evidence::snippet_around;
use crate::text::{chunk_text, top_keywords, truncate_chars};
use crate::{prompts, scoring, taxonomy};

const TRANSCRIPT_CONFIDENCE: f64 = 0.5;
const GAP_FILL_CONFIDENCE: f64 = 0.85;
/// Gap-fill atoms across all gap topics.
pub const MAX_GAP_ATOMS: usize = 10;
/// Chars either side of the first keyword hit in a gap-fill excerpt.
const EXCERPT_RADIUS: usize = 6000;

pub struct ExtractPhase;

#[async_trait]
impl Phase for ExtractPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Extract
    }

    #[instrument(skip_all)]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;
        let model = ctx.model(phase)?;
        let transcripts = read_transcripts(ctx, phase)?;
        let inventory: Inventory = artifacts::read_json(ctx.output_dir(), INVENTORY_FILE, phase)?;
        let baseline = ctx.baseline(phase)?;
        let categories = taxonomy::categories(&config.domain);

        let mut atoms: Vec<Atom> = Vec::new();
        let mut failed_chunks = 0usize;

        // transcript stream
        let chunked: Vec<(&str, Vec<String>)> = transcripts
            .iter()
            .map(|t| (t.name.as_str(), chunk_text(&t.text, CHUNK_TOKENS, CHUNK_OVERLAP_TOKENS)))
            .collect();
        let total_chunks: usize = chunked.iter().map(|(_, c)| c.len()).sum();
        let mut done = 0usize;
        for (source, chunks) in &chunked {
            for (i, chunk) in chunks.iter().enumerate() {
                done += 1;
                ctx.progress(
                    phase,
                    (done * 80 / total_chunks.max(1)) as u8,
                    format!("extracting {source} chunk {}/{}", i + 1, chunks.len()),
                );
                let request = ModelRequest::new(
                    prompts::EXTRACT_SYSTEM,
                    prompts::extract_user(chunk, i + 1, chunks.len(), source, &config.language, &config.domain, categories),
                );
                let reply = match model.call_json(&request).await {
                    Ok(v) => v,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        failed_chunks += 1;
                        ctx.warn(phase, &format!("extraction of {source} chunk {} failed: {e}", i + 1));
                        continue;
                    }
                };
                ctx.report_cost().await;
                for item in parse_items::<ModelAtom>(&reply, "atoms") {
                    if let Some(mut atom) = item.into_atom(atom_id(atoms.len() + 1), TRANSCRIPT_CONFIDENCE) {
                        atom.source_file = Some(source.to_string());
                        atoms.push(atom);
                    }
                }
            }
        }
        let transcript_atoms = atoms.len();

        // gap-fill stream
        let gaps = inventory.coverage.map(|c| c.gap_to_fill).unwrap_or_default();
        let mut gap_atoms = 0usize;
        for topic in &gaps {
            if gap_atoms >= MAX_GAP_ATOMS {
                break;
            }
            let Some((reference, excerpt)) = gap_excerpt(topic, &baseline.references) else {
                ctx.warn(phase, &format!("no reference mentions gap topic '{topic}'"));
                continue;
            };
            ctx.progress(phase, 90, format!("filling gap: {topic}"));
            let request = ModelRequest::new(
                prompts::GAP_FILL_SYSTEM,
                prompts::gap_fill_user(topic, &reference.path, &excerpt, &config.language, MAX_GAP_ATOMS - gap_atoms),
            );
            let reply = match model.call_json(&request).await {
                Ok(v) => v,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    ctx.warn(phase, &format!("gap fill for '{topic}' failed: {e}"));
                    continue;
                }
            };
            ctx.report_cost().await;
            for item in parse_items::<ModelAtom>(&reply, "atoms") {
                if gap_atoms >= MAX_GAP_ATOMS {
                    break;
                }
                if let Some(mut atom) = item.into_atom(atom_id(atoms.len() + 1), GAP_FILL_CONFIDENCE) {
                    atom.source = AtomSource::Baseline;
                    atom.gap_filled = true;
                    atom.baseline_reference = Some(reference.path.clone());
                    atoms.push(atom);
                    gap_atoms += 1;
                }
            }
        }

        if atoms.is_empty() {
            return Err(SkillFactoryError::phase(phase.as_str(), "no atoms extracted"));
        }

        let score = scoring::extraction_score(&atoms);
        let file = RawAtomsFile {
            total_atoms: atoms.len(),
            atoms,
            score,
        };
        artifacts::write_json(ctx.output_dir(), ATOMS_RAW_FILE, &file)?;
        ctx.info(
            phase,
            &format!("{transcript_atoms} transcript atoms, {gap_atoms} gap-fill atoms"),
        );

        Ok(PhaseOutput::new(score, file.total_atoms)
            .artifact(ATOMS_RAW_FILE)
            .metric("transcript_atoms", transcript_atoms)
            .metric("gap_fill_atoms", gap_atoms)
            .metric("failed_chunks", failed_chunks))
    }
}

/// The reference mentioning most of the topic's keywords, and an excerpt
/// centred on the first keyword it contains.
fn gap_excerpt<'a>(topic: &str, references: &'a [BaselineReference]) -> Option<(&'a BaselineReference, String)> {
    let keywords = top_keywords(topic, 5);
    let (reference, hits) = references
        .iter()
        .map(|r| {
            let lowered = r.content.to_lowercase();
            let hits = keywords.iter().filter(|k| lowered.contains(k.as_str())).count();
            (r, hits)
        })
        .max_by_key(|(_, hits)| *hits)?;
    if hits == 0 {
        return None;
    }
    let excerpt = keywords
        .iter()
        .find_map(|k| snippet_around(&reference.content, k, EXCERPT_RADIUS))
        .unwrap_or_else(|| truncate_chars(&reference.content, EXCERPT_RADIUS * 2).to_string());
    Some((reference, excerpt))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillfactory_shared::{AtomStatus, BaselineSummary};

    use super::*;
    use crate::artifacts::{BASELINE_SUMMARY_FILE, CoverageMatrix};
    use crate::events::SilentReporter;
    use crate::phases::fixtures;
    use crate::prompts::GAP_FILL_SYSTEM;
    use crate::testing::ScriptedModel;

    fn setup(label: &str, gaps: Vec<String>) -> (std::path::PathBuf, skillfactory_shared::BuildConfig) {
        let dir = fixtures::temp_dir(label);
        let transcript = dir.join("talk.txt");
        std::fs::write(&transcript, "Bid caps stop runaway spend on broad audiences during the learning phase.").unwrap();
        let mut config = fixtures::config(dir.join("out"));
        config.transcripts = vec![transcript];

        let summary = BaselineSummary {
            references: vec![BaselineReference::new(
                "catalog.md",
                "Catalog feeds must refresh daily. Product sets group catalog items for dynamic ads.",
            )],
            ..BaselineSummary::default()
        };
        artifacts::write_json(&config.output_dir, BASELINE_SUMMARY_FILE, &summary).unwrap();
        let inventory = Inventory {
            coverage: Some(CoverageMatrix {
                gap_to_fill: gaps,
                ..CoverageMatrix::default()
            }),
            ..Inventory::default()
        };
        artifacts::write_json(&config.output_dir, INVENTORY_FILE, &inventory).unwrap();
        (dir, config)
    }

    #[tokio::test]
    async fn both_streams_produce_sequential_atoms() {
        let (dir, config) = setup("p2", vec!["Catalog product sets".into()]);
        let state = fixtures::state();
        let model = ScriptedModel::responding(|req| {
            if req.system == GAP_FILL_SYSTEM {
                json!({"atoms": [{"title": "Product sets for dynamic ads", "content": "Group catalog items into product sets.", "category": "catalog"}]})
            } else {
                json!({"atoms": [
                    {"title": "Cap bids on broad audiences", "content": "Use bid caps while the ad set is learning.", "tags": ["bidding"], "confidence": 0.9},
                    {"title": "Dropped", "content": ""}
                ]})
            }
            .to_string()
        });
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        let out = ExtractPhase.run(&ctx).await.unwrap();
        assert_eq!(out.item_count, 2);

        let raw: RawAtomsFile = artifacts::read_json(&config.output_dir, ATOMS_RAW_FILE, PhaseId::Dedup).unwrap();
        assert_eq!(raw.atoms[0].id, "atom_0001");
        assert_eq!(raw.atoms[0].source_file.as_deref(), Some("talk.txt"));
        assert_eq!(raw.atoms[0].status, AtomStatus::Raw);
        let gap = &raw.atoms[1];
        assert_eq!(gap.id, "atom_0002");
        assert!(gap.gap_filled);
        assert_eq!(gap.source, AtomSource::Baseline);
        assert_eq!(gap.confidence, 0.85);
        assert_eq!(gap.baseline_reference.as_deref(), Some("catalog.md"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn nothing_extracted_is_phase_error() {
        let (dir, config) = setup("p2-empty", vec![]);
        let state = fixtures::state();
        let model = ScriptedModel::new(vec![json!({"atoms": []}).to_string()]);
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        let err = ExtractPhase.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("no atoms extracted"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn gap_excerpt_picks_reference_with_most_keywords() {
        let refs = vec![
            BaselineReference::new("a.md", "Pixel events fire on page load."),
            BaselineReference::new("b.md", "Conversions API sends server events. Deduplicate pixel and server events."),
        ];
        let (reference, excerpt) = gap_excerpt("Server events conversions", &refs).unwrap();
        assert_eq!(reference.path, "b.md");
        assert!(excerpt.contains("Conversions API"));
        assert!(gap_excerpt("Shopping feeds", &refs).is_none());
    }
}
