//! p1: catalogue transcript topics and set them against the baseline.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Deserialize;
use skillfactory_model::ModelRequest;
use skillfactory_shared::{BaselineReference, PhaseId, Result};
use tracing::instrument;

use super::{CHUNK_OVERLAP_TOKENS, CHUNK_TOKENS, Phase, PhaseContext, PhaseOutput, read_transcripts};
use crate::artifacts::{self, CoverageMatrix, Depth, INVENTORY_FILE, Inventory, Topic};
use crate::atoms::parse_items;
use crate::text::{chunk_text, keyword_set, top_keywords};
use crate::{prompts, scoring, taxonomy};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTopic {
    topic: String,
    category: String,
    quality_score: Option<f64>,
    mentions: Option<u32>,
    summary: String,
    depth: String,
}

pub struct AuditPhase;

#[async_trait]
impl Phase for AuditPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Audit
    }

    #[instrument(skip_all, fields(transcripts = ctx.config.transcripts.len()))]
    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let phase = self.id();
        let config = ctx.config;
        let model = ctx.model(phase)?;
        let transcripts = read_transcripts(ctx, phase)?;
        let baseline = ctx.baseline(phase)?;
        let categories = taxonomy::categories(&config.domain);

        let chunked: Vec<(&str, Vec<String>)> = transcripts
            .iter()
            .map(|t| (t.name.as_str(), chunk_text(&t.text, CHUNK_TOKENS, CHUNK_OVERLAP_TOKENS)))
            .collect();
        let total_chunks: usize = chunked.iter().map(|(_, c)| c.len()).sum();

        let mut topics: Vec<Topic> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut failed_chunks = 0usize;
        let mut done = 0usize;

        for (source, chunks) in &chunked {
            for (i, chunk) in chunks.iter().enumerate() {
                done += 1;
                ctx.progress(
                    phase,
                    (done * 90 / total_chunks.max(1)) as u8,
                    format!("auditing {source} chunk {}/{}", i + 1, chunks.len()),
                );
                let request = ModelRequest::new(
                    prompts::AUDIT_SYSTEM,
                    prompts::audit_user(chunk, i + 1, chunks.len(), source, &config.language, &config.domain, categories),
                );
                let reply = match model.call_json(&request).await {
                    Ok(v) => v,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        failed_chunks += 1;
                        ctx.warn(phase, &format!("audit of {source} chunk {} failed: {e}", i + 1));
                        continue;
                    }
                };
                ctx.report_cost().await;
                for found in parse_items::<ModelTopic>(&reply, "topics") {
                    merge_topic(&mut topics, &mut index, found, source);
                }
            }
        }

        if topics.is_empty() {
            ctx.warn(phase, "no topics found in any transcript");
        }

        let coverage = (!baseline.references.is_empty())
            .then(|| coverage_matrix(&topics, &baseline.references, &baseline.topics));
        let score = scoring::audit_score(&topics, transcripts.len(), coverage.as_ref());
        let gaps = coverage.as_ref().map_or(0, |c| c.gap_to_fill.len());

        let inventory = Inventory {
            total_topics: topics.len(),
            topics,
            score,
            coverage,
        };
        artifacts::write_json(ctx.output_dir(), INVENTORY_FILE, &inventory)?;
        ctx.info(
            phase,
            &format!("{} topics from {} chunks, {gaps} baseline gaps", inventory.total_topics, total_chunks),
        );

        Ok(PhaseOutput::new(score, inventory.total_topics)
            .artifact(INVENTORY_FILE)
            .metric("chunks", total_chunks)
            .metric("failed_chunks", failed_chunks)
            .metric("gap_topics", gaps))
    }
}

/// Fold a topic into the inventory, matching names case-insensitively.
fn merge_topic(topics: &mut Vec<Topic>, index: &mut HashMap<String, usize>, found: ModelTopic, source: &str) {
    let name = found.topic.trim();
    if name.is_empty() {
        return;
    }
    let quality = found.quality_score.unwrap_or(50.0).clamp(0.0, 100.0);
    let mentions = found.mentions.unwrap_or(1).max(1);

    match index.get(&name.to_lowercase()) {
        Some(&i) => {
            let topic = &mut topics[i];
            topic.mentions += mentions;
            topic.quality_score = topic.quality_score.max(quality);
            if !topic.source_files.iter().any(|s| s == source) {
                topic.source_files.push(source.to_string());
            }
            if topic.summary.is_empty() {
                topic.summary = found.summary;
            }
        }
        None => {
            index.insert(name.to_lowercase(), topics.len());
            topics.push(Topic {
                topic: name.to_string(),
                category: found.category.trim().to_string(),
                quality_score: quality,
                mentions,
                summary: found.summary,
                depth: Depth::from_label(&found.depth),
                source_files: vec![source.to_string()],
            });
        }
    }
}

/// Classify transcript topics as overlapping the baseline or unique to the
/// expert, and find baseline topics the transcripts miss.
pub fn coverage_matrix(
    topics: &[Topic],
    references: &[BaselineReference],
    baseline_topics: &[String],
) -> CoverageMatrix {
    let lowered: Vec<String> = references.iter().map(|r| r.content.to_lowercase()).collect();
    let mut matrix = CoverageMatrix::default();

    for topic in topics {
        let keywords = top_keywords(&format!("{} {}", topic.topic, topic.summary), 8);
        let covered = lowered
            .iter()
            .any(|content| keywords.iter().filter(|k| content.contains(k.as_str())).count() >= 2);
        if covered {
            matrix.overlap.push(topic.topic.clone());
        } else {
            matrix.unique_expert.push(topic.topic.clone());
        }
    }

    let transcript_keywords: Vec<BTreeSet<String>> = topics
        .iter()
        .map(|t| keyword_set(&format!("{} {}", t.topic, t.summary)))
        .collect();
    for baseline_topic in baseline_topics {
        let keywords = top_keywords(baseline_topic, 5);
        if keywords.is_empty() {
            continue;
        }
        let touched = transcript_keywords
            .iter()
            .any(|set| keywords.iter().filter(|k| set.contains(*k)).count() >= 2);
        if !touched {
            matrix.gap_to_fill.push(baseline_topic.clone());
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::SilentReporter;
    use crate::phases::fixtures;
    use crate::phases::BaselinePhase;
    use crate::testing::ScriptedModel;

    fn topic(name: &str, summary: &str) -> Topic {
        Topic {
            topic: name.into(),
            category: "strategy".into(),
            quality_score: 80.0,
            mentions: 1,
            summary: summary.into(),
            depth: Depth::Deep,
            source_files: vec![],
        }
    }

    #[test]
    fn coverage_classification() {
        let refs = vec![BaselineReference::new(
            "bidding.md",
            "Target CPA bidding needs fifty conversions per week before automated bidding stabilises.",
        )];
        let topics = vec![
            topic("Target CPA bidding", "When automated bidding stabilises"),
            topic("Creator partnerships", "Working with influencers on whitelisted posts"),
        ];
        let baseline_topics = vec![
            "Automated bidding strategies".to_string(),
            "Merchant center feed rules".to_string(),
        ];
        let matrix = coverage_matrix(&topics, &refs, &baseline_topics);
        assert_eq!(matrix.overlap, vec!["Target CPA bidding".to_string()]);
        assert_eq!(matrix.unique_expert, vec!["Creator partnerships".to_string()]);
        assert_eq!(matrix.gap_to_fill, vec!["Merchant center feed rules".to_string()]);
    }

    #[test]
    fn topics_merge_case_insensitively() {
        let mut topics = Vec::new();
        let mut index = HashMap::new();
        let t = |name: &str, q: f64, m: u32| ModelTopic {
            topic: name.into(),
            category: "tools".into(),
            quality_score: Some(q),
            mentions: Some(m),
            summary: String::new(),
            depth: "deep".into(),
        };
        merge_topic(&mut topics, &mut index, t("Pixel Setup", 60.0, 2), "a.txt");
        merge_topic(&mut topics, &mut index, t("pixel setup", 85.0, 3), "b.txt");
        merge_topic(&mut topics, &mut index, t("  ", 99.0, 1), "b.txt");
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].mentions, 5);
        assert_eq!(topics[0].quality_score, 85.0);
        assert_eq!(topics[0].source_files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn unreadable_transcript_is_skipped() {
        let dir = fixtures::temp_dir("p1");
        let transcript = dir.join("talk.txt");
        std::fs::write(&transcript, "We covered bidding in depth today and how to read the auction insights report.").unwrap();
        let mut config = fixtures::config(dir.join("out"));
        config.transcripts = vec![transcript, dir.join("missing.txt")];
        let state = fixtures::state();

        let model = ScriptedModel::new(vec![
            json!({"topics": [
                {"topic": "Bidding", "category": "strategy", "quality_score": 80, "mentions": 2, "summary": "s", "depth": "deep"},
                {"topic": "Auction insights", "category": "tools", "quality_score": 70, "mentions": 1, "summary": "s", "depth": "moderate"}
            ]})
            .to_string(),
        ]);
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        BaselinePhase.run(&ctx).await.unwrap();
        let out = AuditPhase.run(&ctx).await.unwrap();
        assert_eq!(out.item_count, 2);
        assert_eq!(model.calls(), 1);

        let inventory: Inventory =
            artifacts::read_json(&config.output_dir, INVENTORY_FILE, PhaseId::Extract).unwrap();
        assert!(inventory.coverage.is_none());
        assert_eq!(inventory.topics[0].depth, Depth::Deep);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn no_transcripts_is_phase_error() {
        let dir = fixtures::temp_dir("p1-none");
        let config = fixtures::config(dir.clone());
        let state = fixtures::state();
        let model = ScriptedModel::new(vec![]);
        let session = model.session();
        let ctx = PhaseContext {
            config: &config,
            state: &state,
            model: Some(&session),
            reporter: &SilentReporter,
        };
        let err = AuditPhase.run(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("no readable transcripts"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
