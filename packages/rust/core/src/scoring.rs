//! Per-phase quality scores (0–100) and the final weighted score.
//!
//! Every score is derived from checkable signals. Model self-reported
//! confidence never feeds a score directly.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use skillfactory_shared::{Atom, BaselineReference};

use crate::artifacts::{CoverageMatrix, Depth, Topic};

static LONG_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w{4,}\b").expect("valid regex"));

static DOMAIN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w{3,}\b").expect("valid regex"));

const GENERIC_WORDS: &[&str] = &[
    "the", "and", "for", "this", "with", "that", "from", "your", "các", "của", "cho", "với",
    "trong", "được", "không", "một",
];

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn clamp_score(v: f64) -> f64 {
    round1(v.clamp(0.0, 100.0))
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Depth 40%, diversity 30%, relevance 30%.
pub fn baseline_score(references: &[BaselineReference], domain: &str, topics: &[String]) -> f64 {
    if references.is_empty() {
        return 30.0;
    }

    let depth: f64 = references
        .iter()
        .map(|r| match r.content.split_whitespace().count() {
            200..=5000 => 1.0,
            50..=199 => 0.5,
            n if n > 5000 => 0.7,
            _ => 0.1,
        })
        .sum::<f64>()
        / references.len() as f64
        * 100.0;

    let per_ref: Vec<BTreeSet<String>> = references
        .iter()
        .map(|r| top_long_words(&r.content, 20))
        .collect();
    let diversity = if per_ref.len() >= 2 {
        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..per_ref.len() {
            for j in i + 1..per_ref.len() {
                let (a, b) = (&per_ref[i], &per_ref[j]);
                if a.is_empty() || b.is_empty() {
                    continue;
                }
                total += a.intersection(b).count() as f64 / a.len().min(b.len()) as f64;
                pairs += 1;
            }
        }
        (1.0 - total / pairs.max(1) as f64) * 100.0
    } else {
        0.0
    };

    let mut domain_words: BTreeSet<String> = DOMAIN_WORD_RE
        .find_iter(&domain.to_lowercase().replace(['-', '_'], " "))
        .map(|m| m.as_str().to_string())
        .collect();
    for topic in topics.iter().take(10) {
        domain_words.extend(
            DOMAIN_WORD_RE
                .find_iter(&topic.to_lowercase())
                .map(|m| m.as_str().to_string()),
        );
    }
    domain_words.retain(|w| !GENERIC_WORDS.contains(&w.as_str()));

    let relevance = if domain_words.is_empty() {
        50.0
    } else {
        let matching = references
            .iter()
            .filter(|r| {
                let lower = r.content.to_lowercase();
                domain_words.iter().filter(|w| lower.contains(w.as_str())).count() >= 2
            })
            .count();
        matching as f64 / references.len() as f64 * 100.0
    };

    clamp_score(depth * 0.40 + diversity * 0.30 + relevance * 0.30)
}

fn top_long_words(text: &str, max: usize) -> BTreeSet<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, m) in LONG_WORD_RE.find_iter(&text.to_lowercase()).enumerate() {
        let w = m.as_str();
        if w.chars().all(|c| c.is_ascii_digit()) || w.chars().count() > 30 {
            continue;
        }
        counts.entry(w.to_string()).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked.into_iter().take(max).map(|(w, _)| w).collect()
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Topic density 30%, depth distribution 25%, category coverage 20%,
/// coverage balance 25%.
pub fn audit_score(topics: &[Topic], transcripts: usize, coverage: Option<&CoverageMatrix>) -> f64 {
    if topics.is_empty() {
        return 0.0;
    }

    let per_transcript = topics.len() as f64 / transcripts.max(1) as f64;
    let density = if (8.0..=25.0).contains(&per_transcript) {
        100.0
    } else if per_transcript < 8.0 {
        (per_transcript / 8.0 * 100.0).max(40.0)
    } else {
        (100.0 - (per_transcript - 25.0) * 2.0).max(70.0)
    };

    let total = topics.len() as f64;
    let share = |d: Depth| topics.iter().filter(|t| t.depth == d).count() as f64 / total;
    let depth = (share(Depth::Deep).min(0.4) / 0.4 * 40.0
        + share(Depth::Moderate).min(0.4) / 0.4 * 35.0
        + (1.0 - share(Depth::MentionOnly).min(0.3)) / 0.7 * 25.0)
        .min(100.0);

    let categories: BTreeSet<&str> = topics
        .iter()
        .map(|t| t.category.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let category = match categories.len() {
        0 => 20.0,
        1 => 40.0,
        2 => 60.0,
        3 | 4 => 80.0,
        _ => 100.0,
    };

    let balance = match coverage {
        Some(matrix) => coverage_balance(matrix),
        None => 50.0,
    };

    clamp_score(density * 0.30 + depth * 0.25 + category * 0.20 + balance * 0.25)
}

fn band_points(ratio: f64, lo: f64, hi: f64, points: f64, center: f64, slope: f64) -> f64 {
    if (lo..=hi).contains(&ratio) {
        points
    } else {
        (points - (ratio - center).abs() * slope).max(0.0)
    }
}

/// A baseline that mostly misses the transcripts (gap ratio > 0.5) halves
/// the balance score.
pub fn coverage_balance(matrix: &CoverageMatrix) -> f64 {
    let (overlap, unique, gap) = matrix.ratios();
    let mut score = band_points(overlap, 0.15, 0.50, 35.0, 0.30, 80.0)
        + band_points(unique, 0.25, 0.60, 35.0, 0.40, 70.0)
        + band_points(gap, 0.05, 0.35, 30.0, 0.20, 60.0);
    if gap > 0.5 {
        score *= 0.5;
    }
    score
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Heuristic: content that stops mid-sentence.
pub fn looks_truncated(content: &str) -> bool {
    let trimmed = content.trim_end();
    if trimmed.is_empty() || trimmed.ends_with("...") || trimmed.ends_with('…') {
        return true;
    }
    let Some(last) = trimmed.chars().last() else {
        return true;
    };
    if ".!?)]\"'”’`*:;。".contains(last) {
        return false;
    }
    // list items and code blocks end without punctuation
    let last_line = trimmed.lines().last().unwrap_or_default().trim_start();
    !(last_line.starts_with("- ")
        || last_line.starts_with("* ")
        || last_line.starts_with("```")
        || last_line
            .split_once(". ")
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())))
}

pub fn is_poor_title(title: &str) -> bool {
    let title = title.trim();
    let len = title.chars().count();
    title.is_empty() || title.eq_ignore_ascii_case("untitled") || !(4..=120).contains(&len)
}

/// 100 minus weighted shares of structural problems.
pub fn extraction_score(atoms: &[Atom]) -> f64 {
    if atoms.is_empty() {
        return 0.0;
    }
    let n = atoms.len() as f64;
    let share = |pred: &dyn Fn(&Atom) -> bool| atoms.iter().filter(|a| pred(a)).count() as f64 / n;

    let penalty = 30.0 * share(&|a| a.content.trim().chars().count() < 80)
        + 10.0 * share(&|a| a.content.chars().count() > 2000)
        + 20.0 * share(&|a| a.tags.is_empty())
        + 20.0 * share(&|a| is_poor_title(&a.title))
        + 10.0 * share(&|a| a.category.trim().is_empty())
        + 10.0 * share(&|a| looks_truncated(&a.content));
    clamp_score(100.0 - penalty)
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Acceptable kept-ratio band for `n` input atoms. Larger sets are expected
/// to compress further.
pub fn ideal_band(n: usize) -> (f64, f64) {
    if n < 20 {
        (0.70, 0.95)
    } else if n < 100 {
        (0.60, 0.90)
    } else {
        (0.50, 0.85)
    }
}

/// Kept-ratio band score minus integrity penalties.
pub fn dedup_score(input_count: usize, kept: &[Atom]) -> f64 {
    if input_count == 0 {
        return 0.0;
    }
    let ratio = kept.len() as f64 / input_count as f64;
    let (lo, hi) = ideal_band(input_count);
    let mut score = if ratio > hi {
        100.0 - (ratio - hi) * 100.0
    } else if ratio < lo {
        100.0 - (lo - ratio) * 200.0
    } else {
        100.0
    };

    if !kept.is_empty() {
        let n = kept.len() as f64;
        let missing_category =
            kept.iter().filter(|a| a.category.trim().is_empty()).count() as f64 / n;
        let truncated = kept.iter().filter(|a| looks_truncated(&a.content)).count() as f64 / n;
        score -= 15.0 * missing_category + 15.0 * truncated;
    }
    clamp_score(score)
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Driven by the evidence rate of the sampled atoms.
pub fn verification_score(sampled: usize, found: usize, flagged: usize) -> f64 {
    if sampled == 0 {
        return 0.0;
    }
    let evidence_rate = found as f64 / sampled as f64;
    let flagged_rate = flagged as f64 / sampled as f64;
    clamp_score(20.0 + 80.0 * evidence_rate - 20.0 * flagged_rate)
}

// ---------------------------------------------------------------------------
// Final
// ---------------------------------------------------------------------------

/// Recorded scores of the scored phases. `None` for a phase that has no
/// `done` result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseScores {
    pub baseline: Option<f64>,
    pub audit: Option<f64>,
    pub extract: Option<f64>,
    pub dedup: Option<f64>,
    pub verify: Option<f64>,
}

pub const BASELINE_CAP_THRESHOLD: f64 = 50.0;
pub const BASELINE_CAP: f64 = 60.0;
pub const LOW_EVIDENCE_RATE: f64 = 0.5;
pub const LOW_EVIDENCE_PENALTY: f64 = 0.8;

/// Weighted combination normalised over the phases that have scores, with
/// the low-evidence penalty and the weak-baseline cap applied last.
pub fn final_score(scores: &PhaseScores, evidence_rate: Option<f64>) -> f64 {
    let weighted = [
        (scores.baseline, 0.15),
        (scores.audit, 0.10),
        (scores.extract, 0.20),
        (scores.dedup, 0.20),
        (scores.verify, 0.35),
    ];
    let (sum, weight) = weighted
        .iter()
        .filter_map(|(s, w)| s.map(|s| (s.clamp(0.0, 100.0) * w, *w)))
        .fold((0.0, 0.0), |(acc, tw), (v, w)| (acc + v, tw + w));
    if weight == 0.0 {
        return 0.0;
    }

    let mut score = sum / weight;
    if evidence_rate.is_some_and(|r| r < LOW_EVIDENCE_RATE) {
        score *= LOW_EVIDENCE_PENALTY;
    }
    if scores.baseline.is_some_and(|b| b < BASELINE_CAP_THRESHOLD) {
        score = score.min(BASELINE_CAP);
    }
    clamp_score(score)
}
