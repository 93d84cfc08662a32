//! Keyword-overlap evidence search against the baseline references.

use skillfactory_shared::{BaselineReference, Evidence, EvidenceStrength};

use crate::text::top_keywords;

/// Keywords extracted per claim.
pub const MAX_KEYWORDS: usize = 10;
/// Minimum score for a claim to count as supported.
pub const WEAK_THRESHOLD: f64 = 40.0;
/// Score at which support is reported as strong.
pub const STRONG_THRESHOLD: f64 = 70.0;
/// Characters kept either side of the first keyword hit.
pub const SNIPPET_RADIUS: usize = 200;

/// Search the references for support of a claim.
///
/// The best-scoring reference is always reported, found or not. An empty
/// result is a valid outcome and never an error.
pub fn search(title: &str, content: &str, references: &[BaselineReference]) -> Evidence {
    let keywords = top_keywords(&format!("{title} {content}"), MAX_KEYWORDS);
    if keywords.is_empty() || references.is_empty() {
        return Evidence {
            found: false,
            strength: EvidenceStrength::None,
            score: 0.0,
            matched_keywords: Vec::new(),
            total_keywords: keywords.len(),
            reference: None,
            snippet: None,
        };
    }

    let mut best: Option<(usize, f64, Vec<String>)> = None;
    for (idx, reference) in references.iter().enumerate() {
        let lower = reference.content.to_lowercase();
        let matched: Vec<String> = keywords
            .iter()
            .filter(|kw| lower.contains(kw.as_str()))
            .cloned()
            .collect();
        let score = match_score(matched.len(), keywords.len());
        if best.as_ref().is_none_or(|(_, s, _)| score > *s) {
            best = Some((idx, score, matched));
        }
    }

    let Some((idx, score, matched)) = best else {
        return Evidence {
            found: false,
            strength: EvidenceStrength::None,
            score: 0.0,
            matched_keywords: Vec::new(),
            total_keywords: keywords.len(),
            reference: None,
            snippet: None,
        };
    };
    let reference = &references[idx];
    let strength = strength_for(score);
    let found = strength != EvidenceStrength::None;
    let snippet = if found {
        matched
            .first()
            .and_then(|kw| snippet_around(&reference.content, kw, SNIPPET_RADIUS))
    } else {
        None
    };

    Evidence {
        found,
        strength,
        score,
        matched_keywords: matched,
        total_keywords: keywords.len(),
        reference: Some(reference.path.clone()),
        snippet,
    }
}

/// Percentage of keywords present, rounded to one decimal.
pub fn match_score(matched: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (matched as f64 / total as f64 * 1000.0).round() / 10.0
}

pub fn strength_for(score: f64) -> EvidenceStrength {
    if score >= STRONG_THRESHOLD {
        EvidenceStrength::Strong
    } else if score >= WEAK_THRESHOLD {
        EvidenceStrength::Weak
    } else {
        EvidenceStrength::None
    }
}

/// Window of `radius` chars either side of the first case-insensitive hit of
/// `keyword`, with `...` where the text was cut.
pub fn snippet_around(text: &str, keyword: &str, radius: usize) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let lowered: Vec<char> = chars
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect();
    let needle: Vec<char> = keyword.to_lowercase().chars().collect();
    if needle.is_empty() || needle.len() > lowered.len() {
        return None;
    }
    let pos = lowered.windows(needle.len()).position(|w| w == needle.as_slice())?;

    let start = pos.saturating_sub(radius);
    let end = (pos + needle.len() + radius).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect::<String>().trim().to_string();
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}
