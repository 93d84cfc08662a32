//! Keyword extraction and transcript chunking shared by several phases.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

/// Words ignored by keyword extraction (English and Vietnamese).
pub const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "are", "was", "were", "been", "have",
    "has", "will", "can", "not", "but", "use", "you", "than", "into", "your", "they", "their",
    "its", "our", "also", "when", "then", "there", "which", "what", "about", "more", "most",
    "một", "của", "cho", "với", "trong", "khi", "để", "từ", "các", "có", "được", "không",
    "này", "đó", "về", "theo", "như", "cũng", "hoặc", "nếu", "thì", "hay", "bởi",
];

/// Negation markers used to spot contradicting claims.
pub const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "none", "without", "cannot", "can't", "don't", "doesn't", "isn't",
    "aren't", "won't", "shouldn't", "không", "chưa", "chẳng", "không nên", "không thể",
    "đừng", "thiếu",
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w{3,}\b").expect("valid regex"));

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w']+").expect("valid regex"));

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?%?").expect("valid regex"));

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("valid regex"));

fn candidate_words(text: &str) -> impl Iterator<Item = String> + '_ {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()) && !w.chars().all(|c| c.is_ascii_digit()))
}

/// Top `max` keywords by frequency. Ties keep first-occurrence order.
pub fn top_keywords(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, word) in candidate_words(text).enumerate() {
        counts.entry(word).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(String, usize, usize)> =
        counts.into_iter().map(|(w, (n, first))| (w, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(max).map(|(w, _, _)| w).collect()
}

/// Distinct keywords of a text.
pub fn keyword_set(text: &str) -> BTreeSet<String> {
    candidate_words(text).collect()
}

/// |A ∩ B| / min(|A|, |B|); 0 when either side is empty.
pub fn keyword_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

/// Whether the text contains a negation marker (word match, or substring
/// for multi-word markers).
pub fn has_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    let tokens: BTreeSet<&str> = TOKEN_RE.find_iter(&lower).map(|m| m.as_str()).collect();
    NEGATION_WORDS.iter().any(|neg| {
        if neg.contains(' ') {
            lower.contains(neg)
        } else {
            tokens.contains(neg)
        }
    })
}

/// Numbers (with optional decimals and percent sign) mentioned in the text.
pub fn numbers(text: &str) -> BTreeSet<String> {
    NUMBER_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Split text into chunks of at most `max_tokens` (≈4 chars per token),
/// respecting paragraph boundaries and carrying `overlap_tokens` of context
/// into the next chunk. Oversized paragraphs are split on sentences.
/// Fragments of 50 chars or less are dropped.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens * 4;
    let overlap_chars = overlap_tokens * 4;

    if text.chars().count() <= max_chars {
        return keep_substantial(vec![text.trim().to_string()]);
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        if char_len(&current) + char_len(para) + 2 > max_chars {
            if !current.trim().is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = match chunks.last() {
                Some(prev) if overlap_chars > 0 => format!("{}\n\n{para}", tail(prev, overlap_chars)),
                _ => para.to_string(),
            };

            if char_len(&current) > max_chars {
                let long = std::mem::take(&mut current);
                for sentence in split_sentences(&long) {
                    if !current.is_empty() && char_len(&current) + char_len(sentence) + 1 > max_chars {
                        chunks.push(current.trim().to_string());
                        current.clear();
                    }
                    if !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(sentence);
                }
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    keep_substantial(chunks)
}

fn keep_substantial(chunks: Vec<String>) -> Vec<String> {
    chunks
        .into_iter()
        .filter(|c| c.trim().chars().count() > 50)
        .collect()
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_RE.find_iter(text) {
        // keep the punctuation with its sentence
        out.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` chars of `s`.
fn tail(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if len <= n {
        return s;
    }
    match s.char_indices().nth(len - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Truncate to at most `max` chars on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_by_frequency_without_stop_words() {
        let kws = top_keywords(
            "The pricing page and the pricing table: pricing tiers for 2024 and the tiers",
            3,
        );
        assert_eq!(kws, vec!["pricing", "tiers", "page"]);
    }

    #[test]
    fn digits_and_short_words_are_ignored() {
        let set = keyword_set("Set it to 300 ms on a CDN");
        assert!(set.contains("set"));
        assert!(set.contains("cdn"));
        assert!(!set.contains("300"));
        assert!(!set.contains("it"));
    }

    #[test]
    fn overlap_uses_smaller_set() {
        let a = keyword_set("budget scaling campaign");
        let b = keyword_set("budget scaling campaign audience creative");
        assert_eq!(keyword_overlap(&a, &b), 1.0);
        assert_eq!(keyword_overlap(&a, &BTreeSet::new()), 0.0);
    }

    #[test]
    fn negation_is_word_based() {
        assert!(has_negation("You should never raise the budget twice a day"));
        assert!(has_negation("Don't duplicate ad sets"));
        assert!(!has_negation("I know the notes are noted"));
    }

    #[test]
    fn numbers_with_percent() {
        let n = numbers("Raise budget by 20% every 3 days, 1.5x max");
        assert!(n.contains("20%"));
        assert!(n.contains("3"));
        assert!(n.contains("1.5"));
    }

    #[test]
    fn short_text_is_one_chunk() {
        let text = "A paragraph that is long enough to survive the tiny fragment filter.";
        assert_eq!(chunk_text(text, 6000, 200), vec![text.to_string()]);
        assert!(chunk_text("too short", 6000, 200).is_empty());
    }

    #[test]
    fn long_text_splits_on_paragraphs_with_overlap() {
        let para = "word ".repeat(30); // 150 chars
        let text = vec![para.trim(); 6].join("\n\n");
        // 100 tokens = 400 chars per chunk, 5 tokens = 20 chars overlap
        let chunks = chunk_text(&text, 100, 5);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 400 + 20 + 2);
        }
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences() {
        let text = "This sentence is exactly long enough to matter here. ".repeat(20);
        let chunks = chunk_text(&text, 50, 0);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.ends_with('.')));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("không thể", 5), "không");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
