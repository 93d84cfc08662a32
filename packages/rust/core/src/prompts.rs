//! Model prompts for each phase. Every prompt asks for bare JSON (or
//! Markdown for the build phase) in the transcript's language.

pub const AUDIT_SYSTEM: &str = "\
You catalogue the topics an expert covers in a transcript.
For each distinct topic report: a short name, a category id, a quality score 0-100 \
reflecting how much usable detail is given, how many times it comes up, a one-sentence \
summary, and its depth: deep, moderate, surface or mention_only.
Answer with JSON only. No prose, no code fences.";

pub fn audit_user(
    chunk: &str,
    chunk_index: usize,
    total_chunks: usize,
    source: &str,
    language: &str,
    domain: &str,
    categories: &[&str],
) -> String {
    format!(
        "Transcript: {source} (chunk {chunk_index} of {total_chunks})\n\
         Language: {language}\nDomain: {domain}\nCategories: {}\n\n\
         <transcript>\n{chunk}\n</transcript>\n\n\
         Respond with:\n\
         {{\"topics\": [{{\"topic\": \"...\", \"category\": \"...\", \"quality_score\": 80, \
         \"mentions\": 1, \"summary\": \"...\", \"depth\": \"moderate\"}}]}}",
        categories.join(", ")
    )
}

pub const EXTRACT_SYSTEM: &str = "\
You turn transcript excerpts into knowledge atoms: self-contained, actionable units that \
each cover exactly one fact, procedure or insight and stay faithful to the source.
Titles are 5-15 words. Content is 2-6 complete sentences of instruction. Give 2-5 tags.
Confidence: 0.9 or more when stated outright, 0.7-0.89 when clearly implied, 0.5-0.69 when inferred.
Write in the language of the source. Answer with JSON only.";

pub fn extract_user(
    chunk: &str,
    chunk_index: usize,
    total_chunks: usize,
    source: &str,
    language: &str,
    domain: &str,
    categories: &[&str],
) -> String {
    format!(
        "Source: {source} (chunk {chunk_index} of {total_chunks})\n\
         Language: {language}\nDomain: {domain}\nCategories: {}\n\n\
         <transcript>\n{chunk}\n</transcript>\n\n\
         Respond with:\n\
         {{\"atoms\": [{{\"title\": \"...\", \"content\": \"...\", \"category\": \"...\", \
         \"tags\": [\"...\"], \"confidence\": 0.85, \"source_timestamp\": null}}]}}",
        categories.join(", ")
    )
}

pub const GAP_FILL_SYSTEM: &str = "\
You write knowledge atoms from official reference documentation to cover a topic the \
expert never discussed. Use only what the excerpt says. Each atom covers one fact or \
procedure in 2-6 complete sentences. Answer with JSON only.";

pub fn gap_fill_user(topic: &str, reference: &str, excerpt: &str, language: &str, max_atoms: usize) -> String {
    format!(
        "Topic: {topic}\nReference: {reference}\nLanguage: {language}\n\
         Write at most {max_atoms} atoms.\n\n<reference>\n{excerpt}\n</reference>\n\n\
         Respond with:\n\
         {{\"atoms\": [{{\"title\": \"...\", \"content\": \"...\", \"category\": \"...\", \
         \"tags\": [\"...\"], \"confidence\": 0.85}}]}}"
    )
}

pub const DEDUP_SYSTEM: &str = "\
You clean up a list of knowledge atoms from one category.
Merge atoms that state the same fact or procedure into one atom that keeps every unique \
detail, the higher confidence and the id of the better original, and list the merged ids \
in merged_from. Keep atoms that are merely related as they are.
Report pairs that contradict each other as conflicts instead of merging them.
Answer with JSON only.";

pub fn dedup_user(atoms_json: &str, count: usize, threshold: f64, language: &str, domain: &str) -> String {
    format!(
        "{count} atoms. Language: {language}. Domain: {domain}.\n\
         Treat two atoms as duplicates only when their content overlaps by at least {:.0}%.\n\n\
         <atoms>\n{atoms_json}\n</atoms>\n\n\
         Respond with:\n\
         {{\"unique_atoms\": [{{\"id\": \"...\", \"title\": \"...\", \"content\": \"...\", \
         \"category\": \"...\", \"tags\": [\"...\"], \"confidence\": 0.9, \"merged_from\": []}}], \
         \"conflicts\": [{{\"atom_a_id\": \"...\", \"atom_b_id\": \"...\", \
         \"conflict_type\": \"contradiction\", \"description\": \"...\"}}], \
         \"stats\": {{\"duplicates_found\": 0}}}}",
        threshold * 100.0
    )
}

pub const VERIFY_SYSTEM: &str = "\
You compare one claim against an excerpt from official documentation.
Say whether the excerpt supports it, contradicts it, or neither. Only call it contradicted \
when the excerpt clearly states otherwise. Answer with JSON only.";

pub fn verify_user(title: &str, content: &str, reference: &str, snippet: &str) -> String {
    format!(
        "Claim: {title}\n{content}\n\nReference: {reference}\n<excerpt>\n{snippet}\n</excerpt>\n\n\
         Respond with:\n\
         {{\"status\": \"verified|updated|flagged\", \"confidence\": 0.8, \"note\": \"...\", \
         \"updated_content\": null}}"
    )
}

pub const KNOWLEDGE_SYSTEM: &str = "\
You write one Markdown knowledge file for an AI skill from a set of knowledge atoms.
Organise the atoms under clear headings, keep every concrete number and step, and drop \
repetition. Start with a level-one heading. Return Markdown only, without code fences.";

pub fn knowledge_user(pillar: &str, atoms_json: &str, language: &str, domain: &str) -> String {
    format!(
        "Pillar: {pillar}\nLanguage: {language}\nDomain: {domain}\n\n<atoms>\n{atoms_json}\n</atoms>"
    )
}

pub const SKILL_SYSTEM: &str = "\
You write SKILL.md, the entry point of an AI skill. Begin with YAML front matter holding \
name and description, then explain when to use the skill and which knowledge file answers \
which kind of question. Return Markdown only, without code fences.";

pub fn skill_user(name: &str, domain: &str, language: &str, pillars: &str) -> String {
    format!("Skill: {name}\nDomain: {domain}\nLanguage: {language}\n\nKnowledge files:\n{pillars}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompts_embed_inputs() {
        let p = extract_user("chunk body", 2, 5, "talk.txt", "en", "fb_ads", &["a", "b"]);
        assert!(p.contains("chunk 2 of 5"));
        assert!(p.contains("Categories: a, b"));
        assert!(p.contains("chunk body"));

        let p = dedup_user("[]", 4, 0.65, "en", "custom");
        assert!(p.contains("at least 65%"));
        assert!(p.contains("\"unique_atoms\""));
    }
}
