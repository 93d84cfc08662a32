//! HTML-to-Markdown conversion for fetched or local HTML references.
//!
//! Extracts the main content container, pre-renders tables (htmd has no table
//! support), converts with `htmd`, then runs a short cleanup pipeline.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use skillfactory_shared::{Result, SkillFactoryError};
use url::Url;

/// Convert an HTML page to clean Markdown. Relative links resolve against
/// `base_url` when given.
pub fn html_to_markdown(html: &str, base_url: Option<&Url>) -> Result<String> {
    let content_html = extract_content_html(html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "iframe", "noscript", "svg",
        ])
        .build();

    let raw = converter
        .convert(&content_html)
        .map_err(|e| SkillFactoryError::Conversion(format!("htmd conversion failed: {e}")))?;

    tracing::debug!(raw_len = raw.len(), "htmd conversion complete");
    Ok(cleanup(&raw, base_url))
}

/// Whether a body looks like HTML rather than plain text or Markdown.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(512).collect::<String>().to_lowercase();
    head.contains("<html") || head.contains("<!doctype html") || head.contains("<body")
}

// ---------------------------------------------------------------------------
// Content extraction
// ---------------------------------------------------------------------------

/// Extract the main content HTML, stripping page chrome.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    let selectors = ["article", "main", "[role=\"main\"]", ".content", "body"];
    for sel_str in &selectors {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    html.to_string()
}

/// Replace `<table>` elements with Markdown tables before htmd sees them.
fn preprocess_tables(html: &str) -> String {
    let Ok(table_sel) = Selector::parse("table") else {
        return html.to_string();
    };
    let doc = Html::parse_fragment(html);

    let mut result = html.to_string();
    for table in doc.select(&table_sel) {
        let md = table_to_markdown(&table);
        result = result.replacen(&table.html(), &md, 1);
    }
    result
}

fn table_to_markdown(table: &ElementRef) -> String {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return String::new();
    };

    let mut rows: Vec<Vec<String>> = table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    if cols == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(cols, String::new());
    }

    let mut md = String::from("\n\n");
    for (i, row) in rows.iter().enumerate() {
        md.push_str(&format!("| {} |\n", row.join(" | ")));
        if i == 0 {
            md.push_str(&format!("| {} |\n", vec!["---"; cols].join(" | ")));
        }
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Cleanup passes
// ---------------------------------------------------------------------------

fn cleanup(md: &str, base_url: Option<&Url>) -> String {
    let mut result = clean_blank_lines(md);
    result = strip_leftover_html(&result);
    result = resolve_links(&result, base_url);
    result = normalize_whitespace(&result);
    format!("{}\n", result.trim_matches('\n'))
}

/// Collapse runs of blank lines into one.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

/// Remove stray container tags outside code fences, keeping their text.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|article|aside|figure|figcaption|details|summary)(?:\s[^>]*)?>")
            .expect("valid regex")
    });

    let mut in_code_block = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
                return line.to_string();
            }
            if in_code_block {
                line.to_string()
            } else {
                HTML_TAG_RE.replace_all(line, "").to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Make relative links absolute. Image links are left alone.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let (bang, text, href) = (&caps[1], &caps[2], &caps[3]);
            if !bang.is_empty()
                || href.starts_with("http://")
                || href.starts_with("https://")
                || href.starts_with('#')
                || href.starts_with("mailto:")
            {
                return caps[0].to_string();
            }
            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .to_string()
}

fn normalize_whitespace(md: &str) -> String {
    md.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}
