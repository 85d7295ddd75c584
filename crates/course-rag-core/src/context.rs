//! Context block, prompt construction, and answer post-processing.
//!
//! The context block is ephemeral: it is built from the ranked matches for
//! one request, handed to the generator inside the prompt, and dropped.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::Match;

/// Text used when retrieval produced no matches.
pub const EMPTY_CONTEXT: &str = "No context.";

/// Default per-fragment cap, in characters.
pub const DEFAULT_MAX_FRAGMENT_CHARS: usize = 800;

/// Render one match as a labelled text fragment.
///
/// ```text
/// Course: Data Structures
/// Instructor: Jane Doe
/// Description: ...
/// Prerequisites: ...
/// ```
///
/// The course line prefers the course name and falls back to the code;
/// description and prerequisite lines are omitted when empty.
pub fn fragment(m: &Match) -> String {
    let md = &m.metadata;
    let course = non_empty(md.course_name.as_deref())
        .or_else(|| non_empty(md.course.as_deref()))
        .unwrap_or("");
    let instructor = non_empty(md.instructor.as_deref()).unwrap_or("");

    let mut lines = vec![
        format!("Course: {course}"),
        format!("Instructor: {instructor}"),
    ];
    if let Some(description) = non_empty(md.description.as_deref()) {
        lines.push(format!("Description: {description}"));
    }
    if let Some(prerequisite) = non_empty(md.prerequisite.as_deref()) {
        lines.push(format!("Prerequisites: {prerequisite}"));
    }
    lines.join("\n")
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Concatenate up to `limit` fragments, each capped at
/// `max_fragment_chars`, separated by a blank line.
pub fn build_context(matches: &[Match], limit: usize, max_fragment_chars: usize) -> String {
    let blocks: Vec<String> = matches
        .iter()
        .take(limit)
        .map(|m| truncate_chars(&fragment(m), max_fragment_chars).to_string())
        .collect();

    if blocks.is_empty() {
        EMPTY_CONTEXT.to_string()
    } else {
        blocks.join("\n\n")
    }
}

/// Longest prefix of `s` with at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Assemble the generation prompt.
pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a helpful university course assistant.\n\
         Answer concisely using ONLY the provided context. \
         If the answer isn't in the context, say you don't know.\n\n\
         # Context\n{context}\n\n\
         # Question\n{question}\n\n\
         # Style\n\
         - Keep it under 6 sentences.\n\
         - Do not include references, IDs, or bracketed numbers in the answer.\n"
    )
}

fn ref_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\(\s*ref:\s*\[[^\]]*\]\s*\)").expect("valid ref-group pattern")
    })
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\[\]]*\]").expect("valid bracket pattern"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s{2,}").expect("valid whitespace pattern"))
}

/// Remove inline citation markers from generated text.
///
/// Drops `(ref: [..])` groups and every `[...]` span, then collapses runs of
/// whitespace to a single space and trims. The structured `sources` list is
/// the only citation channel in the response.
pub fn strip_citations(text: &str) -> String {
    let text = ref_group_re().replace_all(text, "");
    let text = bracket_re().replace_all(&text, "");
    let text = whitespace_re().replace_all(&text, " ");
    text.trim().to_string()
}
