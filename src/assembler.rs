//! Document assembler for MusicXML fragments.
//!
//! Renderer output is free-form model text: parts sometimes arrive wrapped in
//! code fences, with duplicate headers, or with a part-list echoed mid-stream.
//! The assembler normalizes each fragment, rebuilds the fixed preamble, and
//! appends exactly one terminator when (and only when) the material is
//! complete.
//!
//! Completeness is a substring heuristic, not a structural parse. It is kept
//! behind the two named predicates below so a real parser can replace it
//! without touching coordinator logic.

use once_cell::sync::Lazy;
use regex::Regex;

pub const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
pub const DOCTYPE: &str = r#"<!DOCTYPE score-partwise PUBLIC "-//Recordare//DTD MusicXML 4.0 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd">"#;
pub const SCORE_OPEN: &str = r#"<score-partwise version="4.0">"#;
pub const SCORE_CLOSE: &str = "</score-partwise>";

const PART_LIST_OPEN: &str = "<part-list>";
const PART_LIST_CLOSE: &str = "</part-list>";

static PART_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<part id="(P\d+)">"#).unwrap());

/// Whether the document (or raw concatenation) carries the closing tag.
///
/// This is the sole completeness signal for a whole score.
pub fn is_score_complete(text: &str) -> bool {
    text.contains(SCORE_CLOSE)
}

/// Whether a single part's accumulated response reached its closing tag.
pub fn is_part_complete(text: &str) -> bool {
    text.contains("</part>")
}

/// Strip code fences and embedded document-level scaffolding from one
/// fragment. Upstream roles echo headers despite instructions not to.
pub fn normalize_fragment(text: &str) -> String {
    text.replace("```xml\n", "")
        .replace("```", "")
        .replace("'''", "")
        .replace(XML_HEADER, "")
        .replace(DOCTYPE, "")
        .replace(SCORE_OPEN, "")
        .replace(SCORE_CLOSE, "")
}

/// Remove part-list blocks that appear after the first `<part id=` tag.
/// A leading part-list (from the first part's renderer output) is kept.
fn strip_stray_part_lists(content: &str) -> String {
    let Some(first_part) = content.find("<part id=") else {
        return content.to_string();
    };

    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..first_part]);
    let mut rest = &content[first_part..];

    loop {
        match rest.find(PART_LIST_OPEN) {
            Some(start) => match rest[start..].find(PART_LIST_CLOSE) {
                Some(rel_end) => {
                    out.push_str(&rest[..start]);
                    rest = &rest[start + rel_end + PART_LIST_CLOSE.len()..];
                }
                None => {
                    // Unterminated block; leave it rather than guess.
                    out.push_str(rest);
                    break;
                }
            },
            None => {
                out.push_str(rest);
                break;
            }
        }
    }

    out
}

/// Synthesize a part-list from the distinct part ids referenced in the
/// content, in first-seen order.
fn synthesize_part_list(content: &str) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for caps in PART_ID_RE.captures_iter(content) {
        let id = caps.get(1).expect("group 1 always present").as_str();
        if !seen.contains(&id) {
            seen.push(id);
        }
    }

    let mut part_list = String::from(PART_LIST_OPEN);
    part_list.push('\n');
    for id in seen {
        part_list.push_str(&format!(
            "<score-part id=\"{id}\">\n<part-name>Part {}</part-name>\n</score-part>\n",
            id.trim_start_matches('P')
        ));
    }
    part_list.push_str(PART_LIST_CLOSE);
    part_list
}

/// Merge normalized fragments (already in merge order) into one document.
///
/// The terminator is appended iff the raw input already carried one;
/// assembling an assembled document is a no-op.
pub fn assemble(fragments: &[&str]) -> String {
    let raw = fragments.join("\n\n");
    let complete = is_score_complete(&raw);

    let normalized: Vec<String> = fragments.iter().map(|f| normalize_fragment(f)).collect();
    let joined = normalized.join("\n\n");
    let content = strip_stray_part_lists(joined.trim());
    let content = content.trim();

    let mut doc = String::with_capacity(content.len() + 512);
    doc.push_str(XML_HEADER);
    doc.push('\n');
    doc.push_str(DOCTYPE);
    doc.push('\n');
    doc.push_str(SCORE_OPEN);
    doc.push('\n');

    if !content.contains(PART_LIST_OPEN) {
        doc.push_str(&synthesize_part_list(content));
        doc.push('\n');
    }

    doc.push_str(content);

    if complete {
        doc.push('\n');
        doc.push_str(SCORE_CLOSE);
    }

    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    const PART_ONE: &str = "<part id=\"P1\">\n<measure number=\"1\"/>\n</part>";
    const PART_TWO: &str = "<part id=\"P2\">\n<measure number=\"1\"/>\n</part>";

    #[test]
    fn assembles_header_and_synthesized_part_list() {
        let doc = assemble(&[PART_ONE, PART_TWO]);
        assert!(doc.starts_with(XML_HEADER));
        assert!(doc.contains(DOCTYPE));
        assert!(doc.contains("<score-part id=\"P1\">"));
        assert!(doc.contains("<score-part id=\"P2\">"));
        let p1 = doc.find("<score-part id=\"P1\">").unwrap();
        let p2 = doc.find("<score-part id=\"P2\">").unwrap();
        assert!(p1 < p2, "declarations follow first-seen order");
    }

    #[test]
    fn terminator_present_iff_input_complete() {
        let incomplete = assemble(&[PART_ONE]);
        assert!(!is_score_complete(&incomplete));

        let last = format!("{PART_TWO}\n{SCORE_CLOSE}");
        let complete = assemble(&[PART_ONE, &last]);
        assert!(is_score_complete(&complete));
        assert_eq!(complete.matches(SCORE_CLOSE).count(), 1);
        assert!(complete.ends_with(SCORE_CLOSE));
    }

    #[test]
    fn assemble_is_idempotent_on_complete_documents() {
        let last = format!("{PART_TWO}\n{SCORE_CLOSE}");
        let once = assemble(&[PART_ONE, &last]);
        let twice = assemble(&[once.as_str()]);
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_embedded_headers_and_fences() {
        let fragment = format!("```xml\n{XML_HEADER}\n{DOCTYPE}\n{SCORE_OPEN}\n{PART_ONE}\n```");
        let doc = assemble(&[fragment.as_str()]);
        assert_eq!(doc.matches(XML_HEADER).count(), 1);
        assert_eq!(doc.matches(SCORE_OPEN).count(), 1);
        assert!(!doc.contains("```"));
    }

    #[test]
    fn keeps_leading_part_list_and_strips_stray_ones() {
        let first = format!(
            "{PART_LIST_OPEN}\n<score-part id=\"P1\"><part-name>RH</part-name></score-part>\n{PART_LIST_CLOSE}\n{PART_ONE}"
        );
        let stray = format!(
            "{PART_LIST_OPEN}\n<score-part id=\"P2\"/>\n{PART_LIST_CLOSE}\n{PART_TWO}"
        );
        let doc = assemble(&[first.as_str(), stray.as_str()]);
        assert_eq!(doc.matches(PART_LIST_OPEN).count(), 1);
        assert!(doc.contains("RH"));
        assert!(!doc.contains("<score-part id=\"P2\"/>"));
    }

    #[test]
    fn part_completeness_predicate() {
        assert!(is_part_complete("<part id=\"P1\">x</part>"));
        assert!(!is_part_complete("<part id=\"P1\">x"));
        // A part-list close tag is not a part close tag.
        assert!(!is_part_complete("</part-list>"));
    }
}
