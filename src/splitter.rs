//! Segment splitter for the organizer's tagged output.
//!
//! The organizer labels each instrument part with one of a small closed set
//! of marker tokens. Each marker position delimits a slice running to the
//! next marker position (or end of text). Indices drive merge order only;
//! the splitter does not validate uniqueness or contiguity - malformed
//! upstream text can produce collisions or gaps, and downstream merge is a
//! stable sort that tolerates both.

use once_cell::sync::Lazy;
use regex::Regex;

/// One independently renderable slice of the organizer's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Marker-derived label, e.g. "First Part" or "Middle Part 2".
    pub label: String,
    /// Slice of the source text, marker included.
    pub content: String,
    /// Merge-order index. Not necessarily the array position.
    pub index: u32,
}

/// Label used when the text is treated as a single undivided segment.
const WHOLE_LABEL: &str = "Complete Composition";

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*First Part|\*Middle Part (\d+)|\*Last Part|\*Only Part").unwrap());

/// Split tagged text into ordered segments.
///
/// Rules:
/// - `*Only Part` anywhere: the whole text is one segment, index 1.
/// - no marker at all: the whole text is one segment, index 1.
/// - otherwise one segment per marker; `*First Part` gets index 1,
///   `*Middle Part N` gets index N, `*Last Part` gets the total marker count.
pub fn split_segments(text: &str) -> Vec<Segment> {
    if text.contains("*Only Part") {
        return vec![Segment {
            label: WHOLE_LABEL.to_string(),
            content: text.to_string(),
            index: 1,
        }];
    }

    let markers: Vec<regex::Captures<'_>> = MARKER_RE.captures_iter(text).collect();
    if markers.is_empty() {
        return vec![Segment {
            label: WHOLE_LABEL.to_string(),
            content: text.to_string(),
            index: 1,
        }];
    }

    let total = markers.len() as u32;
    let mut segments = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let whole = caps.get(0).expect("group 0 always present");
        let tag = whole.as_str();

        let index = if let Some(n) = caps.get(1) {
            // Middle marker numeral claims the index directly.
            n.as_str().parse::<u32>().unwrap_or(1)
        } else if tag == "*Last Part" {
            total
        } else {
            1
        };

        let start = whole.start();
        let end = markers
            .get(i + 1)
            .map(|next| next.get(0).expect("group 0 always present").start())
            .unwrap_or(text.len());

        segments.push(Segment {
            label: tag.trim_start_matches('*').trim().to_string(),
            content: text[start..end].to_string(),
            index,
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_marker_wins_regardless_of_other_markers() {
        let text = "*Only Part piano\n*First Part ignored\n*Last Part ignored";
        let segments = split_segments(text);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].label, "Complete Composition");
        assert_eq!(segments[0].content, text);
    }

    #[test]
    fn no_marker_yields_single_segment() {
        let segments = split_segments("just an untagged outline");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].content, "just an untagged outline");
    }

    #[test]
    fn first_and_last_only() {
        // k = 0 middle markers
        let text = "*First Part right hand outline\n*Last Part left hand outline";
        let segments = split_segments(text);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].label, "First Part");
        assert_eq!(segments[1].index, 2);
        assert_eq!(segments[1].label, "Last Part");
        assert!(segments[0].content.contains("right hand"));
        assert!(!segments[0].content.contains("left hand"));
    }

    #[test]
    fn one_middle_marker() {
        let text = "*First Part violin\n*Middle Part 2 viola\n*Last Part cello";
        let segments = split_segments(text);
        assert_eq!(segments.len(), 3);
        let indices: Vec<u32> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(segments[1].label, "Middle Part 2");
    }

    #[test]
    fn three_middle_markers() {
        let text = "*First Part a\n*Middle Part 2 b\n*Middle Part 3 c\n*Middle Part 4 d\n*Last Part e";
        let segments = split_segments(text);
        assert_eq!(segments.len(), 5);
        let indices: Vec<u32> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn middle_numeral_claims_index_even_out_of_order() {
        let text = "*Middle Part 3 late\n*First Part early\n*Middle Part 2 mid";
        let segments = split_segments(text);
        let indices: Vec<u32> = segments.iter().map(|s| s.index).collect();
        // Discovery order preserved; indices come from the numerals.
        assert_eq!(indices, vec![3, 1, 2]);
    }

    #[test]
    fn malformed_indices_are_not_validated() {
        // Duplicate numeral: splitter passes collisions through.
        let text = "*First Part a\n*Middle Part 2 b\n*Middle Part 2 c\n*Last Part d";
        let segments = split_segments(text);
        let indices: Vec<u32> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 2, 4]);
    }

    #[test]
    fn slice_runs_to_next_marker() {
        let text = "preamble\n*First Part one two three\n*Last Part four five";
        let segments = split_segments(text);
        // Leading untagged text is dropped; each slice starts at its marker.
        assert!(segments[0].content.starts_with("*First Part"));
        assert!(segments[0].content.ends_with("three\n"));
        assert!(segments[1].content.starts_with("*Last Part"));
    }
}
