//! Chunker (C6): splits joined page text into overlapping chunks, honoring
//! sentence boundaries. Pure, synchronous, no I/O — the whole crate is one
//! function plus its private boundary-detection helpers.

use unicode_segmentation::UnicodeSegmentation;

/// Target chunk length in bytes (spec §4.6: "target length ≈ 500
/// characters"). Treated as bytes since the boundary search already
/// snaps to char boundaries; for ASCII-heavy text the two coincide.
pub const TARGET_LEN: usize = 500;
pub const OVERLAP_LEN: usize = 50;
/// Hard cap on chunk length, keeping embedding requests predictable.
pub const HARD_CAP: usize = 2_000;

/// Splits `text` into ordered, overlapping chunks. Empty and
/// whitespace-only input (and any chunk candidate that turns out to be
/// whitespace-only) is dropped, per spec §4.6.
pub fn chunk_page_text(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let len = text.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len {
        let remaining = len - start;
        if remaining <= TARGET_LEN {
            push_chunk(&mut chunks, &text[start..len]);
            break;
        }

        let ideal_end = snap_to_char_boundary(text, (start + TARGET_LEN).min(len));
        let hard_end = snap_to_char_boundary(text, (start + HARD_CAP).min(len));
        let end = find_boundary(text, start, ideal_end, hard_end);
        push_chunk(&mut chunks, &text[start..end]);

        let overlap_start = end.saturating_sub(OVERLAP_LEN).max(start);
        let next_start = snap_to_char_boundary(text, overlap_start);
        start = if next_start > start { next_start } else { end };
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, candidate: &str) {
    if candidate.trim().is_empty() {
        return;
    }
    chunks.push(candidate.to_string());
}

fn snap_to_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(text.len())
}

/// Finds the best split point in `(start, hard_end]`, preferring a
/// paragraph break, then a sentence boundary, then generic punctuation,
/// then a word boundary — falling back to a hard cut at `ideal_end` only
/// if the window contains none of those. Among candidates of the
/// preferred type, the one closest to `ideal_end` wins.
fn find_boundary(text: &str, start: usize, ideal_end: usize, hard_end: usize) -> usize {
    if hard_end <= start + 1 {
        return hard_end.max(start + 1).min(text.len());
    }

    if let Some(split) = best_match(text, start, hard_end, ideal_end, paragraph_break_at) {
        return split;
    }
    if let Some(split) = best_match(text, start, hard_end, ideal_end, sentence_end_at) {
        return split;
    }
    if let Some(split) = best_match(text, start, hard_end, ideal_end, punctuation_at) {
        return split;
    }
    nearest_word_boundary(text, start, hard_end, ideal_end).unwrap_or(ideal_end)
}

fn best_match(
    text: &str,
    start: usize,
    hard_end: usize,
    ideal_end: usize,
    at: impl Fn(&str, usize) -> Option<usize>,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for i in (start + 1)..hard_end {
        if let Some(split) = at(text, i) {
            if split <= hard_end && split > start {
                let better = match best {
                    None => true,
                    Some(b) => distance(split, ideal_end) < distance(b, ideal_end),
                };
                if better {
                    best = Some(split);
                }
            }
        }
    }
    best
}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

/// A blank line (`\n\n`) separating paragraphs; splits after both bytes.
fn paragraph_break_at(text: &str, i: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(i) == Some(&b'\n') && bytes.get(i + 1) == Some(&b'\n') {
        Some(i + 2)
    } else {
        None
    }
}

/// `.`/`!`/`?` followed by whitespace or end of text.
fn sentence_end_at(text: &str, i: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let c = *bytes.get(i)?;
    if !matches!(c, b'.' | b'!' | b'?') {
        return None;
    }
    match bytes.get(i + 1) {
        None => Some(i + 1),
        Some(next) if (*next as char).is_whitespace() => Some(i + 1),
        _ => None,
    }
}

/// `,`/`;`/`:` as a weaker fallback boundary than a full sentence end.
fn punctuation_at(text: &str, i: usize) -> Option<usize> {
    let c = *text.as_bytes().get(i)?;
    if matches!(c, b',' | b';' | b':') {
        Some(i + 1)
    } else {
        None
    }
}

/// Last resort before a hard character cut: don't split a word in half.
fn nearest_word_boundary(text: &str, start: usize, hard_end: usize, ideal_end: usize) -> Option<usize> {
    let window = &text[start..hard_end];
    let mut best: Option<usize> = None;
    for (offset, _) in window.split_word_bound_indices() {
        let pos = start + offset;
        if pos <= start || pos > hard_end {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => distance(pos, ideal_end) < distance(b, ideal_end),
        };
        if better {
            best = Some(pos);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_text_yields_no_chunks() {
        assert!(chunk_page_text("").is_empty());
        assert!(chunk_page_text("   \n\t  ").is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_page_text("a short page of text.");
        assert_eq!(chunks, vec!["a short page of text."]);
    }

    #[test]
    fn long_text_splits_on_paragraph_boundary_when_available() {
        let para1 = "Alpha ".repeat(60);
        let para2 = "Beta ".repeat(60);
        let text = format!("{para1}\n\n{para2}");
        let chunks = chunk_page_text(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].trim_end().ends_with("Alpha"));
        assert!(!chunks[0].contains("Beta"));
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "word ".repeat(300);
        let chunks = chunk_page_text(&text);
        assert!(chunks.len() > 1);
        let tail_of_first: &str = chunks[0].trim_end();
        let tail_of_first = &tail_of_first[tail_of_first.len().saturating_sub(10)..];
        assert!(chunks[1].contains(tail_of_first.trim()));
    }

    #[test]
    fn no_chunk_exceeds_the_hard_cap() {
        let text = "x".repeat(10_000);
        for chunk in chunk_page_text(&text) {
            assert!(chunk.len() <= HARD_CAP);
        }
    }

    #[test]
    fn hard_cap_falls_back_to_word_boundary_with_no_punctuation() {
        let text = "supercalifragilisticexpialidocious ".repeat(400);
        let chunks = chunk_page_text(&text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.len() <= HARD_CAP);
        }
    }

    proptest::proptest! {
        #[test]
        fn never_panics_and_never_exceeds_hard_cap(s in "\\PC*") {
            let chunks = chunk_page_text(&s);
            for chunk in &chunks {
                assert!(chunk.len() <= HARD_CAP);
                assert!(!chunk.trim().is_empty());
            }
        }
    }
}
