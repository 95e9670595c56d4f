//! Sentence segmentation for the editor workflow.
//!
//! Text is split after `.`, `!` or `?` when followed by whitespace. Ids are
//! positional (`sentence_0`, `sentence_1`, ...) and are minted afresh every
//! time content is segmented.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

fn boundary() -> &'static Regex {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    BOUNDARY.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence boundary pattern"))
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in boundary().find_iter(text) {
        // Keep the punctuation, drop the whitespace.
        push_trimmed(&mut sentences, &text[start..m.start() + 1]);
        start = m.end();
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

pub fn sentence_id(index: usize) -> String {
    format!("sentence_{index}")
}

/// Position encoded in a sentence id.
pub fn sentence_index(id: &str) -> Option<usize> {
    id.strip_prefix("sentence_")?.parse().ok()
}

pub fn sentence_map(text: &str) -> BTreeMap<String, String> {
    split_sentences(text)
        .into_iter()
        .enumerate()
        .map(|(i, s)| (sentence_id(i), s))
        .collect()
}

/// Sentences in document order. Map keys sort lexically, so `sentence_10`
/// would otherwise come before `sentence_2`.
pub fn ordered(map: &BTreeMap<String, String>) -> Vec<(&str, &str)> {
    let mut entries: Vec<(usize, &str, &str)> = map
        .iter()
        .map(|(id, text)| (sentence_index(id).unwrap_or(usize::MAX), id.as_str(), text.as_str()))
        .collect();
    entries.sort_by_key(|(index, id, _)| (*index, *id));
    entries.into_iter().map(|(_, id, text)| (id, text)).collect()
}

/// Join sentences back into running text.
pub fn reconstruct(map: &BTreeMap<String, String>) -> String {
    ordered(map)
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join(" ")
}
