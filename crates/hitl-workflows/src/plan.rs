//! Section plan parsing with fallbacks.

use std::sync::OnceLock;

use regex::Regex;

pub const DEFAULT_OUTLINE: [&str; 3] = ["Introduction", "Main Content", "Conclusion"];

fn numbered() -> &'static Regex {
    static NUMBERED: OnceLock<Regex> = OnceLock::new();
    NUMBERED.get_or_init(|| Regex::new(r"^\s*\d+\s*[.):-]\s*(.+?)\s*$").expect("numbered line pattern"))
}

/// Section titles from a planning reply.
///
/// The model is asked for a JSON array of strings. When the reply holds no
/// such array, numbered lines (`1. Title`) are used; failing that, the
/// default three-part outline.
pub fn parse_plan(reply: &str) -> Vec<String> {
    if let Some(titles) = json_array(reply) {
        return titles;
    }

    let titles: Vec<String> = reply
        .lines()
        .filter_map(|line| numbered().captures(line))
        .filter_map(|c| c.get(1))
        .map(|m| clean_title(m.as_str()))
        .filter(|t| !t.is_empty())
        .collect();
    if !titles.is_empty() {
        return titles;
    }

    tracing::warn!("Plan reply had no usable titles, using default outline");
    DEFAULT_OUTLINE.iter().map(|s| s.to_string()).collect()
}

fn json_array(reply: &str) -> Option<Vec<String>> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end <= start {
        return None;
    }
    let titles: Vec<String> = serde_json::from_str::<Vec<String>>(&reply[start..=end])
        .ok()?
        .into_iter()
        .map(|t| clean_title(&t))
        .filter(|t| !t.is_empty())
        .collect();
    (!titles.is_empty()).then_some(titles)
}

fn clean_title(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '*' || c == '"' || c == '#').trim().to_string()
}
