//! Pull runnable code out of model replies.

use std::sync::OnceLock;

use regex::Regex;

fn fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").expect("code fence pattern")
    })
}

const PYTHON_HINTS: [&str; 7] = ["import ", "def ", "print(", "pd.", "df.", "plt.", "="];

/// The code inside the reply's markdown fences.
///
/// A fence tagged `python`/`py` wins; otherwise the first untagged fence that
/// looks like Python, then the first fence of any kind. A reply with no fence
/// is taken as code itself.
pub fn extract_code(reply: &str) -> String {
    let blocks: Vec<(String, &str)> = fence()
        .captures_iter(reply)
        .filter_map(|c| {
            let lang = c.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
            c.get(2).map(|body| (lang, body.as_str()))
        })
        .collect();

    let chosen = blocks
        .iter()
        .find(|(lang, _)| lang == "python" || lang == "py")
        .or_else(|| {
            blocks
                .iter()
                .find(|(_, body)| PYTHON_HINTS.iter().any(|hint| body.contains(hint)))
        })
        .or_else(|| blocks.first())
        .map(|(_, body)| *body);

    match chosen {
        Some(body) => tidy(body),
        None => tidy(&strip_stray_markers(reply)),
    }
}

/// Drop fence lines left behind by an unterminated block.
fn strip_stray_markers(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove blank lines and surrounding whitespace, keeping indentation.
fn tidy(code: &str) -> String {
    code.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}
