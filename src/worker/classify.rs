//! Heavy-work classification.

/// Task-type keywords that mark work as heavy enough to offload.
pub const HEAVY_TASK_KEYWORDS: &[&str] = &[
    "ai",
    "explain",
    "command",
    "parse",
    "extract",
    "analyze",
    "process",
    "transform",
    "compute",
];

/// Decide whether a task type should run on the worker pool.
///
/// The type is split into alphanumeric words, with camelCase humps counted
/// as separate words. A word matches a keyword when it equals it, or (for
/// keywords longer than two letters) starts with it, so `pdf-parser`,
/// `ai_summary` and `aiSummary` are heavy but `email` is not.
pub fn should_use_worker(task_type: &str) -> bool {
    words(task_type).any(|word| {
        HEAVY_TASK_KEYWORDS
            .iter()
            .any(|kw| word == *kw || (kw.len() > 2 && word.starts_with(kw)))
    })
}

/// Lowercased words of `s`, split on non-alphanumerics and on a lowercase
/// letter or digit followed by an uppercase one.
fn words(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .flat_map(|chunk| {
            let mut parts = Vec::new();
            let mut start = 0;
            let bytes = chunk.as_bytes();
            for i in 1..bytes.len() {
                let prev = bytes[i - 1];
                if bytes[i].is_ascii_uppercase() && (prev.is_ascii_lowercase() || prev.is_ascii_digit()) {
                    parts.push(&chunk[start..i]);
                    start = i;
                }
            }
            parts.push(&chunk[start..]);
            parts
        })
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_lowercase())
}
