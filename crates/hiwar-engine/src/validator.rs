//! Post-processing of model output before it reaches a user.

/// Replies shorter than this (in characters) are discarded.
pub const MIN_RESPONSE_CHARS: usize = 3;

/// Substrings that mark a reply as an apology or leaked error rather than an answer.
/// Matching is case-insensitive, so an answer that merely discusses errors is
/// rejected too.
const DENYLIST: &[&str] = &["i'm sorry", "عذراً", "error", "خطأ", "exception"];

/// Trim, drop blank lines, and return an empty string for near-empty output.
pub fn clean(text: &str) -> String {
    let joined = text
        .trim()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if joined.chars().count() < MIN_RESPONSE_CHARS {
        return String::new();
    }
    joined
}

pub fn is_valid(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    !DENYLIST.iter().any(|pattern| lower.contains(pattern))
}
