//! Review signal parsing for reviewer output.
//!
//! Reviewer output is untrusted free text. A line counts as a verdict only if,
//! after normalization, it is exactly one of the known markers, optionally
//! preceded by a `SIGNAL:`, `VERDICT:` or `STATUS:` label.
//!
//! ## Markers
//!
//! - `APPROVED` / `REVIEW APPROVED`
//! - `REVISION_REQUIRED` / `REVISION REQUIRED`
//!
//! Normalization strips BOM and zero-width characters, carriage returns and
//! markdown emphasis, treats `_`, `-` and spaces as the same separator, and
//! ignores case. Output that matches both verdicts, or neither, is
//! [`Signal::Unknown`].
//!
//! ## Example
//!
//! ```
//! use ralph::core::Signal;
//! use ralph::orchestration::signal::parse_signal;
//!
//! let review = parse_signal("Tests pass.\n**VERDICT: APPROVED**");
//! assert_eq!(review.signal, Signal::Approved);
//! assert_eq!(review.reason, "Tests pass.");
//!
//! assert_eq!(parse_signal("looks fine to me").signal, Signal::Unknown);
//! ```

use regex::Regex;
use std::sync::LazyLock;

use crate::core::attempt::Signal;

/// Matches a normalized verdict line.
static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:SIGNAL|VERDICT|STATUS)\s*:\s*)?(REVIEW APPROVED|APPROVED|REVISION REQUIRED)$")
        .expect("verdict pattern is valid")
});

/// Characters dropped before matching.
const NOISE_CHARS: &[char] = &[
    '\u{feff}', '\u{200b}', '\u{200c}', '\u{200d}', '\u{2060}', '\r', '*', '`', '#', '>',
];

/// Parsed reviewer verdict with the reviewer's explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub signal: Signal,
    /// Reviewer output with verdict lines removed, trimmed.
    pub reason: String,
}

/// Parse reviewer output into a [`Review`].
pub fn parse_signal(output: &str) -> Review {
    let mut approved = false;
    let mut revision = false;
    let mut reason_lines = Vec::new();

    for line in output.lines() {
        match classify_line(line) {
            Some(Signal::Approved) => approved = true,
            Some(Signal::RevisionRequired) => revision = true,
            _ => reason_lines.push(line.trim_end_matches('\r')),
        }
    }

    let signal = match (approved, revision) {
        (true, false) => Signal::Approved,
        (false, true) => Signal::RevisionRequired,
        _ => Signal::Unknown,
    };

    Review {
        signal,
        reason: reason_lines.join("\n").trim().to_string(),
    }
}

/// Classify a single line, returning `None` for non-verdict text.
fn classify_line(line: &str) -> Option<Signal> {
    let normalized = normalize(line);
    if normalized.is_empty() {
        return None;
    }
    let caps = VERDICT_RE.captures(&normalized)?;
    match caps.get(1).map(|m| m.as_str()) {
        Some("APPROVED") | Some("REVIEW APPROVED") => Some(Signal::Approved),
        Some("REVISION REQUIRED") => Some(Signal::RevisionRequired),
        _ => None,
    }
}

fn normalize(line: &str) -> String {
    let cleaned: String = line
        .chars()
        .filter(|c| !NOISE_CHARS.contains(c))
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!'])
        .trim()
        .to_uppercase()
}
