//! Segment text cleanup, applied to each segment before merging.
//!
//! Models occasionally wrap their answer in a code fence or open with a
//! sentence of chatter despite the prompt. Those artefacts sit exactly at the
//! segment edges, where the merger looks for overlap, so they are removed
//! first. Rules are cheap, deterministic and run in this order:
//!
//! 1. Normalise line endings (CRLF → LF)
//! 2. Strip an outer code fence (```` ``` ````, ```` ```text ````, …)
//! 3. Drop a leading "Here is the extracted text:" style preamble
//! 4. Remove invisible Unicode (zero-width spaces, word joiners, BOM, soft
//!    hyphens). ZWNJ and ZWJ are kept.
//! 5. Trim trailing whitespace per line
//! 6. Collapse runs of blank lines to a single blank line
//! 7. Trim the whole text

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean raw model output for one segment.
pub fn clean_segment(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    let s = strip_preamble(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?```\s*$").expect("valid fence regex")
});

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:sure[,!.]?\s*)?(?:here is|here's|below is)\b[^\n]{0,80}(?:text|transcription|content)[^\n]{0,20}:[ \t]*\n")
        .expect("valid preamble regex")
});

fn strip_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").into_owned()
}

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank-run regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUNS.replace_all(input, "\n\n").into_owned()
}
