//! Transcript merging: fold the texts of a page's segments into one.
//!
//! Neighbouring segments share an overlap band, so the model usually
//! transcribes the same line or two at the end of segment `i` and again at
//! the start of segment `i + 1`. The merger removes that duplicate.
//!
//! The fold runs left to right (`((s0 ⊕ s1) ⊕ s2) ⊕ …`). For each boundary
//! the strategies below are tried in order and the first confident one wins:
//!
//! | Strategy    | Match                                                        |
//! |-------------|--------------------------------------------------------------|
//! | `Exact`     | longest suffix of the accumulated text = prefix of the next  |
//! | `Lines`     | trailing lines = leading lines, ignoring case and spacing    |
//! | `Fuzzy`     | trailing lines ≈ leading lines (similarity ≥ threshold)      |
//! | `Substring` | common substring at the seam (see below)                     |
//! | `Marked`    | nothing confident: keep both texts, insert the marker        |
//!
//! The model sees slightly different pixels in the two windows, so its two
//! readings of the band often differ in punctuation or line breaks; those
//! cases fall through to the looser strategies. When nothing matches, both
//! texts are kept in full with a visible marker between them: duplicated text
//! can be spotted by a reader, dropped text cannot.
//!
//! A `Substring` match must sit at the seam: at most
//! [`MergePolicy::splice_slack_chars`] characters (on one line) may follow it
//! in the accumulated text or precede it in the next one. Those few
//! characters are edge fragments of a cut line and are dropped; a phrase that
//! merely recurs further inside either segment is never a splice point.
//!
//! Thresholds and the marker are tunable via [`MergePolicy`]; they are
//! policy, not ground truth.

use crate::error::ExtractError;
use crate::pipeline::segment::OverlapBand;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tunable knobs for overlap detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePolicy {
    /// Shortest overlap accepted by the `Exact`, `Lines` and `Fuzzy`
    /// strategies, in characters. Default: 12.
    pub min_match_chars: usize,

    /// Shortest common substring accepted by the `Substring` strategy.
    /// Default: 24.
    ///
    /// Higher than `min_match_chars` because a substring splice discards the
    /// text on either side of the match.
    pub min_substring_chars: usize,

    /// How many leading lines of the next segment may be treated as
    /// duplicates. Default: 10.
    pub max_overlap_lines: usize,

    /// Similarity (0–1) at which two line blocks count as the same reading.
    /// Default: 0.85.
    pub similarity_threshold: f64,

    /// Characters a `Substring` match may leave after it in the accumulated
    /// text, or before it in the next text, and still count as the seam.
    /// Both leftovers are dropped. Default: 4.
    pub splice_slack_chars: usize,

    /// Characters of tail/head examined for a match. Default: 1500.
    pub window_chars: usize,

    /// Inserted between two segments whose overlap could not be resolved.
    pub boundary_marker: String,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            min_match_chars: 12,
            min_substring_chars: 24,
            max_overlap_lines: 10,
            similarity_threshold: 0.85,
            splice_slack_chars: 4,
            window_chars: 1500,
            boundary_marker: DEFAULT_BOUNDARY_MARKER.to_string(),
        }
    }
}

/// Default marker for unresolved segment boundaries.
pub const DEFAULT_BOUNDARY_MARKER: &str = "[… segment boundary …]";

impl MergePolicy {
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.min_match_chars == 0 || self.min_substring_chars == 0 {
            return Err(ExtractError::Configuration(
                "merge thresholds must be ≥ 1 character".into(),
            ));
        }
        if self.window_chars < self.min_match_chars.max(self.min_substring_chars) {
            return Err(ExtractError::Configuration(format!(
                "merge window ({}) is smaller than the match thresholds",
                self.window_chars
            )));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(ExtractError::Configuration(format!(
                "similarity threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// How one segment boundary was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpliceKind {
    Exact,
    Lines,
    Fuzzy,
    Substring,
    Marked,
    /// The band has zero height; texts were joined without matching.
    NoOverlap,
    /// One side was empty.
    Trivial,
}

/// Outcome for the boundary between segment `upper` and `upper + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceRecord {
    pub upper: usize,
    pub kind: SpliceKind,
    /// Characters recognised as duplicate and emitted once (0 if none).
    pub matched_chars: usize,
}

/// A merged page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPage {
    pub text: String,
    pub splices: Vec<SpliceRecord>,
}

/// Merge the ordered texts of one page.
///
/// `bands[i]` describes the overlap between `texts[i]` and `texts[i + 1]`.
/// A missing band is treated as a non-empty overlap.
pub fn merge(texts: &[String], bands: &[OverlapBand], policy: &MergePolicy) -> MergedPage {
    let mut iter = texts.iter();
    let Some(first) = iter.next() else {
        return MergedPage {
            text: String::new(),
            splices: Vec::new(),
        };
    };

    let mut acc = first.trim().to_string();
    let mut splices = Vec::with_capacity(texts.len().saturating_sub(1));

    for (upper, next) in iter.enumerate() {
        let has_overlap = bands.get(upper).is_none_or(|b| b.height() > 0);
        let (merged, record) = merge_pair(&acc, next.trim(), upper, has_overlap, policy);
        debug!(
            "Boundary {}→{}: {:?} ({} chars matched)",
            upper,
            upper + 1,
            record.kind,
            record.matched_chars
        );
        if record.kind == SpliceKind::Marked {
            warn!(
                "No confident overlap between segments {} and {}; keeping both with a marker",
                upper,
                upper + 1
            );
        }
        acc = merged;
        splices.push(record);
    }

    MergedPage {
        text: acc,
        splices,
    }
}

/// Merge two adjacent texts (both already trimmed).
pub fn merge_pair(
    prev: &str,
    next: &str,
    upper: usize,
    has_overlap: bool,
    policy: &MergePolicy,
) -> (String, SpliceRecord) {
    let record = |kind, matched_chars| SpliceRecord {
        upper,
        kind,
        matched_chars,
    };

    if prev.is_empty() || next.is_empty() {
        let text = if prev.is_empty() { next } else { prev };
        return (text.to_string(), record(SpliceKind::Trivial, 0));
    }

    if !has_overlap {
        return (format!("{prev}\n{next}"), record(SpliceKind::NoOverlap, 0));
    }

    if let Some(k) = exact_overlap(prev, next, policy) {
        let matched = next[..k].chars().count();
        return (
            join_remainder(prev, &next[k..], ""),
            record(SpliceKind::Exact, matched),
        );
    }

    if let Some(m) = line_overlap(prev, next, policy) {
        return (
            join_remainder(prev, &next[m.next_bytes..], "\n"),
            record(m.kind, m.matched_chars),
        );
    }

    if let Some(m) = substring_overlap(prev, next, policy) {
        let mut text = prev[..m.prev_end].to_string();
        text.push_str(&next[m.next_end..]);
        return (text, record(SpliceKind::Substring, m.len));
    }

    (
        format!("{prev}\n{}\n{next}", policy.boundary_marker),
        record(SpliceKind::Marked, 0),
    )
}

fn join_remainder(prev: &str, rest: &str, sep: &str) -> String {
    let rest = if sep.is_empty() { rest } else { rest.trim_start() };
    if rest.is_empty() {
        return prev.to_string();
    }
    let mut out = String::with_capacity(prev.len() + sep.len() + rest.len());
    out.push_str(prev);
    out.push_str(sep);
    out.push_str(rest);
    out
}

/// Byte offset of the last `n` chars of `s`.
fn tail_start(s: &str, n: usize) -> usize {
    s.char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map_or(0, |(i, _)| i)
}

/// Byte length of the first `n` chars of `s`.
fn head_end(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

// ── Strategy 1: exact suffix/prefix ──────────────────────────────────────────

/// Longest prefix of `next` (in bytes) that `prev` ends with.
fn exact_overlap(prev: &str, next: &str, policy: &MergePolicy) -> Option<usize> {
    let tail = &prev[tail_start(prev, policy.window_chars)..];
    let limit = head_end(next, policy.window_chars).min(tail.len());

    // Candidate lengths on char boundaries of `next`, longest first.
    let mut ends: Vec<usize> = next
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= limit)
        .collect();
    ends.reverse();

    ends.into_iter()
        .find(|&k| tail.ends_with(&next[..k]))
        .filter(|&k| next[..k].chars().filter(|c| !c.is_whitespace()).count() >= policy.min_match_chars)
}

// ── Strategies 2 & 3: line blocks ────────────────────────────────────────────

struct LineMatch {
    kind: SpliceKind,
    /// Bytes of `next` covered by the matched head lines.
    next_bytes: usize,
    matched_chars: usize,
}

fn normalise_line(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn line_overlap(prev: &str, next: &str, policy: &MergePolicy) -> Option<LineMatch> {
    let tail = &prev[tail_start(prev, policy.window_chars)..];
    let prev_lines: Vec<String> = tail.lines().map(normalise_line).collect();

    // (normalised line, byte offset just past the line in `next`)
    let mut head: Vec<(String, usize)> = Vec::new();
    let mut offset = 0;
    for raw in next.split_inclusive('\n').take(policy.max_overlap_lines) {
        offset += raw.len();
        head.push((normalise_line(raw), offset));
    }

    let max_j = head.len().min(prev_lines.len());
    for j in (1..=max_j).rev() {
        let head_block: Vec<&str> = head[..j].iter().map(|(l, _)| l.as_str()).collect();
        let tail_block: Vec<&str> = prev_lines[prev_lines.len() - j..]
            .iter()
            .map(String::as_str)
            .collect();

        let content: usize = head_block.iter().map(|l| l.chars().filter(|c| *c != ' ').count()).sum();
        if content < policy.min_match_chars {
            continue;
        }

        let next_bytes = head[j - 1].1;
        if head_block == tail_block {
            return Some(LineMatch {
                kind: SpliceKind::Lines,
                next_bytes,
                matched_chars: content,
            });
        }

        let a = head_block.join("\n");
        let b = tail_block.join("\n");
        if similarity(&a, &b) >= policy.similarity_threshold {
            return Some(LineMatch {
                kind: SpliceKind::Fuzzy,
                next_bytes,
                matched_chars: content,
            });
        }
    }
    None
}

/// `2 × LCS / (|a| + |b|)` over characters: 1.0 for identical strings.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let mut row = vec![0u32; b.len() + 1];
    for ca in &a {
        let mut diag = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diag + 1
            } else {
                above.max(row[j])
            };
            diag = above;
        }
    }
    let lcs = row[b.len()] as f64;
    2.0 * lcs / (a.len() + b.len()) as f64
}

// ── Strategy 4: longest common substring ─────────────────────────────────────

struct SubstringMatch {
    /// Byte offset in `prev` just past the match.
    prev_end: usize,
    /// Byte offset in `next` just past the match.
    next_end: usize,
    len: usize,
}

fn substring_overlap(prev: &str, next: &str, policy: &MergePolicy) -> Option<SubstringMatch> {
    let tail_offset = tail_start(prev, policy.window_chars);
    let tail: Vec<(usize, char)> = prev[tail_offset..].char_indices().collect();
    let head: Vec<(usize, char)> = next[..head_end(next, policy.window_chars)]
        .char_indices()
        .collect();

    // A match must end at or after `tail_min` and start at or before `head_max`.
    let slack = policy.splice_slack_chars;
    let tail_min = tail
        .len()
        .saturating_sub(1 + seam_leftover(tail.iter().rev().map(|&(_, c)| c), slack));
    let head_max = seam_leftover(head.iter().map(|&(_, c)| c), slack);

    let mut row = vec![0u32; head.len() + 1];
    let mut best = (0u32, 0usize, 0usize); // (len, tail idx, head idx) of last char
    for (i, &(_, ct)) in tail.iter().enumerate() {
        let mut diag = 0;
        for (j, &(_, ch)) in head.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ct == ch { diag + 1 } else { 0 };
            let len = row[j + 1];
            let start = j + 1 - len as usize;
            if len > best.0 && i >= tail_min && start <= head_max {
                best = (len, i, j);
            }
            diag = above;
        }
    }

    let (len, ti, hj) = best;
    let len = len as usize;
    if len < policy.min_substring_chars {
        return None;
    }

    let (tb, tc) = tail[ti];
    let (hb, hc) = head[hj];
    Some(SubstringMatch {
        prev_end: tail_offset + tb + tc.len_utf8(),
        next_end: hb + hc.len_utf8(),
        len,
    })
}

/// How many characters, read from the seam outwards, may be cut off while
/// the cut, trimmed, stays within `slack` characters on a single line.
fn seam_leftover(from_seam: impl Iterator<Item = char>, slack: usize) -> usize {
    let mut allowed = 0;
    let mut text_len = 0;
    let mut gap = 0;
    let mut gap_has_newline = false;
    for (n, c) in from_seam.enumerate() {
        if c.is_whitespace() {
            gap += 1;
            gap_has_newline |= c == '\n';
        } else {
            let span = if text_len == 0 { 1 } else { text_len + gap + 1 };
            if (text_len > 0 && gap_has_newline) || span > slack {
                break;
            }
            text_len = span;
            gap = 0;
            gap_has_newline = false;
        }
        allowed = n + 1;
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(upper: usize, height: u32) -> OverlapBand {
        OverlapBand {
            upper,
            top: 100,
            bottom: 100 + height,
        }
    }

    fn texts(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_segment_is_identity() {
        let out = merge(&texts(&["Only segment.\nTwo lines."]), &[], &MergePolicy::default());
        assert_eq!(out.text, "Only segment.\nTwo lines.");
        assert!(out.splices.is_empty());
    }

    #[test]
    fn exact_overlap_emitted_once() {
        let a = "Intro paragraph.\nThe shared line of text";
        let b = "The shared line of text\nContinues below.";
        let out = merge(&texts(&[a, b]), &[band(0, 40)], &MergePolicy::default());
        assert_eq!(out.text, "Intro paragraph.\nThe shared line of text\nContinues below.");
        assert_eq!(out.text.matches("The shared line of text").count(), 1);
        assert_eq!(out.splices[0].kind, SpliceKind::Exact);
    }

    #[test]
    fn half_cut_line_is_completed() {
        let a = "Heading\nThe quick brown";
        let b = "The quick brown fox jumps over the lazy dog.\nNext line.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &MergePolicy::default());
        assert_eq!(
            out.text,
            "Heading\nThe quick brown fox jumps over the lazy dog.\nNext line."
        );
    }

    #[test]
    fn line_overlap_ignores_case_and_spacing() {
        let a = "Alpha beta gamma.\nTOTAL  AMOUNT DUE:   42";
        let b = "Total amount due: 42\nPayment terms apply.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &MergePolicy::default());
        assert_eq!(out.splices[0].kind, SpliceKind::Lines);
        assert_eq!(out.text, "Alpha beta gamma.\nTOTAL  AMOUNT DUE:   42\nPayment terms apply.");
    }

    #[test]
    fn near_identical_lines_use_fuzzy_match() {
        let a = "Section 4.\nThe committee approved the budget on Monday,";
        let b = "The committee approved the budget on Monday.\nVotes were unanimous.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &MergePolicy::default());
        assert_eq!(out.splices[0].kind, SpliceKind::Fuzzy);
        assert_eq!(
            out.text,
            "Section 4.\nThe committee approved the budget on Monday,\nVotes were unanimous."
        );
    }

    #[test]
    fn substring_splice_inside_lines() {
        let a = "Minutes\nxx the board resolved to extend the lease by two years";
        let b = "resolved to extend the lease by two years, effective May.";
        let policy = MergePolicy {
            similarity_threshold: 0.99,
            ..MergePolicy::default()
        };
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &policy);
        assert_eq!(out.splices[0].kind, SpliceKind::Exact);
        assert_eq!(out.text.matches("extend the lease").count(), 1);

        // A few characters of cut-line debris on either side of the seam.
        let a = "Minutes\nthe board resolved to extend the lease by two years ,.";
        let b = "~ resolved to extend the lease by two years, effective May.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &policy);
        assert_eq!(out.splices[0].kind, SpliceKind::Substring);
        assert_eq!(
            out.text,
            "Minutes\nthe board resolved to extend the lease by two years, effective May."
        );

        // Real words after the match are not debris: nothing is dropped.
        let a = "Minutes\nthe board resolved to extend the lease by two years [sic]";
        let b = "~ resolved to extend the lease by two years, effective May.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &policy);
        assert_eq!(out.splices[0].kind, SpliceKind::Marked);
        assert!(out.text.contains("[sic]"));
        assert!(out.text.contains("effective May."));
    }

    #[test]
    fn recurring_phrase_away_from_seam_is_not_a_splice_point() {
        let a = "Clause 1. UNIQUE-UPPER-ALPHA payments are made in accordance with the schedule below.\n\
                 Clause 2. UNIQUE-UPPER-BETA notices go to the registered address.\n\
                 Clause 3. The supplier shall";
        let b = "(continued) ship goods weekly.\n\
                 Clause 4. UNIQUE-LOWER-GAMMA deliveries proceed in accordance with the schedule below.\n\
                 Clause 5. Disputes are settled by arbitration.\n\
                 Clause 6. UNIQUE-LOWER-DELTA termination.";
        let out = merge(&texts(&[a, b]), &[band(0, 10)], &MergePolicy::default());

        assert_eq!(out.splices[0].kind, SpliceKind::Marked);
        for unique in [
            "UNIQUE-UPPER-ALPHA",
            "UNIQUE-UPPER-BETA",
            "UNIQUE-LOWER-GAMMA",
            "UNIQUE-LOWER-DELTA",
        ] {
            assert!(out.text.contains(unique), "{unique} was dropped");
        }
        assert_eq!(out.text.matches("in accordance with the schedule below.").count(), 2);
        assert!(out.text.find("Clause 3.").unwrap() < out.text.find(DEFAULT_BOUNDARY_MARKER).unwrap());
    }

    #[test]
    fn seam_leftover_stops_at_text_on_another_line() {
        assert_eq!(seam_leftover(".,".chars(), 4), 2);
        assert_eq!(seam_leftover("  ab".chars(), 4), 4);
        assert_eq!(seam_leftover("ab\ncd".chars(), 4), 3);
        assert_eq!(seam_leftover("[sic] and more".chars(), 4), 4);
        assert_eq!(seam_leftover("abc".chars(), 0), 0);
    }

    #[test]
    fn divergent_texts_keep_both_with_marker() {
        let a = "Completely different opening text.";
        let b = "Nothing in common with the first piece.";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &MergePolicy::default());
        assert_eq!(out.splices[0].kind, SpliceKind::Marked);
        assert!(out.text.contains(a));
        assert!(out.text.contains(b));
        assert!(out.text.contains(DEFAULT_BOUNDARY_MARKER));
        assert!(out.text.find(a).unwrap() < out.text.find(b).unwrap());
    }

    #[test]
    fn short_overlap_below_threshold_is_not_spliced() {
        let a = "Ends with a word";
        let b = "word starts the next";
        let out = merge(&texts(&[a, b]), &[band(0, 20)], &MergePolicy::default());
        assert_eq!(out.splices[0].kind, SpliceKind::Marked);
    }

    #[test]
    fn zero_height_band_joins_without_matching() {
        let out = merge(&texts(&["one", "two"]), &[band(0, 0)], &MergePolicy::default());
        assert_eq!(out.text, "one\ntwo");
        assert_eq!(out.splices[0].kind, SpliceKind::NoOverlap);
    }

    #[test]
    fn empty_segments_are_trivial() {
        let out = merge(&texts(&["", "body text", "  "]), &[band(0, 9), band(1, 9)], &MergePolicy::default());
        assert_eq!(out.text, "body text");
        assert!(out.splices.iter().all(|s| s.kind == SpliceKind::Trivial));
    }

    #[test]
    fn folds_left_to_right_over_many_segments() {
        let parts = [
            "Line one of the page.\nLine two crosses the boundary",
            "Line two crosses the boundary\nLine three is in the middle\nLine four crosses again",
            "Line four crosses again\nLine five ends the page.",
        ];
        let out = merge(&texts(&parts), &[band(0, 10), band(1, 10)], &MergePolicy::default());
        assert_eq!(
            out.text,
            "Line one of the page.\nLine two crosses the boundary\nLine three is in the middle\n\
             Line four crosses again\nLine five ends the page."
        );
        assert_eq!(out.splices.len(), 2);
    }

    #[test]
    fn unicode_boundaries_are_respected() {
        let a = "Préambule\nDroits de l’homme — article premier";
        let b = "Droits de l’homme — article premier\nTous les êtres humains naissent libres.";
        let out = merge(&texts(&[a, b]), &[band(0, 10)], &MergePolicy::default());
        assert_eq!(out.text.matches("article premier").count(), 1);
        assert!(out.text.ends_with("naissent libres."));
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("abc", "abc") - 1.0).abs() < f64::EPSILON);
        assert_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn policy_validation() {
        assert!(MergePolicy::default().validate().is_ok());
        let bad = MergePolicy {
            min_match_chars: 0,
            ..MergePolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = MergePolicy {
            window_chars: 5,
            ..MergePolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
