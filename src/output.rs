//! Output types: page and document transcripts, metadata, statistics.

use crate::config::PageSeparator;
use crate::pipeline::merge::{SpliceKind, SpliceRecord};
use serde::{Deserialize, Serialize};

/// Merged text for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTranscript {
    /// 1-indexed page number.
    pub page_num: usize,
    /// De-duplicated text of all segments.
    pub text: String,
    /// Number of segments the page was cut into.
    pub segment_count: usize,
    /// How each segment boundary was resolved, in boundary order.
    pub splices: Vec<SpliceRecord>,
    /// Wall-clock time from planning to merge.
    pub duration_ms: u64,
}

impl PageTranscript {
    /// Boundaries that fell back to a marked concatenation.
    pub fn marked_boundaries(&self) -> usize {
        self.splices
            .iter()
            .filter(|s| s.kind == SpliceKind::Marked)
            .count()
    }
}

/// A page that could not be transcribed (best-effort mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page_num: usize,
    /// Failing segment, when the failure came from an inference call.
    pub segment: Option<usize>,
    pub error: String,
}

/// Ordered page transcripts of one document.
///
/// Built by the assembler in page order; once returned it is only read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentTranscript {
    /// Input path or URL as given by the caller.
    pub source: String,
    pub pages: Vec<PageTranscript>,
    pub failures: Vec<PageFailure>,
}

impl DocumentTranscript {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pages: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Render the plain-text document.
    ///
    /// Each page is preceded by its marker (if any) and pages are separated
    /// by a blank line. A failed page is rendered as a one-line notice so the
    /// gap is visible in the text.
    pub fn render(&self, separator: &PageSeparator) -> String {
        enum Entry<'a> {
            Page(&'a PageTranscript),
            Failed(&'a PageFailure),
        }

        let mut entries: Vec<(usize, Entry<'_>)> = self
            .pages
            .iter()
            .map(|p| (p.page_num, Entry::Page(p)))
            .chain(self.failures.iter().map(|f| (f.page_num, Entry::Failed(f))))
            .collect();
        entries.sort_by_key(|(n, _)| *n);

        let mut parts: Vec<String> = Vec::with_capacity(entries.len());
        for (page_num, entry) in entries {
            let body = match entry {
                Entry::Page(p) => p.text.clone(),
                Entry::Failed(f) => format!("[page {} failed: {}]", f.page_num, f.error),
            };
            let part = match separator.render(page_num) {
                Some(marker) if body.is_empty() => marker,
                Some(marker) => format!("{marker}\n{body}"),
                None => body,
            };
            parts.push(part);
        }

        let mut out = parts.join("\n\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Basic PDF document metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Splice outcome tallies across all pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceCounts {
    pub exact: usize,
    pub lines: usize,
    pub fuzzy: usize,
    pub substring: usize,
    pub marked: usize,
    pub no_overlap: usize,
    pub trivial: usize,
}

impl SpliceCounts {
    pub fn record(&mut self, kind: SpliceKind) {
        let slot = match kind {
            SpliceKind::Exact => &mut self.exact,
            SpliceKind::Lines => &mut self.lines,
            SpliceKind::Fuzzy => &mut self.fuzzy,
            SpliceKind::Substring => &mut self.substring,
            SpliceKind::Marked => &mut self.marked,
            SpliceKind::NoOverlap => &mut self.no_overlap,
            SpliceKind::Trivial => &mut self.trivial,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.exact
            + self.lines
            + self.fuzzy
            + self.substring
            + self.marked
            + self.no_overlap
            + self.trivial
    }
}

/// Run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the document.
    pub total_pages: usize,
    /// Pages selected for extraction.
    pub selected_pages: usize,
    pub processed_pages: usize,
    pub failed_pages: usize,
    /// Segment calls that completed.
    pub total_segments: usize,
    pub splices: SpliceCounts,
    pub render_duration_ms: u64,
    pub inference_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ExtractionStats {
    /// Tally segments and splice outcomes of a finished transcript.
    pub fn tally(&mut self, transcript: &DocumentTranscript) {
        self.processed_pages = transcript.pages.len();
        self.failed_pages = transcript.failures.len();
        self.total_segments = transcript.pages.iter().map(|p| p.segment_count).sum();
        self.splices = SpliceCounts::default();
        for splice in transcript.pages.iter().flat_map(|p| &p.splices) {
            self.splices.record(splice.kind);
        }
    }
}

/// Everything a completed run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Rendered document text (see [`DocumentTranscript::render`]).
    pub text: String,
    pub transcript: DocumentTranscript,
    pub metadata: DocumentMetadata,
    pub stats: ExtractionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize, text: &str) -> PageTranscript {
        PageTranscript {
            page_num: n,
            text: text.into(),
            segment_count: 2,
            splices: vec![SpliceRecord {
                upper: 0,
                kind: SpliceKind::Exact,
                matched_chars: 14,
            }],
            duration_ms: 5,
        }
    }

    #[test]
    fn render_with_markers_in_page_order() {
        let doc = DocumentTranscript {
            source: "a.pdf".into(),
            pages: vec![page(1, "First page."), page(2, "Second page.")],
            failures: vec![],
        };
        assert_eq!(
            doc.render(&PageSeparator::Marker),
            "--- page 1 ---\nFirst page.\n\n--- page 2 ---\nSecond page.\n"
        );
    }

    #[test]
    fn render_without_markers() {
        let doc = DocumentTranscript {
            source: "a.pdf".into(),
            pages: vec![page(1, "A"), page(2, "B")],
            failures: vec![],
        };
        assert_eq!(doc.render(&PageSeparator::None), "A\n\nB\n");
    }

    #[test]
    fn failed_page_is_visible_in_place() {
        let doc = DocumentTranscript {
            source: "a.pdf".into(),
            pages: vec![page(1, "A"), page(3, "C")],
            failures: vec![PageFailure {
                page_num: 2,
                segment: Some(1),
                error: "model error: overloaded".into(),
            }],
        };
        let text = doc.render(&PageSeparator::Marker);
        let a = text.find("A").unwrap();
        let failed = text.find("[page 2 failed").unwrap();
        let c = text.find("--- page 3 ---").unwrap();
        assert!(a < failed && failed < c, "got: {text}");
    }

    #[test]
    fn empty_transcript_renders_empty() {
        assert_eq!(DocumentTranscript::new("x").render(&PageSeparator::Marker), "");
    }

    #[test]
    fn stats_tally() {
        let doc = DocumentTranscript {
            source: "a.pdf".into(),
            pages: vec![page(1, "A"), page(2, "B")],
            failures: vec![],
        };
        let mut stats = ExtractionStats::default();
        stats.tally(&doc);
        assert_eq!(stats.processed_pages, 2);
        assert_eq!(stats.total_segments, 4);
        assert_eq!(stats.splices.exact, 2);
        assert_eq!(stats.splices.total(), 2);
    }

    #[test]
    fn transcript_serialises() {
        let json = serde_json::to_string(&page(1, "x")).unwrap();
        assert!(json.contains("\"kind\":\"exact\""), "got: {json}");
    }
}
