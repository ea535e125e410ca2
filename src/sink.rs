//! Output sink: live events emitted while a document is being extracted.
//!
//! Inject an [`Arc<dyn OutputSink>`] via
//! [`crate::config::ExtractionConfigBuilder::sink`] to receive progress and,
//! when streaming is on, the raw text chunks of every segment as the model
//! produces them.
//!
//! Chunks are *pre-merge*: the text of an overlap band shows up once per
//! neighbouring segment. The de-duplicated record is the
//! [`crate::output::DocumentTranscript`] returned at the end of the run, and
//! the per-page merged text delivered to [`OutputSink::on_page_complete`].
//!
//! # Thread safety
//!
//! Segments of one page run concurrently, so `on_segment_*` methods may be
//! called from several tasks at once and chunks of different segments may
//! interleave. Implementations guard shared state themselves.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2text::{ExtractionConfig, OutputSink};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ChunkCounter(AtomicUsize);
//!
//! impl OutputSink for ChunkCounter {
//!     fn on_segment_chunk(&self, _page: usize, _segment: usize, _chunk: &str) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .stream(true)
//!     .sink(Arc::new(ChunkCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::PageTranscript;
use std::io::Write;
use std::sync::Mutex;

/// Receiver of extraction events. All methods default to no-ops.
pub trait OutputSink: Send + Sync {
    /// Called once the page list is known, before the first page is planned.
    fn on_document_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called after a page has been planned, before its segments are sent.
    fn on_page_start(&self, page_num: usize, segment_count: usize) {
        let _ = (page_num, segment_count);
    }

    /// Called when the request for a segment is about to be sent.
    fn on_segment_start(&self, page_num: usize, segment: usize) {
        let _ = (page_num, segment);
    }

    /// A piece of streamed model output. Only called in streaming mode.
    fn on_segment_chunk(&self, page_num: usize, segment: usize, chunk: &str) {
        let _ = (page_num, segment, chunk);
    }

    /// The full text of a segment is available.
    fn on_segment_complete(&self, page_num: usize, segment: usize, text_len: usize) {
        let _ = (page_num, segment, text_len);
    }

    /// A page was merged and appended to the document transcript.
    fn on_page_complete(&self, page: &PageTranscript) {
        let _ = page;
    }

    /// A page failed. Under fail-fast this is the last page event.
    fn on_page_error(&self, page_num: usize, error: &str) {
        let _ = (page_num, error);
    }

    /// Called once after the last page was attempted.
    fn on_document_complete(&self, pages_completed: usize, pages_failed: usize) {
        let _ = (pages_completed, pages_failed);
    }
}

/// A sink that ignores every event.
pub struct NoopSink;

impl OutputSink for NoopSink {}

/// Writes streamed chunks to any `Write` as they arrive, flushing after each.
///
/// Each segment gets a short header line so interleaved output from
/// concurrent segments stays readable.
pub struct WriterSink<W: Write + Send> {
    out: Mutex<WriterState<W>>,
}

struct WriterState<W> {
    writer: W,
    current: Option<(usize, usize)>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: Mutex::new(WriterState {
                writer,
                current: None,
            }),
        }
    }

    /// Recover the writer, e.g. to inspect a buffer in tests.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(state) => state.writer,
            Err(poisoned) => poisoned.into_inner().writer,
        }
    }
}

impl<W: Write + Send> OutputSink for WriterSink<W> {
    fn on_segment_chunk(&self, page_num: usize, segment: usize, chunk: &str) {
        let Ok(mut state) = self.out.lock() else {
            return;
        };
        if state.current != Some((page_num, segment)) {
            let lead = if state.current.is_some() { "\n" } else { "" };
            let _ = writeln!(state.writer, "{lead}[page {page_num} · segment {segment}]");
            state.current = Some((page_num, segment));
        }
        // Display is best-effort; a closed pipe must not abort extraction.
        let _ = state.writer.write_all(chunk.as_bytes());
        let _ = state.writer.flush();
    }

    fn on_document_complete(&self, _pages_completed: usize, _pages_failed: usize) {
        if let Ok(mut state) = self.out.lock() {
            if state.current.take().is_some() {
                let _ = state.writer.write_all(b"\n");
                let _ = state.writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracking {
        chunks: AtomicUsize,
        errors: AtomicUsize,
    }

    impl OutputSink for Tracking {
        fn on_segment_chunk(&self, _page: usize, _segment: usize, _chunk: &str) {
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_sink_does_not_panic() {
        let sink = NoopSink;
        sink.on_document_start(2);
        sink.on_page_start(1, 4);
        sink.on_segment_chunk(1, 0, "abc");
        sink.on_page_error(2, "boom");
        sink.on_document_complete(1, 1);
    }

    #[test]
    fn tracking_sink_counts() {
        let tracker = Arc::new(Tracking {
            chunks: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let sink: Arc<dyn OutputSink> = tracker.clone();
        sink.on_segment_chunk(1, 0, "a");
        sink.on_segment_chunk(1, 0, "b");
        sink.on_page_error(1, "x");

        assert_eq!(tracker.chunks.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writer_sink_labels_segments() {
        let sink = WriterSink::new(Vec::new());
        sink.on_segment_chunk(1, 0, "Hello ");
        sink.on_segment_chunk(1, 0, "world");
        sink.on_segment_chunk(1, 1, "Next");
        sink.on_document_complete(1, 0);

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "[page 1 · segment 0]\nHello world\n[page 1 · segment 1]\nNext\n"
        );
    }
}
