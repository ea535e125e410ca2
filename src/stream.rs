//! Event-stream API: observe an extraction as it runs.
//!
//! [`extract_stream`] runs the same pipeline as [`crate::extract`] on a
//! spawned task and yields [`ExtractionEvent`]s: raw segment chunks (when
//! `config.stream` is on), merged pages as they are appended, page
//! failures, and finally [`ExtractionEvent::Done`] with the full result.
//!
//! Chunk events are pre-merge, so overlap text shows up twice there. Use
//! the `PageComplete` events or the final output for the de-duplicated text.
//!
//! Dropping the stream cancels the run: the next callback that finds the
//! receiver gone trips the run's [`CancelToken`], which also aborts any
//! segment calls still in flight.

use crate::assemble::{extract_with, resolve_backend};
use crate::cancel::CancelToken;
use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::output::{ExtractionOutput, PageTranscript};
use crate::pipeline::infer::InferenceBackend;
use crate::pipeline::render::{PageRasterizer, PdfiumRasterizer};
use crate::sink::OutputSink;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info};

/// One observable step of a running extraction.
#[derive(Debug)]
pub enum ExtractionEvent {
    /// A piece of streamed model output for one segment.
    Chunk {
        page: usize,
        segment: usize,
        text: String,
    },
    /// A page was merged and appended.
    PageComplete(PageTranscript),
    /// A page failed; under fail-fast, `Done` follows with the error.
    PageFailed { page: usize, error: String },
    /// The run finished. Always the last event.
    Done(Result<ExtractionOutput, ExtractError>),
}

/// A boxed stream of extraction events.
pub type EventStream = Pin<Box<dyn Stream<Item = ExtractionEvent> + Send>>;

/// Forwards sink callbacks into the event channel, and on to the caller's
/// own sink if one was configured. Cancels the run once the receiver is
/// gone.
struct ChannelSink {
    tx: mpsc::UnboundedSender<ExtractionEvent>,
    inner: Option<Arc<dyn OutputSink>>,
    cancel: CancelToken,
}

impl ChannelSink {
    fn forward(&self, event: ExtractionEvent) {
        if self.tx.send(event).is_err() {
            self.stop();
        }
    }

    fn check_listener(&self) {
        if self.tx.is_closed() {
            self.stop();
        }
    }

    fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Event stream dropped, cancelling extraction");
            self.cancel.cancel();
        }
    }
}

impl OutputSink for ChannelSink {
    fn on_document_start(&self, total_pages: usize) {
        if let Some(inner) = &self.inner {
            inner.on_document_start(total_pages);
        }
    }

    fn on_page_start(&self, page_num: usize, segment_count: usize) {
        self.check_listener();
        if let Some(inner) = &self.inner {
            inner.on_page_start(page_num, segment_count);
        }
    }

    fn on_segment_start(&self, page_num: usize, segment: usize) {
        self.check_listener();
        if let Some(inner) = &self.inner {
            inner.on_segment_start(page_num, segment);
        }
    }

    fn on_segment_chunk(&self, page_num: usize, segment: usize, chunk: &str) {
        self.forward(ExtractionEvent::Chunk {
            page: page_num,
            segment,
            text: chunk.to_string(),
        });
        if let Some(inner) = &self.inner {
            inner.on_segment_chunk(page_num, segment, chunk);
        }
    }

    fn on_segment_complete(&self, page_num: usize, segment: usize, text_len: usize) {
        if let Some(inner) = &self.inner {
            inner.on_segment_complete(page_num, segment, text_len);
        }
    }

    fn on_page_complete(&self, page: &PageTranscript) {
        self.forward(ExtractionEvent::PageComplete(page.clone()));
        if let Some(inner) = &self.inner {
            inner.on_page_complete(page);
        }
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        self.forward(ExtractionEvent::PageFailed {
            page: page_num,
            error: error.to_string(),
        });
        if let Some(inner) = &self.inner {
            inner.on_page_error(page_num, error);
        }
    }

    fn on_document_complete(&self, pages_completed: usize, pages_failed: usize) {
        if let Some(inner) = &self.inner {
            inner.on_document_complete(pages_completed, pages_failed);
        }
    }
}

/// Run an extraction in the background and observe it as a stream.
///
/// Must be called inside a tokio runtime. Configuration and backend errors
/// are reported through the final `Done` event like any other error.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2text::{extract_stream, CancelToken, ExtractionConfig, ExtractionEvent};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::builder().stream(true).build()?;
/// let mut events = extract_stream("scan.pdf", config, CancelToken::new());
/// while let Some(event) = events.next().await {
///     match event {
///         ExtractionEvent::Chunk { text, .. } => eprint!("{text}"),
///         ExtractionEvent::Done(result) => println!("{}", result?.text),
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn extract_stream(input: impl Into<String>, config: ExtractionConfig, cancel: CancelToken) -> EventStream {
    let rasterizer: Arc<dyn PageRasterizer> = Arc::new(PdfiumRasterizer::from_config(&config));
    match resolve_backend(&config) {
        Ok(backend) => extract_stream_with(input, config, rasterizer, backend, cancel),
        Err(e) => Box::pin(tokio_stream::once(ExtractionEvent::Done(Err(e)))),
    }
}

/// [`extract_stream`] with explicit collaborators.
pub fn extract_stream_with(
    input: impl Into<String>,
    mut config: ExtractionConfig,
    rasterizer: Arc<dyn PageRasterizer>,
    backend: Arc<dyn InferenceBackend>,
    cancel: CancelToken,
) -> EventStream {
    let input = input.into();
    let (tx, rx) = mpsc::unbounded_channel();

    config.sink = Some(Arc::new(ChannelSink {
        tx: tx.clone(),
        inner: config.sink.take(),
        cancel: cancel.clone(),
    }));

    tokio::spawn(async move {
        info!("Starting streaming extraction: {}", input);
        let result = extract_with(&input, &config, rasterizer.as_ref(), backend, &cancel).await;
        let _ = tx.send(ExtractionEvent::Done(result));
    });

    Box::pin(UnboundedReceiverStream::new(rx))
}
