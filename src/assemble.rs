//! Document assembly: the per-page loop and the public entry points.
//!
//! Pages are processed strictly one after another, in source order. For each
//! page the assembler plans the segments, dispatches them (concurrently, up
//! to `concurrency`), waits for every segment text, merges them and appends
//! the page to the transcript. A page's lifecycle is tracked by
//! [`PageState`]; every transition is logged at DEBUG.
//!
//! Failure handling follows [`FailurePolicy`]: fail-fast stops at the first
//! failed page without dispatching anything for later pages, best-effort
//! records the failure and moves on.

use crate::cancel::CancelToken;
use crate::config::{BackendKind, ExtractionConfig, FailurePolicy};
use crate::error::{BackendError, ExtractError, InferenceError};
use crate::output::{
    DocumentMetadata, DocumentTranscript, ExtractionOutput, ExtractionStats, PageFailure, PageTranscript,
};
use crate::pipeline::encode::encode_segment;
use crate::pipeline::infer::{dispatch_segments, DispatchError, InferenceBackend, InferenceRequest, SamplingOptions};
use crate::pipeline::llm::ProviderBackend;
use crate::pipeline::merge::merge;
use crate::pipeline::ollama::OllamaBackend;
use crate::pipeline::postprocess::clean_segment;
use crate::pipeline::render::{PageImage, PageRasterizer, PdfiumRasterizer};
use crate::pipeline::segment::{crop_segment, plan};
use crate::pipeline::input;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of one page inside the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Planned,
    SegmentsDispatched,
    ResultsCollected,
    Merged,
    Appended,
    Failed,
}

impl PageState {
    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, next),
            (Planned, SegmentsDispatched)
                | (SegmentsDispatched, ResultsCollected)
                | (ResultsCollected, Merged)
                | (Merged, Appended)
                | (Planned, Failed)
                | (SegmentsDispatched, Failed)
                | (ResultsCollected, Failed)
        )
    }
}

struct PageTracker {
    page_num: usize,
    state: PageState,
}

impl PageTracker {
    fn new(page_num: usize) -> Self {
        debug!("Page {}: {:?}", page_num, PageState::Planned);
        Self {
            page_num,
            state: PageState::Planned,
        }
    }

    fn advance(&mut self, next: PageState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal page transition {:?} → {:?}",
            self.state,
            next
        );
        debug!("Page {}: {:?} → {:?}", self.page_num, self.state, next);
        self.state = next;
    }
}

/// Why a single page did not make it into the transcript.
enum PageError {
    Inference(InferenceError),
    Cancelled,
    Fatal(ExtractError),
}

/// Everything a page needs besides its image.
struct PageContext<'a> {
    config: &'a ExtractionConfig,
    backend: Arc<dyn InferenceBackend>,
    prompt: Arc<str>,
    options: Arc<SamplingOptions>,
    timeout: Duration,
    cancel: &'a CancelToken,
}

/// Extract the text of a PDF file or URL.
///
/// Uses pdfium for rasterising and the backend selected by
/// `config.backend` (or `config.backend_override`).
///
/// # Errors
/// Returns `Err` for configuration and load errors, and for the first failed
/// page under [`FailurePolicy::FailFast`].
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2text::{extract, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExtractionConfig::builder().num_splits(4).build()?;
/// let output = extract("scan.pdf", &config).await?;
/// println!("{}", output.text);
/// # Ok(())
/// # }
/// ```
pub async fn extract(input: impl AsRef<str>, config: &ExtractionConfig) -> Result<ExtractionOutput, ExtractError> {
    extract_cancellable(input, config, &CancelToken::new()).await
}

/// [`extract`] with a caller-held [`CancelToken`].
pub async fn extract_cancellable(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, ExtractError> {
    config.validate()?;
    let backend = resolve_backend(config)?;
    let rasterizer = PdfiumRasterizer::from_config(config);
    extract_with(input.as_ref(), config, &rasterizer, backend, cancel).await
}

/// Run the pipeline with explicit collaborators.
///
/// This is the seam used by tests and by callers that bring their own
/// rasteriser or backend.
pub async fn extract_with(
    input_str: &str,
    config: &ExtractionConfig,
    rasterizer: &dyn PageRasterizer,
    backend: Arc<dyn InferenceBackend>,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, ExtractError> {
    let total_start = Instant::now();

    // ── Step 1: Validate before any I/O ──────────────────────────────────
    config.validate()?;
    info!("Starting extraction: {} (backend {})", input_str, backend.name());

    // ── Step 2: Resolve input ────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pdf_path = resolved.path().to_path_buf();
    let password = config.password.as_deref();

    // ── Step 3: Metadata and page selection ──────────────────────────────
    let metadata = rasterizer.inspect(&pdf_path, password).await?;
    let page_indices = config.pages.to_indices(metadata.page_count);
    if page_indices.is_empty() {
        return Err(ExtractError::PageOutOfRange {
            page: 0,
            total: metadata.page_count,
        });
    }
    info!(
        "PDF has {} pages, extracting {} with {} segments each",
        metadata.page_count,
        page_indices.len(),
        config.num_splits
    );

    let sink = config.sink.clone();
    if let Some(sink) = &sink {
        sink.on_document_start(page_indices.len());
    }

    let ctx = PageContext {
        config,
        backend,
        prompt: Arc::from(config.effective_prompt()),
        options: Arc::new(SamplingOptions::from_config(config)),
        timeout: Duration::from_secs(config.api_timeout_secs),
        cancel,
    };

    let mut transcript = DocumentTranscript::new(input_str);
    let mut stats = ExtractionStats {
        total_pages: metadata.page_count,
        selected_pages: page_indices.len(),
        ..ExtractionStats::default()
    };

    // ── Step 4: Pages in source order ────────────────────────────────────
    for &idx in &page_indices {
        let page_num = idx + 1;
        if cancel.is_cancelled() {
            return Err(cancelled(&transcript, &sink));
        }

        let render_start = Instant::now();
        let page = match rasterizer.render(&pdf_path, password, &[idx]).await {
            Ok(mut pages) if !pages.is_empty() => pages.swap_remove(0),
            Ok(_) => {
                return Err(ExtractError::Internal(format!(
                    "rasteriser returned no image for page {page_num}"
                )))
            }
            Err(e) => {
                stats.render_duration_ms += render_start.elapsed().as_millis() as u64;
                if let Some(sink) = &sink {
                    sink.on_page_error(page_num, &e.to_string());
                }
                match config.failure_policy {
                    FailurePolicy::FailFast => return Err(e),
                    FailurePolicy::BestEffort => {
                        warn!("Skipping page {}: {}", page_num, e);
                        transcript.failures.push(PageFailure {
                            page_num,
                            segment: None,
                            error: e.to_string(),
                        });
                        continue;
                    }
                }
            }
        };
        stats.render_duration_ms += render_start.elapsed().as_millis() as u64;

        let infer_start = Instant::now();
        let outcome = process_page(page, &ctx).await;
        stats.inference_duration_ms += infer_start.elapsed().as_millis() as u64;

        match outcome {
            Ok(page) => {
                info!(
                    "Page {}: {} segments merged, {} chars",
                    page.page_num,
                    page.segment_count,
                    page.text.len()
                );
                if let Some(sink) = &sink {
                    sink.on_page_complete(&page);
                }
                transcript.pages.push(page);
            }
            Err(PageError::Cancelled) => return Err(cancelled(&transcript, &sink)),
            Err(PageError::Fatal(e)) => return Err(e),
            Err(PageError::Inference(e)) => {
                if let Some(sink) = &sink {
                    sink.on_page_error(page_num, &e.to_string());
                }
                match config.failure_policy {
                    FailurePolicy::FailFast => {
                        if let Some(sink) = &sink {
                            sink.on_document_complete(transcript.pages.len(), 1);
                        }
                        let partial = config.keep_partial.then(|| Box::new(transcript));
                        return Err(ExtractError::Inference { source: e, partial });
                    }
                    FailurePolicy::BestEffort => {
                        warn!("Page {} failed, continuing: {}", page_num, e);
                        transcript.failures.push(PageFailure {
                            page_num,
                            segment: Some(e.segment),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    // ── Step 5: Render the document and compute stats ────────────────────
    let text = transcript.render(&config.page_separator);
    stats.tally(&transcript);
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    if let Some(sink) = &sink {
        sink.on_document_complete(stats.processed_pages, stats.failed_pages);
    }
    info!(
        "Extraction complete: {}/{} pages, {} failed, {}ms",
        stats.processed_pages, stats.selected_pages, stats.failed_pages, stats.total_duration_ms
    );

    Ok(ExtractionOutput {
        text,
        transcript,
        metadata,
        stats,
    })
}

fn cancelled(transcript: &DocumentTranscript, sink: &Option<Arc<dyn crate::sink::OutputSink>>) -> ExtractError {
    let pages_completed = transcript.pages.len();
    warn!("Extraction cancelled after {} pages", pages_completed);
    if let Some(sink) = sink {
        sink.on_document_complete(pages_completed, 0);
    }
    ExtractError::Cancelled { pages_completed }
}

/// Plan, dispatch, collect and merge one page.
async fn process_page(page: PageImage, ctx: &PageContext<'_>) -> Result<PageTranscript, PageError> {
    let start = Instant::now();
    let page_num = page.page_num;
    let config = ctx.config;

    let mut tracker = PageTracker::new(page_num);
    let segment_plan = match plan(page.height(), config.num_splits, config.overlap_ratio) {
        Ok(p) => p,
        Err(e) => {
            tracker.advance(PageState::Failed);
            return Err(PageError::Fatal(e));
        }
    };
    if let Some(sink) = &config.sink {
        sink.on_page_start(page_num, segment_plan.len());
    }

    let mut requests = Vec::with_capacity(segment_plan.len());
    for segment in &segment_plan.segments {
        let strip = crop_segment(&page.image, segment);
        let image = match encode_segment(&strip) {
            Ok(image) => image,
            Err(e) => {
                tracker.advance(PageState::Failed);
                return Err(PageError::Inference(InferenceError::new(
                    page_num,
                    segment.index,
                    BackendError::Encoding(e.to_string()),
                )));
            }
        };
        requests.push(InferenceRequest {
            page: page_num,
            segment: segment.index,
            image,
            prompt: Arc::clone(&ctx.prompt),
            options: Arc::clone(&ctx.options),
        });
    }
    // The strips are encoded; the page bitmap is no longer needed.
    drop(page);

    tracker.advance(PageState::SegmentsDispatched);
    let texts = match dispatch_segments(
        Arc::clone(&ctx.backend),
        requests,
        config.concurrency,
        config.stream,
        ctx.timeout,
        config.sink.clone(),
        ctx.cancel,
    )
    .await
    {
        Ok(texts) => texts,
        Err(DispatchError::Failed(e)) => {
            tracker.advance(PageState::Failed);
            return Err(PageError::Inference(e));
        }
        Err(DispatchError::Cancelled) => {
            tracker.advance(PageState::Failed);
            return Err(PageError::Cancelled);
        }
    };
    tracker.advance(PageState::ResultsCollected);

    let cleaned: Vec<String> = texts.iter().map(|t| clean_segment(t)).collect();
    let merged = merge(&cleaned, &segment_plan.bands, &config.merge);
    tracker.advance(PageState::Merged);

    let transcript = PageTranscript {
        page_num,
        text: merged.text,
        segment_count: segment_plan.len(),
        splices: merged.splices,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    tracker.advance(PageState::Appended);
    Ok(transcript)
}

/// Pick the inference backend named by the configuration.
pub fn resolve_backend(config: &ExtractionConfig) -> Result<Arc<dyn InferenceBackend>, ExtractError> {
    if let Some(backend) = &config.backend_override {
        return Ok(Arc::clone(backend));
    }
    match &config.backend {
        BackendKind::Ollama { base_url } => {
            info!("Using Ollama at {} with model {}", base_url, config.model);
            Ok(Arc::new(OllamaBackend::new(base_url.clone())?))
        }
        BackendKind::Provider { name } => Ok(Arc::new(ProviderBackend::from_name(name, &config.model)?)),
    }
}

/// Extract and write the rendered text to `output_path`.
///
/// The file is written atomically (temp file + rename), so a failed run
/// never leaves a truncated output behind.
pub async fn extract_to_file(
    input: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, ExtractError> {
    let output = extract(input, config).await?;
    write_atomic(output_path.as_ref(), output.text.as_bytes()).await?;
    Ok(output.stats)
}

/// Write `contents` to `path` via a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ExtractError> {
    let fail = |source: std::io::Error| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let mut tmp_name: OsString = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, contents).await.map_err(fail)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(fail(e));
    }
    Ok(())
}

/// Blocking wrapper around [`extract`]. Creates its own tokio runtime.
pub fn extract_sync(input: impl AsRef<str>, config: &ExtractionConfig) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(extract(input, config))
}

/// Read document metadata without running any inference.
pub async fn inspect(input: impl AsRef<str>, config: &ExtractionConfig) -> Result<DocumentMetadata, ExtractError> {
    let resolved = input::resolve_input(input.as_ref(), config.download_timeout_secs).await?;
    PdfiumRasterizer::from_config(config)
        .inspect(resolved.path(), config.password.as_deref())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_state_happy_path() {
        use PageState::*;
        let path = [Planned, SegmentsDispatched, ResultsCollected, Merged, Appended];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} → {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn page_state_rejects_skips_and_late_failures() {
        use PageState::*;
        assert!(!Planned.can_advance_to(Merged));
        assert!(!Merged.can_advance_to(Failed));
        assert!(!Appended.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Appended));
        assert!(SegmentsDispatched.can_advance_to(Failed));
    }

    #[tokio::test]
    async fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("nested").join("out.txt.tmp").exists());
    }

    #[test]
    fn override_backend_wins() {
        struct Fixed;

        #[async_trait::async_trait]
        impl InferenceBackend for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }

            async fn infer(&self, _request: &InferenceRequest) -> Result<String, BackendError> {
                Ok(String::new())
            }
        }

        let config = ExtractionConfig::builder()
            .backend_override(Arc::new(Fixed))
            .build()
            .unwrap();
        assert_eq!(resolve_backend(&config).unwrap().name(), "fixed");
    }

    #[test]
    fn ollama_backend_by_default() {
        let config = ExtractionConfig::builder()
            .backend(BackendKind::Ollama {
                base_url: "http://127.0.0.1:11434".into(),
            })
            .build()
            .unwrap();
        assert_eq!(resolve_backend(&config).unwrap().name(), "ollama");
    }
}
