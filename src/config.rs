//! Configuration types for segmented PDF text extraction.
//!
//! Every knob lives in [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]. The config is set once at startup (from CLI
//! flags or by a library caller) and passed by reference into the assembler;
//! nothing reads process-wide state after that.

use crate::error::ExtractError;
use crate::pipeline::infer::InferenceBackend;
use crate::pipeline::merge::MergePolicy;
use crate::sink::OutputSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default vision model, served by a local Ollama instance.
pub const DEFAULT_MODEL: &str = "qwen2.5vl:7b";

/// Default Ollama endpoint when `OLLAMA_HOST` is not set.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2text::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .num_splits(3)
///     .overlap_ratio(0.15)
///     .concurrency(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.num_splits, 3);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Model identifier passed to the backend. Default: [`DEFAULT_MODEL`].
    pub model: String,

    /// Number of horizontal segments each page is cut into. Must be ≥ 1. Default: 4.
    ///
    /// Vision models downscale large images before reading them; a full page
    /// at 2× scale loses small print. Four strips keep each request close to
    /// the model's native resolution.
    pub num_splits: usize,

    /// Fraction of the base segment height added on each shared edge.
    /// Must be in `[0, 1)`. Default: 0.1.
    ///
    /// A line of text cut in half by a strip boundary appears whole in at
    /// least one of the two neighbouring strips as long as the overlap is
    /// taller than a text line.
    pub overlap_ratio: f64,

    /// Request token streams instead of single responses. Default: false.
    pub stream: bool,

    /// Maximum number of segment calls in flight for one page. Default: 2.
    pub concurrency: usize,

    /// Page scale factor used when rasterising. Default: 2.0.
    pub render_scale: f32,

    /// Cap on either rendered dimension, in pixels. Default: 3000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom transcription prompt. If None, uses [`crate::prompts::DEFAULT_PROMPT`].
    pub prompt: Option<String>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Nucleus sampling cut-off. Default: 0.8.
    pub top_p: f32,

    /// Top-k sampling limit. Default: 10.
    pub top_k: u32,

    /// Penalty applied to repeated tokens. Default: 1.2.
    ///
    /// Small VLMs tend to loop on tables and ruled forms; a mild penalty
    /// stops runaway repetition without hurting normal prose.
    pub repeat_penalty: f32,

    /// Maximum tokens generated per segment, if the backend supports it.
    pub max_tokens: Option<usize>,

    /// Per-call timeout in seconds; for streams, the maximum wait between
    /// two chunks. Default: 180.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Which inference runtime to talk to. Default: Ollama.
    pub backend: BackendKind,

    /// Pre-constructed backend. Takes precedence over `backend`.
    pub backend_override: Option<Arc<dyn InferenceBackend>>,

    /// Overlap-splice policy used by the merger.
    pub merge: MergePolicy,

    /// Marker placed before each page in the document transcript.
    pub page_separator: PageSeparator,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    /// What to do when a page fails. Default: [`FailurePolicy::FailFast`].
    pub failure_policy: FailurePolicy,

    /// On a fail-fast halt, attach the transcript of the completed pages to
    /// the returned error. Default: false.
    pub keep_partial: bool,

    /// Receiver of live events (chunks, page completions).
    pub sink: Option<Arc<dyn OutputSink>>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            num_splits: 4,
            overlap_ratio: 0.1,
            stream: false,
            concurrency: 2,
            render_scale: 2.0,
            max_rendered_pixels: 3000,
            password: None,
            prompt: None,
            temperature: 0.1,
            top_p: 0.8,
            top_k: 10,
            repeat_penalty: 1.2,
            max_tokens: None,
            api_timeout_secs: 180,
            download_timeout_secs: 120,
            backend: BackendKind::default(),
            backend_override: None,
            merge: MergePolicy::default(),
            page_separator: PageSeparator::default(),
            pages: PageSelection::default(),
            failure_policy: FailurePolicy::default(),
            keep_partial: false,
            sink: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("num_splits", &self.num_splits)
            .field("overlap_ratio", &self.overlap_ratio)
            .field("stream", &self.stream)
            .field("concurrency", &self.concurrency)
            .field("render_scale", &self.render_scale)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("backend", &self.backend)
            .field(
                "backend_override",
                &self.backend_override.as_ref().map(|_| "<dyn InferenceBackend>"),
            )
            .field("merge", &self.merge)
            .field("page_separator", &self.page_separator)
            .field("pages", &self.pages)
            .field("failure_policy", &self.failure_policy)
            .field("keep_partial", &self.keep_partial)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the parameters the planner and invoker depend on.
    ///
    /// Called by [`ExtractionConfigBuilder::build`] and again at the start of
    /// every run, because the fields are public and may have been edited.
    pub fn validate(&self) -> Result<(), ExtractError> {
        validate_split_params(self.num_splits, self.overlap_ratio)?;
        if self.concurrency == 0 {
            return Err(ExtractError::Configuration(
                "concurrency must be ≥ 1".into(),
            ));
        }
        if !(self.render_scale.is_finite() && self.render_scale > 0.0) {
            return Err(ExtractError::Configuration(format!(
                "render scale must be > 0, got {}",
                self.render_scale
            )));
        }
        if self.api_timeout_secs == 0 {
            return Err(ExtractError::Configuration(
                "API timeout must be at least 1 second".into(),
            ));
        }
        if self.model.trim().is_empty() && self.backend_override.is_none() {
            return Err(ExtractError::Configuration("model must not be empty".into()));
        }
        self.merge.validate()
    }

    /// The prompt sent with every segment image.
    pub fn effective_prompt(&self) -> &str {
        self.prompt
            .as_deref()
            .unwrap_or(crate::prompts::DEFAULT_PROMPT)
    }
}

/// Validate the split count and overlap ratio.
pub(crate) fn validate_split_params(num_splits: usize, overlap_ratio: f64) -> Result<(), ExtractError> {
    if num_splits == 0 {
        return Err(ExtractError::Configuration(
            "num_splits must be ≥ 1, got 0".into(),
        ));
    }
    if !overlap_ratio.is_finite() || !(0.0..1.0).contains(&overlap_ratio) {
        return Err(ExtractError::Configuration(format!(
            "overlap_ratio must be in [0, 1), got {overlap_ratio}"
        )));
    }
    Ok(())
}

/// Builder for [`ExtractionConfig`].
///
/// Setters store values as given; range checks happen once in
/// [`build`](Self::build) so an invalid split count is reported instead of
/// silently clamped.
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn num_splits(mut self, n: usize) -> Self {
        self.config.num_splits = n;
        self
    }

    pub fn overlap_ratio(mut self, ratio: f64) -> Self {
        self.config.overlap_ratio = ratio;
        self
    }

    pub fn stream(mut self, v: bool) -> Self {
        self.config.stream = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.config.top_k = k;
        self
    }

    pub fn repeat_penalty(mut self, p: f32) -> Self {
        self.config.repeat_penalty = p;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = Some(n);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn backend_override(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.config.backend_override = Some(backend);
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.merge = policy;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn keep_partial(mut self, v: bool) -> Self {
        self.config.keep_partial = v;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.config.sink = Some(sink);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Inference runtime selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Ollama's native `/api/chat` endpoint (supports token streaming).
    Ollama { base_url: String },
    /// A hosted provider known to `edgequake-llm` ("openai", "anthropic", …).
    Provider { name: String },
}

impl Default for BackendKind {
    fn default() -> Self {
        let base_url = std::env::var("OLLAMA_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .map(|h| normalise_ollama_host(&h))
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        BackendKind::Ollama { base_url }
    }
}

/// `OLLAMA_HOST` is often given as `host:port` without a scheme.
pub fn normalise_ollama_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Behaviour after a page fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Halt the whole run at the first failed page. (default)
    #[default]
    FailFast,
    /// Record the failure and continue with the next page.
    BestEffort,
}

/// Specifies which pages of the PDF to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// How pages are marked in the document transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// `--- page N ---` (default)
    #[default]
    Marker,
    /// HTML comment: `<!-- page N -->`
    Comment,
    /// Custom string; `{page}` is replaced with the page number.
    Custom(String),
    /// No marker; pages joined with a blank line.
    None,
}

impl PageSeparator {
    /// Render the marker for the given page number (1-indexed), or `None`
    /// when pages are not marked.
    pub fn render(&self, page_num: usize) -> Option<String> {
        match self {
            PageSeparator::Marker => Some(format!("--- page {page_num} ---")),
            PageSeparator::Comment => Some(format!("<!-- page {page_num} -->")),
            PageSeparator::Custom(s) => Some(s.replace("{page}", &page_num.to_string())),
            PageSeparator::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ExtractionConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.num_splits, 4);
        assert!((config.overlap_ratio - 0.1).abs() < f64::EPSILON);
        assert!(!config.stream);
    }

    #[test]
    fn zero_splits_rejected() {
        let err = ExtractionConfig::builder().num_splits(0).build().unwrap_err();
        assert!(matches!(err, ExtractError::Configuration(_)));
    }

    #[test]
    fn overlap_ratio_bounds() {
        assert!(ExtractionConfig::builder().overlap_ratio(0.0).build().is_ok());
        assert!(ExtractionConfig::builder().overlap_ratio(0.99).build().is_ok());
        for bad in [1.0, 1.5, -0.1, f64::NAN, f64::INFINITY] {
            let err = ExtractionConfig::builder().overlap_ratio(bad).build().unwrap_err();
            assert!(
                matches!(err, ExtractError::Configuration(_)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(ExtractionConfig::builder().concurrency(0).build().is_err());
    }

    #[test]
    fn page_marker_rendering() {
        assert_eq!(PageSeparator::Marker.render(3).as_deref(), Some("--- page 3 ---"));
        assert_eq!(PageSeparator::Comment.render(1).as_deref(), Some("<!-- page 1 -->"));
        assert_eq!(
            PageSeparator::Custom("=== {page} ===".into()).render(7).as_deref(),
            Some("=== 7 ===")
        );
        assert_eq!(PageSeparator::None.render(2), None);
    }

    #[test]
    fn ollama_host_normalisation() {
        assert_eq!(normalise_ollama_host("127.0.0.1:11434"), "http://127.0.0.1:11434");
        assert_eq!(normalise_ollama_host("https://gpu.local/"), "https://gpu.local");
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 9).to_indices(4), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3]).to_indices(5), vec![0, 2]);
    }
}
