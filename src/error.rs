//! Error types for the edgequake-pdf2text library.
//!
//! Three layers, from the outside in:
//!
//! * [`ExtractError`]: **fatal** for the run. Bad configuration, a PDF that
//!   cannot be loaded, an inference failure under the fail-fast policy, or a
//!   cancellation. Returned as `Err(ExtractError)` from the `extract*`
//!   functions.
//!
//! * [`InferenceError`]: a single segment call failed. Always carries the
//!   page number and segment index so the user can tell *which* strip of
//!   *which* page the model choked on.
//!
//! * [`BackendError`]: what an [`crate::pipeline::infer::InferenceBackend`]
//!   reports. Backends know nothing about pages; the invoker attaches the
//!   segment identity when it wraps a `BackendError` into an
//!   `InferenceError`.
//!
//! There is no merge error: an ambiguous overlap degrades to a
//! marked concatenation (see [`crate::pipeline::merge`]).

use crate::output::DocumentTranscript;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2text library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Builder validation failed, or a planner parameter is out of range.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// No pdfium shared library could be bound.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    RasterizerUnavailable(String),

    // ── Inference errors ──────────────────────────────────────────────────
    /// The configured hosted provider could not be created.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A segment call failed and the run halted (fail-fast policy).
    ///
    /// `partial` holds the transcript of the pages appended before the
    /// failure, but only when the caller asked for it via
    /// [`crate::config::ExtractionConfig::keep_partial`].
    #[error("{source}")]
    Inference {
        #[source]
        source: InferenceError,
        partial: Option<Box<DocumentTranscript>>,
    },

    /// The run was cancelled; no page was merged after the cancellation.
    #[error("Extraction cancelled after {pages_completed} completed pages")]
    Cancelled { pages_completed: usize },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// `true` for errors raised while loading the document, before any
    /// inference call was made.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            ExtractError::FileNotFound { .. }
                | ExtractError::PermissionDenied { .. }
                | ExtractError::DownloadFailed { .. }
                | ExtractError::DownloadTimeout { .. }
                | ExtractError::NotAPdf { .. }
                | ExtractError::CorruptPdf { .. }
                | ExtractError::PasswordRequired { .. }
                | ExtractError::WrongPassword { .. }
                | ExtractError::PageOutOfRange { .. }
                | ExtractError::RasterisationFailed { .. }
                | ExtractError::RasterizerUnavailable(_)
        )
    }

    /// The partial transcript attached to a halted run, if any.
    pub fn partial_transcript(&self) -> Option<&DocumentTranscript> {
        match self {
            ExtractError::Inference {
                partial: Some(p), ..
            } => Some(p),
            _ => None,
        }
    }
}

/// Failure of a single segment inference call.
#[derive(Debug, Clone, Error)]
#[error("Page {page}, segment {segment}: {cause}")]
pub struct InferenceError {
    /// 1-indexed page number.
    pub page: usize,
    /// 0-indexed segment within the page.
    pub segment: usize,
    #[source]
    pub cause: BackendError,
}

impl InferenceError {
    pub fn new(page: usize, segment: usize, cause: BackendError) -> Self {
        Self {
            page,
            segment,
            cause,
        }
    }

    /// `true` if the call was abandoned because it exceeded the timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, BackendError::Timeout { .. })
    }
}

/// Error reported by an inference backend.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BackendError {
    /// No response (or no next chunk) within the configured timeout.
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The model runtime answered with an error.
    #[error("model error: {0}")]
    Model(String),

    /// The response could not be decoded.
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    /// Connection, TLS or HTTP-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The segment image could not be encoded for the request.
    #[error("image encoding failed: {0}")]
    Encoding(String),
}
