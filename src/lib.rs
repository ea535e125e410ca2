//! # edgequake-pdf2text
//!
//! Extract plain text from PDF documents with a Vision Language Model (VLM),
//! one overlapping page strip at a time.
//!
//! ## Why segments?
//!
//! Small local vision models read a full A4 page at legible resolution
//! poorly: the image is either downscaled until small print blurs, or the
//! model loses its place halfway down and skips or repeats lines. Cutting
//! each page into a few horizontal strips keeps every request small and
//! sharp. Neighbouring strips overlap so no line is ever cut in half without
//! also appearing whole in one of them, and the merge step removes the text
//! that was transcribed twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Render    rasterise one page at a time via pdfium (spawn_blocking)
//!  ├─ 3. Segment   plan N strips with overlap bands, crop them
//!  ├─ 4. Encode    PNG → base64
//!  ├─ 5. Infer     bounded-concurrency calls to Ollama or an edgequake-llm
//!  │               provider, optionally streamed chunk by chunk
//!  ├─ 6. Clean     strip fences, preambles and invisible characters
//!  ├─ 7. Merge     splice neighbouring segment texts across the overlap
//!  └─ 8. Assemble  pages in order, with markers, into one document
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2text::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Ollama at OLLAMA_HOST (or localhost:11434) with qwen2.5vl:7b
//!     let config = ExtractionConfig::default();
//!     let output = extract("scan.pdf", &config).await?;
//!     println!("{}", output.text);
//!     eprintln!(
//!         "{} pages, {} unresolved boundaries",
//!         output.stats.processed_pages, output.stats.splices.marked
//!     );
//!     Ok(())
//! }
//! ```
//!
//! Live output while the model writes:
//!
//! ```rust,no_run
//! use edgequake_pdf2text::{extract, ExtractionConfig, WriterSink};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExtractionConfig::builder()
//!     .num_splits(6)
//!     .stream(true)
//!     .sink(Arc::new(WriterSink::new(std::io::stderr())))
//!     .build()?;
//! let output = extract("scan.pdf", &config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2text` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2text = { version = "0.1", default-features = false }
//! ```
//!
//! ## Backends
//!
//! | Backend | Selected by | Streaming |
//! |---------|-------------|-----------|
//! | Ollama `/api/chat` | default, `BackendKind::Ollama` | chunk by chunk (NDJSON) |
//! | edgequake-llm provider | `BackendKind::Provider { name }` | one chunk per segment |
//! | your own | `ExtractionConfigBuilder::backend_override` | as implemented |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod cancel;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod sink;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assemble::{
    extract, extract_cancellable, extract_sync, extract_to_file, extract_with, inspect, resolve_backend,
    write_atomic, PageState,
};
pub use cancel::CancelToken;
pub use config::{
    BackendKind, ExtractionConfig, ExtractionConfigBuilder, FailurePolicy, PageSelection, PageSeparator,
    DEFAULT_MODEL,
};
pub use error::{BackendError, ExtractError, InferenceError};
pub use output::{
    DocumentMetadata, DocumentTranscript, ExtractionOutput, ExtractionStats, PageFailure, PageTranscript,
    SpliceCounts,
};
pub use pipeline::infer::InferenceBackend;
pub use pipeline::merge::{MergePolicy, SpliceKind, SpliceRecord};
pub use pipeline::render::PageRasterizer;
pub use sink::{NoopSink, OutputSink, WriterSink};
pub use stream::{extract_stream, extract_stream_with, EventStream, ExtractionEvent};
