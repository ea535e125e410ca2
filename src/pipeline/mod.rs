//! Pipeline stages for segmented page transcription.
//!
//! ```text
//! input ──▶ render ──▶ segment ──▶ encode ──▶ infer ──▶ postprocess ──▶ merge
//! (path/URL) (pdfium)   (plan+crop)  (base64)   (VLM)     (cleanup)      (splice)
//! ```
//!
//! 1. [`input`]   — canonicalise the path or URL to a local PDF
//! 2. [`render`]  — rasterise pages; pdfium runs on the blocking pool
//! 3. [`segment`] — plan overlapping horizontal strips and crop them
//! 4. [`encode`]  — PNG + base64 for the request body
//! 5. [`infer`]   — bounded-concurrency model calls, optionally streamed,
//!    through the [`ollama`] or [`llm`] backend
//! 6. [`postprocess`] — strip model artefacts from each segment's text
//! 7. [`merge`]   — fold the segment texts into one page, removing the
//!    duplicate overlap

pub mod encode;
pub mod infer;
pub mod input;
pub mod llm;
pub mod merge;
pub mod ollama;
pub mod postprocess;
pub mod render;
pub mod segment;
