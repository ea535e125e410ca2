//! Transcription prompt sent with every segment image.
//!
//! Callers can override it via [`crate::config::ExtractionConfig::prompt`]
//! (CLI: `--prompt-file`); the constant here is used only when no override is
//! provided.

/// Default instruction for transcribing one horizontal strip of a page.
///
/// The model is not told that the image is a strip: the instruction is the
/// same as for a full page, and the overlap handling happens after the fact
/// in [`crate::pipeline::merge`].
pub const DEFAULT_PROMPT: &str = "Extract all the text from this document page. \
Maintain the original formatting and structure as much as possible. \
Only return the extracted text, no additional commentary.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_asks_for_text_only() {
        assert!(DEFAULT_PROMPT.contains("Extract all the text"));
        assert!(DEFAULT_PROMPT.contains("no additional commentary"));
        assert!(!DEFAULT_PROMPT.contains("  "));
    }
}
