//! Ollama backend: native `/api/chat` endpoint over `reqwest`.
//!
//! Request body:
//!
//! ```json
//! { "model": "qwen2.5vl:7b",
//!   "messages": [{ "role": "user", "content": "<prompt>", "images": ["<b64 png>"] }],
//!   "stream": true,
//!   "options": { "temperature": 0.1, "top_p": 0.8, "top_k": 10, "repeat_penalty": 1.2 } }
//! ```
//!
//! With `"stream": false` the reply is one JSON object. With `"stream": true`
//! it is newline-delimited JSON, one object per generated fragment:
//! `{"message":{"content":"…"},"done":false}` … `{"done":true,…}`. A failure
//! mid-stream arrives as `{"error":"…"}`.

use crate::error::{BackendError, ExtractError};
use crate::pipeline::infer::{InferenceBackend, InferenceRequest, TextChunkStream};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::pin::Pin;
use tracing::debug;

/// Talks to an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    async fn post(&self, request: &InferenceRequest, stream: bool) -> Result<reqwest::Response, BackendError> {
        debug!(
            "POST {} page {} segment {} (stream={})",
            self.chat_url(),
            request.page,
            request.segment,
            stream
        );
        let response = self
            .client
            .post(self.chat_url())
            .json(&chat_body(request, stream))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status.as_u16(), &body))
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_connect() {
            BackendError::Transport(format!("cannot reach Ollama at {}: {e}", self.base_url))
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let response = self.post(request, false).await?;
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        match parse_frame(&bytes)? {
            Some(frame) => Ok(frame.content),
            None => Err(BackendError::MalformedResponse("empty response body".into())),
        }
    }

    async fn infer_stream(&self, request: &InferenceRequest) -> Result<TextChunkStream, BackendError> {
        let response = self.post(request, true).await?;
        Ok(ndjson_chunks(response.bytes_stream()))
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    stream: bool,
    options: ModelOptions,
}

#[derive(Debug, Serialize)]
struct ChatTurn<'a> {
    role: &'static str,
    content: &'a str,
    images: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct ModelOptions {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

fn chat_body(request: &InferenceRequest, stream: bool) -> ChatBody<'_> {
    let opts = &request.options;
    ChatBody {
        model: &opts.model,
        messages: vec![ChatTurn {
            role: "user",
            content: &request.prompt,
            images: vec![&request.image.base64],
        }],
        stream,
        options: ModelOptions {
            temperature: opts.temperature,
            top_p: opts.top_p,
            top_k: opts.top_k,
            repeat_penalty: opts.repeat_penalty,
            num_predict: opts.max_tokens,
        },
    }
}

fn error_from_status(status: u16, body: &str) -> BackendError {
    match serde_json::from_str::<ChatReply>(body) {
        Ok(ChatReply { error: Some(msg), .. }) => BackendError::Model(format!("HTTP {status}: {msg}")),
        _ => BackendError::Transport(format!("HTTP {status}: {}", body.trim())),
    }
}

// ── NDJSON decoding ──────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct Frame {
    content: String,
    done: bool,
}

/// Parse one JSON object. Blank input yields `None`.
fn parse_frame(line: &[u8]) -> Result<Option<Frame>, BackendError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let reply: ChatReply = serde_json::from_slice(line)
        .map_err(|e| BackendError::MalformedResponse(format!("{e}: {}", String::from_utf8_lossy(line).trim())))?;
    if let Some(msg) = reply.error {
        return Err(BackendError::Model(msg));
    }
    Ok(Some(Frame {
        content: reply.message.map(|m| m.content).unwrap_or_default(),
        done: reply.done,
    }))
}

struct NdjsonState<S> {
    body: Pin<Box<S>>,
    buf: Vec<u8>,
    saw_done: bool,
    finished: bool,
}

/// Turn a byte stream of NDJSON chat replies into text chunks.
///
/// Lines may be split across network reads; bytes are buffered until a
/// newline arrives. The stream ends after the `done` frame. A body that ends
/// without one is reported as malformed, so a truncated transcription is
/// never passed off as complete.
fn ndjson_chunks<S, B, E>(body: S) -> TextChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = NdjsonState {
        body: Box::pin(body),
        buf: Vec::new(),
        saw_done: false,
        finished: false,
    };

    let chunks = stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                match parse_frame(&line) {
                    Ok(None) => continue,
                    Ok(Some(frame)) => {
                        if frame.done {
                            st.saw_done = true;
                            st.finished = true;
                        }
                        if frame.content.is_empty() {
                            continue;
                        }
                        return Some((Ok(frame.content), st));
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }

            match st.body.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(BackendError::Transport(e.to_string())), st));
                }
                None if st.buf.iter().any(|b| !b.is_ascii_whitespace()) => {
                    // Last line without a trailing newline.
                    st.buf.push(b'\n');
                }
                None => {
                    st.finished = true;
                    if st.saw_done {
                        return None;
                    }
                    return Some((
                        Err(BackendError::MalformedResponse(
                            "stream ended before the final frame".into(),
                        )),
                        st,
                    ));
                }
            }
        }
    });

    Box::pin(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::EncodedImage;
    use crate::pipeline::infer::SamplingOptions;
    use std::sync::Arc;

    fn request(max_tokens: Option<usize>) -> InferenceRequest {
        InferenceRequest {
            page: 1,
            segment: 0,
            image: EncodedImage {
                base64: "iVBORw0KGgo=".into(),
                width: 10,
                height: 4,
            },
            prompt: Arc::from("Extract all the text"),
            options: Arc::new(SamplingOptions {
                model: "qwen2.5vl:7b".into(),
                temperature: 0.1,
                top_p: 0.8,
                top_k: 10,
                repeat_penalty: 1.2,
                max_tokens,
            }),
        }
    }

    async fn drain(s: TextChunkStream) -> Vec<Result<String, BackendError>> {
        s.collect().await
    }

    fn bytes(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, String>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, String>> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    #[test]
    fn body_carries_prompt_image_and_options() {
        let json = serde_json::to_value(chat_body(&request(None), true)).unwrap();
        assert_eq!(json["model"], "qwen2.5vl:7b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Extract all the text");
        assert_eq!(json["messages"][0]["images"][0], "iVBORw0KGgo=");
        assert_eq!(json["options"]["top_k"], 10);
        assert!(json["options"].get("num_predict").is_none());

        let json = serde_json::to_value(chat_body(&request(Some(512)), false)).unwrap();
        assert_eq!(json["options"]["num_predict"], 512);
    }

    #[test]
    fn frame_parsing() {
        assert_eq!(
            parse_frame(br#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#).unwrap(),
            Some(Frame {
                content: "Hi".into(),
                done: false
            })
        );
        assert_eq!(parse_frame(b"  \n").unwrap(), None);
        assert_eq!(
            parse_frame(br#"{"error":"model not found"}"#).unwrap_err(),
            BackendError::Model("model not found".into())
        );
        assert!(matches!(
            parse_frame(b"{not json").unwrap_err(),
            BackendError::MalformedResponse(_)
        ));
    }

    #[tokio::test]
    async fn ndjson_lines_split_across_reads() {
        let s = ndjson_chunks(bytes(&[
            "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"mess",
            "age\":{\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true,\"total_duration\":5}\n",
        ]));
        let out: Vec<String> = drain(s).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn final_line_without_newline() {
        let s = ndjson_chunks(bytes(&[
            "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"b\"},\"done\":true}",
        ]));
        let out: Vec<String> = drain(s).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(out.concat(), "ab");
    }

    #[tokio::test]
    async fn error_frame_ends_stream() {
        let s = ndjson_chunks(bytes(&[
            "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
            "{\"error\":\"out of memory\"}\n",
            "{\"message\":{\"content\":\"never\"},\"done\":false}\n",
        ]));
        let out = drain(s).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Err(BackendError::Model("out of memory".into())));
    }

    #[tokio::test]
    async fn truncated_stream_is_malformed() {
        let s = ndjson_chunks(bytes(&["{\"message\":{\"content\":\"a\"},\"done\":false}\n"]));
        let out = drain(s).await;
        assert_eq!(out[0], Ok("a".to_string()));
        assert!(matches!(out[1], Err(BackendError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn transport_error_mid_stream() {
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"{\"message\":{\"content\":\"a\"},\"done\":false}\n".to_vec()),
            Err("connection reset".into()),
        ];
        let out = drain(ndjson_chunks(stream::iter(parts))).await;
        assert_eq!(out[1], Err(BackendError::Transport("connection reset".into())));
    }

    #[test]
    fn status_errors() {
        assert_eq!(
            error_from_status(404, r#"{"error":"model 'x' not found"}"#),
            BackendError::Model("HTTP 404: model 'x' not found".into())
        );
        assert!(matches!(error_from_status(502, "Bad Gateway"), BackendError::Transport(_)));
    }

    #[test]
    fn base_url_is_trimmed() {
        let backend = OllamaBackend::new("http://localhost:11434/").unwrap();
        assert_eq!(backend.chat_url(), "http://localhost:11434/api/chat");
        assert_eq!(backend.name(), "ollama");
    }
}
