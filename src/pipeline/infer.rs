//! Inference invocation: send segment images to a model and collect text.
//!
//! [`InferenceBackend`] is the seam to the model runtime. The rest of this
//! module is orchestration on top of it:
//!
//! * [`invoke`]: one call, bounded by a timeout, returning either the whole
//!   text or a lazy chunk stream ([`InferenceResult`]).
//! * [`run_segment`]: invoke, forward streamed chunks to the sink, and
//!   buffer them into the final segment text.
//! * [`dispatch_segments`]: run every segment of a page through a bounded
//!   worker pool and hand back the texts in segment order.
//!
//! No retries happen here. A failed call is final for its page.

use crate::cancel::CancelToken;
use crate::error::{BackendError, InferenceError};
use crate::pipeline::encode::EncodedImage;
use crate::sink::OutputSink;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Single-pass stream of text chunks as produced by a backend.
pub type TextChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Single-pass stream of text chunks for one identified segment.
pub type SegmentChunkStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub max_tokens: Option<usize>,
}

impl SamplingOptions {
    pub fn from_config(config: &crate::config::ExtractionConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
            max_tokens: config.max_tokens,
        }
    }
}

/// Everything a backend needs to transcribe one segment.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// 1-indexed page number.
    pub page: usize,
    /// 0-indexed segment within the page.
    pub segment: usize,
    pub image: EncodedImage,
    pub prompt: Arc<str>,
    pub options: Arc<SamplingOptions>,
}

/// A vision-language model runtime.
///
/// Implementations report failures as [`BackendError`]; the invoker tags
/// them with the page and segment.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs, e.g. `"ollama"`.
    fn name(&self) -> &str;

    /// Transcribe the segment in a single round trip.
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError>;

    /// Transcribe the segment as a token stream.
    ///
    /// The default yields the complete text as one chunk, for runtimes
    /// without incremental output.
    async fn infer_stream(&self, request: &InferenceRequest) -> Result<TextChunkStream, BackendError> {
        let text = self.infer(request).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}

/// The text produced for one segment.
pub enum InferenceResult {
    /// The whole text, from a non-streaming call.
    Complete(String),
    /// Chunks whose concatenation is the whole text. Consumed once.
    Streaming(SegmentChunkStream),
}

impl std::fmt::Debug for InferenceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceResult::Complete(text) => f.debug_tuple("Complete").field(&text.len()).finish(),
            InferenceResult::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

impl InferenceResult {
    /// Drain into the final text, calling `on_chunk` for every streamed chunk.
    ///
    /// `on_chunk` is not called for a [`Complete`](Self::Complete) result.
    pub async fn collect_with<F>(self, mut on_chunk: F) -> Result<String, InferenceError>
    where
        F: FnMut(&str),
    {
        match self {
            InferenceResult::Complete(text) => Ok(text),
            InferenceResult::Streaming(mut chunks) => {
                let mut text = String::new();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    on_chunk(&chunk);
                    text.push_str(&chunk);
                }
                Ok(text)
            }
        }
    }
}

/// Call the backend for one segment.
///
/// Non-streaming calls are bounded by `timeout` as a whole. Streaming calls
/// are bounded by `timeout` until the stream opens and then between any two
/// chunks, so a long but steadily progressing transcription is not cut off
/// while a stalled one is.
pub async fn invoke(
    backend: &dyn InferenceBackend,
    request: &InferenceRequest,
    stream: bool,
    timeout: Duration,
) -> Result<InferenceResult, InferenceError> {
    let (page, segment) = (request.page, request.segment);
    let secs = timeout.as_secs();
    let tag = move |cause: BackendError| InferenceError::new(page, segment, cause);

    if !stream {
        let text = tokio::time::timeout(timeout, backend.infer(request))
            .await
            .map_err(|_| tag(BackendError::Timeout { secs }))?
            .map_err(tag)?;
        return Ok(InferenceResult::Complete(text));
    }

    let chunks = tokio::time::timeout(timeout, backend.infer_stream(request))
        .await
        .map_err(|_| tag(BackendError::Timeout { secs }))?
        .map_err(tag)?;

    Ok(InferenceResult::Streaming(with_idle_timeout(
        chunks, timeout, page, segment,
    )))
}

/// Bound the wait for every chunk and stop after the first error.
fn with_idle_timeout(
    chunks: TextChunkStream,
    timeout: Duration,
    page: usize,
    segment: usize,
) -> SegmentChunkStream {
    let secs = timeout.as_secs();
    let s = stream::unfold(Some(chunks), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(timeout, chunks.next()).await {
            Err(_) => Some((
                Err(InferenceError::new(page, segment, BackendError::Timeout { secs })),
                None,
            )),
            Ok(None) => None,
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(chunks))),
            Ok(Some(Err(cause))) => Some((Err(InferenceError::new(page, segment, cause)), None)),
        }
    });
    Box::pin(s)
}

/// Invoke one segment and return its full text, forwarding streamed chunks
/// to `sink` as they arrive.
pub async fn run_segment(
    backend: &dyn InferenceBackend,
    request: &InferenceRequest,
    stream: bool,
    timeout: Duration,
    sink: Option<&dyn OutputSink>,
) -> Result<String, InferenceError> {
    let (page, segment) = (request.page, request.segment);
    let start = Instant::now();
    if let Some(sink) = sink {
        sink.on_segment_start(page, segment);
    }

    let result = invoke(backend, request, stream, timeout).await?;
    let text = result
        .collect_with(|chunk| {
            if let Some(sink) = sink {
                sink.on_segment_chunk(page, segment, chunk);
            }
        })
        .await?;

    debug!(
        "Page {} segment {}: {} chars from {} in {:?}",
        page,
        segment,
        text.len(),
        backend.name(),
        start.elapsed()
    );
    if let Some(sink) = sink {
        sink.on_segment_complete(page, segment, text.len());
    }
    Ok(text)
}

/// Why a page's dispatch did not produce a full set of segment texts.
#[derive(Debug)]
pub enum DispatchError {
    /// A segment call failed; the remaining calls were abandoned.
    Failed(InferenceError),
    /// The cancel token fired; the in-flight calls were abandoned.
    Cancelled,
}

/// Run every request of one page through a pool of at most `concurrency`
/// in-flight calls.
///
/// Results land in a slot per segment index, so the returned texts are in
/// segment order whatever order the calls complete in. The first failure
/// ends the dispatch: the remaining futures are dropped, which aborts their
/// requests.
pub async fn dispatch_segments(
    backend: Arc<dyn InferenceBackend>,
    requests: Vec<InferenceRequest>,
    concurrency: usize,
    stream: bool,
    timeout: Duration,
    sink: Option<Arc<dyn OutputSink>>,
    cancel: &CancelToken,
) -> Result<Vec<String>, DispatchError> {
    if cancel.is_cancelled() {
        return Err(DispatchError::Cancelled);
    }

    let count = requests.len();
    let page = requests.first().map_or(0, |r| r.page);
    let mut slots: Vec<Option<String>> = vec![None; count];

    let mut in_flight = stream::iter(requests.into_iter().map(|request| {
        let backend = Arc::clone(&backend);
        let sink = sink.clone();
        async move {
            let result = run_segment(
                backend.as_ref(),
                &request,
                stream,
                timeout,
                sink.as_deref(),
            )
            .await;
            (request.segment, result)
        }
    }))
    .buffer_unordered(concurrency.max(1));

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            next = in_flight.next() => next,
        };

        let Some((index, result)) = next else {
            break;
        };
        match result {
            Ok(text) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(text);
                }
            }
            Err(e) => {
                error!("Aborting page {}: {}", e.page, e);
                return Err(DispatchError::Failed(e));
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                DispatchError::Failed(InferenceError::new(
                    page,
                    index,
                    BackendError::MalformedResponse("segment produced no result".into()),
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn request(segment: usize) -> InferenceRequest {
        InferenceRequest {
            page: 1,
            segment,
            image: EncodedImage {
                base64: String::new(),
                width: 1,
                height: 1,
            },
            prompt: Arc::from("transcribe"),
            options: Arc::new(SamplingOptions {
                model: "test".into(),
                temperature: 0.1,
                top_p: 0.8,
                top_k: 10,
                repeat_penalty: 1.2,
                max_tokens: None,
            }),
        }
    }

    /// Finishes later segments first, to exercise order restoration.
    struct ReverseDelay {
        count: usize,
    }

    #[async_trait]
    impl InferenceBackend for ReverseDelay {
        fn name(&self) -> &str {
            "reverse"
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
            let wait = (self.count - request.segment) as u64 * 15;
            tokio::time::sleep(Duration::from_millis(wait)).await;
            Ok(format!("segment {}", request.segment))
        }
    }

    struct Chunky;

    #[async_trait]
    impl InferenceBackend for Chunky {
        fn name(&self) -> &str {
            "chunky"
        }

        async fn infer(&self, _request: &InferenceRequest) -> Result<String, BackendError> {
            Ok("Hello world".into())
        }

        async fn infer_stream(&self, _request: &InferenceRequest) -> Result<TextChunkStream, BackendError> {
            let parts = vec![Ok("Hel".to_string()), Ok("lo ".to_string()), Ok("world".to_string())];
            Ok(Box::pin(stream::iter(parts)))
        }
    }

    struct Stalls;

    #[async_trait]
    impl InferenceBackend for Stalls {
        fn name(&self) -> &str {
            "stalls"
        }

        async fn infer(&self, _request: &InferenceRequest) -> Result<String, BackendError> {
            futures::future::pending().await
        }

        async fn infer_stream(&self, _request: &InferenceRequest) -> Result<TextChunkStream, BackendError> {
            let first = stream::once(async { Ok("partial".to_string()) });
            Ok(Box::pin(first.chain(stream::pending())))
        }
    }

    struct FailsOn {
        segment: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for FailsOn {
        fn name(&self) -> &str {
            "fails"
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.segment == self.segment {
                Err(BackendError::Model("boom".into()))
            } else {
                Ok("ok".into())
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<(usize, String)>>,
    }

    impl OutputSink for Recorder {
        fn on_segment_chunk(&self, _page: usize, segment: usize, chunk: &str) {
            self.chunks.lock().unwrap().push((segment, chunk.to_string()));
        }
    }

    #[tokio::test]
    async fn results_return_in_segment_order() {
        let backend: Arc<dyn InferenceBackend> = Arc::new(ReverseDelay { count: 4 });
        let requests = (0..4).map(request).collect();
        let texts = dispatch_segments(
            backend,
            requests,
            4,
            false,
            Duration::from_secs(5),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(texts, vec!["segment 0", "segment 1", "segment 2", "segment 3"]);
    }

    #[tokio::test]
    async fn streamed_chunks_are_forwarded_and_joined() {
        let recorder = Arc::new(Recorder::default());
        let text = run_segment(
            &Chunky,
            &request(0),
            true,
            Duration::from_secs(5),
            Some(recorder.as_ref()),
        )
        .await
        .unwrap();
        assert_eq!(text, "Hello world");

        let chunks = recorder.chunks.lock().unwrap();
        let joined: String = chunks.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(joined, text);
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn non_streaming_call_times_out() {
        let err = run_segment(&Stalls, &request(2), false, Duration::from_millis(30), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!((err.page, err.segment), (1, 2));
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let err = run_segment(&Stalls, &request(1), true, Duration::from_millis(30), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.segment, 1);
    }

    #[tokio::test]
    async fn first_failure_ends_dispatch() {
        let backend = Arc::new(FailsOn {
            segment: 0,
            calls: AtomicUsize::new(0),
        });
        let requests = (0..3).map(request).collect();
        let err = dispatch_segments(
            backend.clone(),
            requests,
            1,
            false,
            Duration::from_secs(5),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            DispatchError::Failed(e) => assert_eq!(e.segment, 0),
            other => panic!("unexpected {other:?}"),
        }
        // Sequential pool: the failure on segment 0 stops segments 1 and 2.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_dispatches_nothing() {
        let backend = Arc::new(FailsOn {
            segment: 99,
            calls: AtomicUsize::new(0),
        });
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = dispatch_segments(
            backend.clone(),
            (0..2).map(request).collect(),
            2,
            false,
            Duration::from_secs(5),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_calls_in_flight() {
        for stream in [false, true] {
            let recorder = Arc::new(Recorder::default());
            let cancel = CancelToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            });

            let outcome = tokio::time::timeout(
                Duration::from_secs(1),
                dispatch_segments(
                    Arc::new(Stalls),
                    (0..2).map(request).collect(),
                    2,
                    stream,
                    Duration::from_secs(60),
                    Some(recorder.clone() as Arc<dyn OutputSink>),
                    &cancel,
                ),
            )
            .await
            .expect("cancel must end dispatch while calls are pending");

            assert!(matches!(outcome, Err(DispatchError::Cancelled)), "stream={stream}");
            if stream {
                assert!(!recorder.chunks.lock().unwrap().is_empty());
            }
        }
    }
}
