//! LLM query client with single-shot and streaming modes.
//!
//! Talks to any OpenAI-compatible `POST {base_url}/chat/completions`
//! endpoint. Two modes share one entry point, [`TextGenerator::query`]:
//!
//! - **Single-shot** — waits for the full JSON completion and returns
//!   `choices[0].message.content`.
//! - **Streaming** — reads the `text/event-stream` body incrementally,
//!   delivers each `choices[0].delta.content` to the caller's callback in
//!   arrival order, and stops at `data: [DONE]`.
//!
//! # Stream framing
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"}}]}\n
//! data: {"choices":[{"delta":{"content":" World"}}]}\n
//! data: [DONE]\n
//! ```
//!
//! Network chunks do not respect line boundaries, so bytes are buffered in a
//! [`LineBuffer`] until a full line is available. Lines are classified by
//! [`parse_frame`]. Frames that fail to parse as JSON are logged and skipped;
//! one bad frame never aborts an otherwise good stream.
//!
//! # Cancellation
//!
//! Dropping the `query` future drops the response body, which closes the
//! connection. The only state touched mid-stream is the caller's own
//! accumulation, so abandoning a stream leaves nothing half-written.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::QueryError;

/// Callback receiving streamed text deltas, in order.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Anything that can turn a prompt into text.
///
/// [`QueryClient`] is the HTTP implementation; tests drive the pipeline
/// with scripted implementations.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run `prompt` and return the complete response text.
    ///
    /// When `streaming` is true, every non-empty delta is passed to
    /// `on_chunk` before this returns. In single-shot mode `on_chunk` is
    /// called once with the whole response.
    async fn query(
        &self,
        prompt: &str,
        max_tokens: u32,
        streaming: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<String, QueryError>;
}

// ============ Wire types ============

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse a single-shot completion body.
pub fn parse_completion(body: &str) -> Result<String, QueryError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| QueryError::invalid(format!("completion is not valid JSON: {}", e)))?;

    completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| QueryError::invalid("missing choices[0].message.content"))
}

// ============ Stream framing ============

/// One classified line of an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text delta (possibly empty).
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
    /// Blank lines, comments, `event:`/`id:` fields.
    Ignored,
    /// A `data:` frame whose payload was not a valid chunk.
    Malformed(String),
}

/// Classify one event-stream line.
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim_end_matches('\r');
    let Some(payload) = line.strip_prefix("data:") else {
        return Frame::Ignored;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == "[DONE]" {
        return Frame::Done;
    }

    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => Frame::Delta(
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default(),
        ),
        Err(e) => Frame::Malformed(e.to_string()),
    }
}

/// Reassembles newline-delimited lines from arbitrary byte chunks.
///
/// Bytes are held until a `\n` arrives so multi-byte UTF-8 sequences split
/// across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Add bytes and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Return the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Running state of one streamed response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    done: bool,
    chunks: usize,
    skipped: usize,
}

impl StreamAccumulator {
    /// Feed one line. Returns `false` once the stream is finished and no
    /// more lines should be read.
    pub fn feed(&mut self, line: &str, on_chunk: &mut (dyn FnMut(&str) + Send)) -> bool {
        if self.done {
            return false;
        }
        match parse_frame(line) {
            Frame::Delta(delta) => {
                if !delta.is_empty() {
                    self.text.push_str(&delta);
                    self.chunks += 1;
                    on_chunk(&delta);
                }
            }
            Frame::Done => {
                self.done = true;
                return false;
            }
            Frame::Ignored => {}
            Frame::Malformed(reason) => {
                self.skipped += 1;
                let preview: String = line.chars().take(200).collect();
                warn!(error = %reason, frame = %preview, "Skipping malformed stream frame");
            }
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

// ============ Loading state ============

/// Observable request flags, shared between a client and its observers.
#[derive(Debug, Default)]
pub struct LoadState {
    loading: AtomicBool,
    streaming: AtomicBool,
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn begin(self: &Arc<Self>, streaming: bool) -> RequestGuard {
        self.loading.store(true, Ordering::SeqCst);
        self.streaming.store(streaming, Ordering::SeqCst);
        RequestGuard {
            state: Arc::clone(self),
        }
    }
}

/// Resets the [`LoadState`] flags when the request ends, however it ends.
struct RequestGuard {
    state: Arc<LoadState>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.state.loading.store(false, Ordering::SeqCst);
        self.state.streaming.store(false, Ordering::SeqCst);
    }
}

// ============ HTTP client ============

/// OpenAI-compatible chat-completions client.
pub struct QueryClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    state: Arc<LoadState>,
}

impl QueryClient {
    /// Create a client, reading the API key from the env var named by
    /// `config.api_key_env`. An empty `api_key_env` means no key is sent
    /// (local servers).
    pub fn from_config(config: &LlmConfig) -> Result<Self, QueryError> {
        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            Some(
                std::env::var(&config.api_key_env).map_err(|_| QueryError::MissingApiKey {
                    var: config.api_key_env.clone(),
                })?,
            )
        };
        Self::new(config, api_key)
    }

    pub fn new(config: &LlmConfig, api_key: Option<String>) -> Result<Self, QueryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(QueryError::network)?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            state: Arc::new(LoadState::default()),
        })
    }

    /// Shared handle to this client's loading flags.
    pub fn load_state(&self) -> Arc<LoadState> {
        Arc::clone(&self.state)
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response, QueryError> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(QueryError::network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn read_stream(
        response: reqwest::Response,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, QueryError> {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut acc = StreamAccumulator::default();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(QueryError::network)?;
            for line in lines.push(&chunk) {
                if !acc.feed(&line, on_chunk) {
                    break 'read;
                }
            }
        }

        if !acc.is_done() {
            if let Some(rest) = lines.finish() {
                acc.feed(&rest, on_chunk);
            }
        }

        debug!(chunks = acc.chunks, skipped = acc.skipped, "Stream finished");
        Ok(acc.into_text())
    }
}

#[async_trait]
impl TextGenerator for QueryClient {
    async fn query(
        &self,
        prompt: &str,
        max_tokens: u32,
        streaming: bool,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<String, QueryError> {
        let _guard = self.state.begin(streaming);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            stream: streaming,
            temperature: self.temperature,
        };

        debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            streaming,
            max_tokens,
            "Sending completion request"
        );

        let mut noop = |_: &str| {};
        let sink: &mut (dyn FnMut(&str) + Send) = match on_chunk {
            Some(cb) => cb,
            None => &mut noop,
        };

        let response = self.send(&request).await?;

        if streaming {
            Self::read_stream(response, sink).await
        } else {
            let body = response.text().await.map_err(QueryError::network)?;
            let text = parse_completion(&body)?;
            sink(&text);
            Ok(text)
        }
    }
}

/// Run a streaming query on a background task and receive deltas through a
/// channel instead of a callback.
///
/// Deltas arrive in stream order; the channel closes after `[DONE]` or on
/// error, and the join handle yields the accumulated text. Aborting the
/// handle closes the underlying connection.
pub fn query_channel(
    generator: Arc<dyn TextGenerator>,
    prompt: String,
    max_tokens: u32,
) -> (
    mpsc::UnboundedReceiver<String>,
    JoinHandle<Result<String, QueryError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut forward = move |delta: &str| {
            // A dropped receiver means the consumer walked away; keep
            // accumulating so the join handle still has the full text.
            let _ = tx.send(delta.to_string());
        };
        generator
            .query(&prompt, max_tokens, true, Some(&mut forward))
            .await
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    #[test]
    fn test_parse_frame_delta() {
        assert_eq!(
            parse_frame(&delta_line("Hello")),
            Frame::Delta("Hello".to_string())
        );
    }

    #[test]
    fn test_parse_frame_done() {
        assert_eq!(parse_frame("data: [DONE]"), Frame::Done);
        assert_eq!(parse_frame("data: [DONE]\r"), Frame::Done);
    }

    #[test]
    fn test_parse_frame_ignored() {
        assert_eq!(parse_frame(""), Frame::Ignored);
        assert_eq!(parse_frame(": keep-alive"), Frame::Ignored);
        assert_eq!(parse_frame("event: message"), Frame::Ignored);
    }

    #[test]
    fn test_parse_frame_malformed() {
        assert!(matches!(parse_frame("data: {not json"), Frame::Malformed(_)));
    }

    #[test]
    fn test_parse_frame_role_only_delta_is_empty() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_frame(line), Frame::Delta(String::new()));
    }

    #[test]
    fn test_stream_order_and_accumulation() {
        let mut acc = StreamAccumulator::default();
        let mut seen: Vec<String> = Vec::new();
        let mut cb = |d: &str| seen.push(d.to_string());

        for frame in ["Hello", " ", "World"] {
            assert!(acc.feed(&delta_line(frame), &mut cb));
        }
        assert!(!acc.feed("data: [DONE]", &mut cb));
        assert!(!acc.feed(&delta_line("ignored"), &mut cb));

        assert_eq!(seen, vec!["Hello", " ", "World"]);
        assert_eq!(acc.text(), "Hello World");
    }

    #[test]
    fn test_malformed_frame_does_not_abort() {
        let mut acc = StreamAccumulator::default();
        let mut count = 0;
        let mut cb = |_: &str| count += 1;

        acc.feed(&delta_line("a"), &mut cb);
        assert!(acc.feed("data: {broken", &mut cb));
        acc.feed(&delta_line("b"), &mut cb);

        assert_eq!(acc.into_text(), "ab");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        let lines = buf.push(b"NE]\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn test_line_buffer_split_utf8() {
        let mut buf = LineBuffer::default();
        let bytes = "é\n".as_bytes();
        assert!(buf.push(&bytes[..1]).is_empty());
        assert_eq!(buf.push(&bytes[1..]), vec!["é".to_string()]);
    }

    #[test]
    fn test_line_buffer_trailing_line() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: [DONE]");
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hi"}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "Hi");
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let err = parse_completion(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, QueryError::InvalidResponseFormat { .. }));

        let err = parse_completion(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap_err();
        assert!(matches!(err, QueryError::InvalidResponseFormat { .. }));

        let err = parse_completion("<html>").unwrap_err();
        assert!(matches!(err, QueryError::InvalidResponseFormat { .. }));
    }

    #[test]
    fn test_load_state_guard_resets() {
        let state = Arc::new(LoadState::default());
        {
            let _g = state.begin(true);
            assert!(state.is_loading());
            assert!(state.is_streaming());
        }
        assert!(!state.is_loading());
        assert!(!state.is_streaming());
    }

    #[test]
    fn test_missing_api_key() {
        let config = LlmConfig {
            api_key_env: "RESEARCH_DECK_TEST_UNSET_KEY".to_string(),
            ..LlmConfig::default()
        };
        let err = QueryClient::from_config(&config).err().unwrap();
        assert!(matches!(err, QueryError::MissingApiKey { .. }));
    }

    #[tokio::test]
    async fn test_network_error_resets_flags() {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let client = QueryClient::new(&config, None).unwrap();
        let err = client.query("hi", 10, true, None).await.unwrap_err();
        assert!(matches!(err, QueryError::Network { .. }));
        assert!(!client.is_loading());
        assert!(!client.is_streaming());
    }
}
