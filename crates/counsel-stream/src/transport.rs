use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tracing::trace;

use crate::config::StreamConfig;
use crate::errors::{StreamError, http_status_error};
use crate::model::TelemetryId;

/// Raw body chunks as they come off the connection.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

/// Caller-supplied description of one streaming request.
#[derive(Clone, Debug, Default)]
pub struct StreamRequest {
    /// Endpoint that answers with an SSE body.
    pub url: String,
    /// JSON object posted as the request body; `telemetry_id` is added to it.
    pub body: serde_json::Map<String, serde_json::Value>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Replaces the body with the fields of a JSON object.
    ///
    /// Non-object values are rejected since the telemetry id must be merged in.
    pub fn json_body(mut self, body: serde_json::Value) -> Result<Self, StreamError> {
        match body {
            serde_json::Value::Object(map) => {
                self.body = map;
                Ok(self)
            }
            other => Err(StreamError::Config(format!(
                "request body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Sets a single body field.
    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Body as sent on the wire: the caller payload plus `telemetry_id`.
    pub fn body_with_telemetry(&self, telemetry_id: &TelemetryId) -> serde_json::Value {
        let mut body = self.body.clone();
        body.insert(
            "telemetry_id".to_string(),
            serde_json::Value::String(telemetry_id.to_string()),
        );
        serde_json::Value::Object(body)
    }
}

/// Opens the byte stream for a session.
///
/// Implementations report HTTP and connection failures as `StreamError`;
/// SSE decoding happens on top of the returned bytes in `delta_stream`.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(
        &self,
        request: &StreamRequest,
        telemetry_id: &TelemetryId,
    ) -> Result<ByteStream, StreamError>;
}

/// `StreamTransport` over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a client with only a connect timeout, so long answers are not
    /// cut off by an overall deadline.
    pub fn new(config: &StreamConfig) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        request: &StreamRequest,
        telemetry_id: &TelemetryId,
    ) -> Result<ByteStream, StreamError> {
        let mut http_req = self
            .client
            .post(&request.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body_with_telemetry(telemetry_id));
        if let Some(token) = request.bearer_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            http_req = http_req.header(name.as_str(), value.as_str());
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = read_prefix(response.bytes_stream(), MAX_ERROR_BODY_BYTES).await;
            return Err(http_status_error(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        if status == reqwest::StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(StreamError::NoResponseBody);
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| StreamError::transport(format!("stream read failed: {e}")))
            });
        Ok(Box::pin(bytes))
    }
}

/// Upper bound on how much of a non-success body is read for its message.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Reads at most `limit` bytes from `body`, stopping at the first read error.
async fn read_prefix<S, E>(body: S, limit: usize) -> Vec<u8>
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
{
    let mut body = std::pin::pin!(body);
    let mut prefix = Vec::new();
    while prefix.len() < limit {
        match body.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(limit - prefix.len());
                prefix.extend_from_slice(&chunk[..take]);
            }
            Some(Err(_)) | None => break,
        }
    }
    prefix
}

/// Splits a byte stream into complete text lines.
///
/// Bytes are buffered until a `\n` arrives. A `\n` byte never occurs inside a
/// multi-byte UTF-8 sequence, so a character split across two chunks is only
/// decoded once the whole line is present.
#[derive(Debug)]
pub(crate) struct SseLineDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for `\n`.
    scanned: usize,
    max_line_bytes: usize,
}

impl SseLineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Feeds one chunk and returns every line it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line_bytes {
            return Err(StreamError::protocol(format!(
                "line exceeds {} bytes without a newline",
                self.max_line_bytes
            )));
        }
        Ok(lines)
    }

    /// Returns the unterminated tail left when the body ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.scanned = 0;
        Some(tail)
    }
}

/// Meaning of one SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataLine {
    /// Blank, comment, non-data, or unparseable line.
    Skip,
    /// The `[DONE]` sentinel.
    Done,
    /// Extracted `choices[0].delta.content`.
    Delta(String),
}

pub(crate) fn parse_data_line(raw: &str) -> DataLine {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return DataLine::Skip;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return DataLine::Skip;
    };
    let payload = payload.trim_start();
    if payload == "[DONE]" {
        return DataLine::Done;
    }
    // Partial JSON is expected where a frame straddles a read boundary.
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            trace!(error = %e, "skipping unparseable data frame");
            return DataLine::Skip;
        }
    };
    match value
        .pointer("/choices/0/delta/content")
        .and_then(|v| v.as_str())
    {
        Some(content) if !content.is_empty() => DataLine::Delta(content.to_string()),
        _ => DataLine::Skip,
    }
}

struct DeltaState {
    bytes: ByteStream,
    decoder: SseLineDecoder,
    pending: VecDeque<String>,
    idle_timeout: Option<Duration>,
    done: bool,
}

/// Turns a body byte stream into the sequence of content deltas it carries.
///
/// Ends at the `[DONE]` sentinel or when the body ends, whichever comes first.
/// Nothing after the sentinel is read. Read failures, an overlong line, or an
/// idle gap longer than `idle_timeout` end the sequence with an error.
pub(crate) fn delta_stream(
    bytes: ByteStream,
    idle_timeout: Option<Duration>,
    max_line_bytes: usize,
) -> impl futures::Stream<Item = Result<String, StreamError>> + Send {
    stream::try_unfold(
        DeltaState {
            bytes,
            decoder: SseLineDecoder::new(max_line_bytes),
            pending: VecDeque::new(),
            idle_timeout,
            done: false,
        },
        next_delta,
    )
}

async fn next_delta(mut state: DeltaState) -> Result<Option<(String, DeltaState)>, StreamError> {
    loop {
        if let Some(delta) = state.pending.pop_front() {
            return Ok(Some((delta, state)));
        }
        if state.done {
            return Ok(None);
        }

        let next = match state.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, state.bytes.next())
                .await
                .map_err(|_| StreamError::idle_timeout(limit))?,
            None => state.bytes.next().await,
        };
        let lines = match next {
            Some(chunk) => state.decoder.push_chunk(&chunk?)?,
            None => {
                state.done = true;
                state.decoder.finish().into_iter().collect()
            }
        };
        for line in lines {
            match parse_data_line(&line) {
                DataLine::Delta(text) => state.pending.push_back(text),
                DataLine::Done => {
                    trace!("received end-of-stream sentinel");
                    state.done = true;
                    break;
                }
                DataLine::Skip => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::StreamExt as _;

    pub(crate) fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":content}}]})
        )
    }

    pub(crate) fn byte_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))),
        ))
    }

    async fn collect_deltas(chunks: Vec<Vec<u8>>) -> Result<Vec<String>, StreamError> {
        delta_stream(byte_stream(chunks), None, 1024)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect()
    }

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseLineDecoder::new(1024);
        assert!(decoder.push_chunk(b"data: {\"a\":").unwrap().is_empty());
        let lines = decoder.push_chunk(b"1}\n\ndata: x").unwrap();
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string(), String::new()]);
        assert_eq!(decoder.finish().as_deref(), Some("data: x"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_keeps_multibyte_chars_split_across_chunks() {
        let mut decoder = SseLineDecoder::new(1024);
        let text = "Ärzte §".as_bytes();
        let (head, tail) = text.split_at(1);
        assert!(decoder.push_chunk(head).unwrap().is_empty());
        let mut rest = tail.to_vec();
        rest.push(b'\n');
        assert_eq!(decoder.push_chunk(&rest).unwrap(), vec!["Ärzte §".to_string()]);
    }

    #[test]
    fn decoder_scans_retained_bytes_once() {
        let mut decoder = SseLineDecoder::new(1024);
        for piece in ["data: ", "{\"a\"", ":1}"] {
            assert!(decoder.push_chunk(piece.as_bytes()).unwrap().is_empty());
            assert_eq!(decoder.scanned, decoder.buf.len());
        }
        let lines = decoder.push_chunk(b"\nnext").unwrap();
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(decoder.buf, b"next");
        assert_eq!(decoder.scanned, 4);
        assert_eq!(decoder.push_chunk(b"\n").unwrap(), vec!["next".to_string()]);
        assert_eq!(decoder.scanned, 0);
    }

    #[tokio::test]
    async fn error_body_read_stops_at_limit() {
        let body = stream::iter(vec![
            Ok::<_, StreamError>(bytes::Bytes::from_static(b"0123456789")),
            Ok(bytes::Bytes::from_static(b"abcdef")),
        ])
        .chain(stream::pending());
        let prefix = read_prefix(body, 12).await;
        assert_eq!(prefix, b"0123456789ab");

        let short = stream::iter(vec![Ok::<_, StreamError>(bytes::Bytes::from_static(b"{}"))]);
        assert_eq!(read_prefix(short, 12).await, b"{}");
    }

    #[tokio::test]
    async fn done_sentinel_ends_deltas_without_waiting_for_eof() {
        let mut body = frame("Hello");
        body.push_str("data: [DONE]\n\n");
        body.push_str(&frame("ignored"));
        let bytes = byte_stream(vec![body.into_bytes()]).chain(stream::pending());
        let deltas: Vec<_> = delta_stream(Box::pin(bytes), None, 1024).collect().await;
        assert_eq!(deltas, vec![Ok("Hello".to_string())]);
    }

    #[test]
    fn decoder_rejects_overlong_lines() {
        let mut decoder = SseLineDecoder::new(8);
        let err = decoder.push_chunk(b"data: 0123456789").unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
    }

    #[test]
    fn parse_data_line_classifies_lines() {
        assert_eq!(parse_data_line(""), DataLine::Skip);
        assert_eq!(parse_data_line(": keep-alive"), DataLine::Skip);
        assert_eq!(parse_data_line("event: message"), DataLine::Skip);
        assert_eq!(parse_data_line("data: [DONE]"), DataLine::Done);
        assert_eq!(parse_data_line("data:[DONE]\r"), DataLine::Done);
        assert_eq!(parse_data_line("data: {not valid json"), DataLine::Skip);
        assert_eq!(parse_data_line(r#"data: {"choices":[{"delta":{}}]}"#), DataLine::Skip);
        assert_eq!(
            parse_data_line(r#"data:{"choices":[{"delta":{"content":"Hi"}}]}"#),
            DataLine::Delta("Hi".into())
        );
    }

    #[test]
    fn telemetry_id_is_merged_into_body() {
        let request = StreamRequest::new("http://localhost/chat")
            .json_body(serde_json::json!({"messages": []}))
            .unwrap()
            .field("depth", serde_json::json!("deep"));
        let body = request.body_with_telemetry(&TelemetryId::from("t-1"));
        assert_eq!(body["telemetry_id"], "t-1");
        assert_eq!(body["depth"], "deep");
        assert!(body["messages"].is_array());
    }

    #[test]
    fn non_object_body_is_rejected() {
        let err = StreamRequest::new("http://x").json_body(serde_json::json!([1, 2]));
        assert!(matches!(err, Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn deltas_follow_arrival_order_across_malformed_frames() {
        let mut body = frame("first");
        body.push_str("data: {not valid json\n");
        body.push_str(": comment\n");
        body.push_str(&frame(" second"));
        body.push_str("data: [DONE]\n");
        let bytes = body.into_bytes();
        let (a, b) = bytes.split_at(17);
        let deltas = collect_deltas(vec![a.to_vec(), b.to_vec()]).await.unwrap();
        assert_eq!(deltas, vec!["first", " second"]);
    }

    #[tokio::test]
    async fn unterminated_final_line_is_still_parsed() {
        let body = r#"data: {"choices":[{"delta":{"content":"tail"}}]}"#;
        let deltas = collect_deltas(vec![body.as_bytes().to_vec()]).await.unwrap();
        assert_eq!(deltas, vec!["tail"]);
    }

    #[tokio::test]
    async fn read_error_ends_the_sequence() {
        let chunks: ByteStream = Box::pin(stream::iter(vec![
            Ok(bytes::Bytes::from(frame("ok"))),
            Err(StreamError::transport("connection reset")),
        ]));
        let items: Vec<_> = delta_stream(chunks, None, 1024).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().ok(), Some("ok"));
        assert!(matches!(items[1], Err(StreamError::Transport { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_times_out() {
        let stalled: ByteStream = Box::pin(
            stream::iter(vec![Ok(bytes::Bytes::from(frame("a")))]).chain(stream::pending()),
        );
        let items: Vec<_> = delta_stream(stalled, Some(Duration::from_secs(5)), 1024)
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(StreamError::IdleTimeout { idle_ms: 5000 })));
    }
}
