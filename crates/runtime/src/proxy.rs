//! Streaming reverse-proxy path.
//!
//! Bytes from the backend are forwarded to the sink unchanged; the SSE
//! parser runs over a copy and never affects framing. All failures end as a
//! terminal `streaming_error` data frame on the sink — nothing propagates
//! into the HTTP server.

use bytes::Bytes;
use futures::StreamExt;
use lemonade_common::TelemetryRecord;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

use crate::ByteSink;

const SSE_DONE_SENTINEL: &str = "[DONE]";
const TOKEN_ESTIMATION_DIVISOR: u64 = 4;

pub struct StreamingProxy;

impl StreamingProxy {
    /// Forward the backend's response bytes to `sink` unchanged. A sink
    /// failure (client gone) aborts the upstream pull within one chunk.
    pub async fn forward_byte_stream(client: &Client, url: &str, request_body: Bytes, sink: &ByteSink) {
        Self::forward_inner(client, url, request_body, sink, None).await;
    }

    /// Forward an SSE stream, extracting telemetry from a copy of the bytes.
    /// The callback fires exactly once with the finalized record.
    pub async fn forward_sse_stream(
        client: &Client,
        url: &str,
        request_body: Bytes,
        sink: &ByteSink,
        approximate_tokens: bool,
        on_telemetry: impl FnOnce(TelemetryRecord),
    ) {
        let mut parser = SseTelemetryParser::new(approximate_tokens);
        Self::forward_inner(client, url, request_body, sink, Some(&mut parser)).await;
        on_telemetry(parser.finalize());
    }

    async fn forward_inner(
        client: &Client,
        url: &str,
        request_body: Bytes,
        sink: &ByteSink,
        mut parser: Option<&mut SseTelemetryParser>,
    ) {
        let response = match client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .body(request_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Streaming request to {} failed: {}", url, e);
                Self::write_error_frame(sink, &e.to_string()).await;
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Backend returned {} for streaming request: {}", status, body);
            Self::write_error_frame(
                sink,
                &format!("backend returned status {}: {}", status.as_u16(), body),
            )
            .await;
            return;
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Some(parser) = parser.as_deref_mut() {
                        parser.push(&bytes);
                    }
                    if sink.send(bytes).await.is_err() {
                        // Client hung up; dropping `stream` closes the
                        // upstream connection.
                        debug!("Sink closed, aborting upstream stream for {}", url);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Upstream stream error from {}: {}", url, e);
                    Self::write_error_frame(sink, &e.to_string()).await;
                    return;
                }
            }
        }
    }

    async fn write_error_frame(sink: &ByteSink, message: &str) {
        let payload = json!({
            "error": {
                "message": message,
                "type": "streaming_error",
            }
        });
        let frame = format!("data: {}\n\n", payload);
        let _ = sink.send(Bytes::from(frame)).await;
    }
}

/// Line-oriented SSE observer. Tolerates JSON split across chunks, mixed
/// `\n`/`\r\n` endings, `:` keep-alive comments, and events carrying several
/// `data:` lines (joined with `\n` before parsing).
struct SseTelemetryParser {
    buffer: Vec<u8>,
    event_data: Vec<String>,
    approximate_tokens: bool,
    request_start: Instant,
    first_frame_at: Option<Instant>,
    completed_at: Option<Instant>,
    usage_input: Option<u64>,
    usage_output: Option<u64>,
    approx_chars: u64,
}

impl SseTelemetryParser {
    fn new(approximate_tokens: bool) -> Self {
        Self {
            buffer: Vec::new(),
            event_data: Vec::new(),
            approximate_tokens,
            request_start: Instant::now(),
            first_frame_at: None,
            completed_at: None,
            usage_input: None,
            usage_output: None,
            approx_chars: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch_event();
            return;
        }
        if line.starts_with(':') {
            // keep-alive comment
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.event_data
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // other fields (event:, id:, retry:) carry no telemetry
    }

    fn dispatch_event(&mut self) {
        if self.event_data.is_empty() {
            return;
        }
        let data = self.event_data.join("\n");
        self.event_data.clear();

        if data == SSE_DONE_SENTINEL {
            self.completed_at = Some(Instant::now());
            return;
        }

        if self.first_frame_at.is_none() {
            self.first_frame_at = Some(Instant::now());
        }

        let Ok(value) = serde_json::from_str::<Value>(&data) else {
            // Partial or non-JSON payloads carry no telemetry; framing to
            // the client is unaffected either way.
            debug!("Skipping unparseable SSE data frame");
            return;
        };

        if let Some(usage) = value.get("usage") {
            // The backend's final usage frame is authoritative
            if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_u64) {
                self.usage_input = Some(prompt);
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(Value::as_u64) {
                self.usage_output = Some(completion);
            }
        }

        self.approx_chars += Self::content_len(&value) as u64;
    }

    /// Text length in a delta/content frame, for the chars/4 approximation
    fn content_len(value: &Value) -> usize {
        let mut total = 0;
        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice
                    .pointer("/delta/content")
                    .or_else(|| choice.get("text"))
                    .and_then(Value::as_str)
                {
                    total += content.len();
                }
            }
        }
        // llama.cpp's native completion endpoint puts text at the top level
        if let Some(content) = value.get("content").and_then(Value::as_str) {
            total += content.len();
        }
        total
    }

    fn finalize(self) -> TelemetryRecord {
        let end = self.completed_at.unwrap_or_else(Instant::now);

        let output_tokens = match self.usage_output {
            Some(tokens) => tokens,
            None if self.approximate_tokens => self.approx_chars / TOKEN_ESTIMATION_DIVISOR,
            None => 0,
        };

        let time_to_first_token = self
            .first_frame_at
            .map(|t| t.duration_since(self.request_start).as_secs_f64())
            .unwrap_or(0.0);

        let tokens_per_second = match self.first_frame_at {
            Some(first) => {
                let window = end.duration_since(first).as_secs_f64();
                if window > 0.0 {
                    output_tokens as f64 / window
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        TelemetryRecord {
            input_tokens: self.usage_input.unwrap_or(0),
            output_tokens,
            time_to_first_token,
            tokens_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[&[u8]], approximate: bool) -> TelemetryRecord {
        let mut parser = SseTelemetryParser::new(approximate);
        for chunk in chunks {
            parser.push(chunk);
        }
        parser.finalize()
    }

    #[test]
    fn test_usage_frame_is_authoritative() {
        let stream = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n\
data: [DONE]\n\n";

        let telemetry = parse_all(&[stream], true);
        assert_eq!(telemetry.input_tokens, 3);
        assert_eq!(telemetry.output_tokens, 2);
        assert!(telemetry.time_to_first_token >= 0.0);
        assert!(telemetry.tokens_per_second >= 0.0);
    }

    #[test]
    fn test_approximation_when_usage_absent() {
        // 16 characters of content -> 4 approximated tokens
        let stream = b"data: {\"choices\":[{\"delta\":{\"content\":\"0123456789abcdef\"}}]}\n\ndata: [DONE]\n\n";

        let telemetry = parse_all(&[stream], true);
        assert_eq!(telemetry.input_tokens, 0);
        assert_eq!(telemetry.output_tokens, 4);
    }

    #[test]
    fn test_approximation_can_be_disabled() {
        let stream = b"data: {\"choices\":[{\"delta\":{\"content\":\"0123456789abcdef\"}}]}\n\ndata: [DONE]\n\n";

        let telemetry = parse_all(&[stream], false);
        assert_eq!(telemetry.output_tokens, 0);
        assert_eq!(telemetry.tokens_per_second, 0.0);
    }

    #[test]
    fn test_json_split_across_chunks() {
        let telemetry = parse_all(
            &[
                b"data: {\"usage\":{\"prompt_tok",
                b"ens\":5,\"completion_tokens\":9}}\n",
                b"\ndata: [DONE]\n\n",
            ],
            true,
        );
        assert_eq!(telemetry.input_tokens, 5);
        assert_eq!(telemetry.output_tokens, 9);
    }

    #[test]
    fn test_crlf_and_comment_lines() {
        let stream = b": keep-alive\r\n\r\ndata: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\r\n\r\ndata: [DONE]\r\n\r\n";

        let telemetry = parse_all(&[stream], true);
        assert_eq!(telemetry.input_tokens, 1);
        assert_eq!(telemetry.output_tokens, 2);
    }

    #[test]
    fn test_multi_data_lines_joined_before_parsing() {
        // One event split over two data: lines; JSON only valid when joined
        let stream =
            b"data: {\"usage\":{\"prompt_tokens\":2,\ndata: \"completion_tokens\":4}}\n\ndata: [DONE]\n\n";

        // Joining with \n keeps the JSON parseable
        let telemetry = parse_all(&[stream], true);
        assert_eq!(telemetry.input_tokens, 2);
        assert_eq!(telemetry.output_tokens, 4);
    }

    #[test]
    fn test_no_frames_yields_zero_telemetry() {
        let telemetry = parse_all(&[], true);
        assert_eq!(telemetry, TelemetryRecord::default());
    }

    #[test]
    fn test_completions_text_field_counts() {
        let stream = b"data: {\"choices\":[{\"text\":\"abcdefgh\"}]}\n\ndata: [DONE]\n\n";
        let telemetry = parse_all(&[stream], true);
        assert_eq!(telemetry.output_tokens, 2);
    }
}
