use serde::Serialize;

/// Per-completion measurements produced by the streaming proxy.
///
/// `input_tokens`/`output_tokens` come from the backend's final `usage` frame
/// when present; otherwise they hold the proxy's character-count
/// approximation (or stay 0 when approximation is disabled).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Seconds from request start to the first SSE data frame
    pub time_to_first_token: f64,
    /// Output tokens over the first-token-to-completion window; 0 when unknown
    pub tokens_per_second: f64,
}
