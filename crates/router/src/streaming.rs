//! SSE passthrough responses.
//!
//! The backend's bytes flow through a bounded channel into the response
//! body, so a slow client applies backpressure to the upstream pull and a
//! disconnected client tears it down.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use lemonade_runtime::SharedBackend;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::error;

// Maximum chunks buffered before the upstream pull has to wait
const BUFFER_SIZE: usize = 32;

/// Stream a completion through the backend, forwarding its SSE bytes
/// verbatim while telemetry is extracted from a copy.
pub fn sse_passthrough(server: SharedBackend, endpoint: &'static str, body: Bytes) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(BUFFER_SIZE);

    tokio::spawn(async move {
        server
            .forward_streaming_request(endpoint, body, tx, true)
            .await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build streaming response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
