mod backends;
pub mod http;
mod manager;
mod ports;
mod process;
mod proxy;
mod server;

#[cfg(test)]
mod tests;

pub use manager::{BackendFactory, ManagerConfig, ModelManager};
pub use ports::find_free_port;
pub use process::ProcessHandle;
pub use proxy::StreamingProxy;
pub use server::{WrappedServer, WrappedServerFactory};

use async_trait::async_trait;
use bytes::Bytes;
use lemonade_catalog::ModelDescriptor;
use lemonade_common::TelemetryRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Byte sink a streaming response is forwarded into. Dropping the receiving
/// side signals client disconnect; sends then fail and the upstream pull is
/// aborted.
pub type ByteSink = mpsc::Sender<Bytes>;

/// Capability interface over one loaded backend subprocess.
///
/// The known recipes form a closed set; this trait exists so the model
/// manager and the HTTP layer can hold slots without caring which concrete
/// backend fills them.
#[async_trait]
pub trait ModelBackend: Send + Sync + std::fmt::Debug {
    fn server_name(&self) -> &str;

    fn descriptor(&self) -> &ModelDescriptor;

    /// Choose a port, spawn the subprocess and wait until it is ready
    async fn start(&self) -> lemonade_common::Result<()>;

    /// Graceful terminate with bounded grace, then hard kill
    async fn stop(&self);

    async fn is_running(&self) -> bool;

    /// `http://127.0.0.1:<port>` once started
    fn base_url(&self) -> Option<String>;

    /// Non-streaming POST. Failures come back as `{"error":{…}}` JSON rather
    /// than as errors, matching what clients see.
    async fn forward_request(
        &self,
        endpoint: &str,
        request: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> serde_json::Value;

    /// Stream the backend's response bytes into `sink`; with `sse`, extract
    /// telemetry from a copy of the stream without altering it.
    async fn forward_streaming_request(
        &self,
        endpoint: &str,
        request_body: Bytes,
        sink: ByteSink,
        sse: bool,
    );

    /// Measurements from the last completion this backend served
    fn telemetry(&self) -> TelemetryRecord;
}

pub type SharedBackend = Arc<dyn ModelBackend>;
