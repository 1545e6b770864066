//! One wrapped server = one inference subprocess behind a loopback port.

use async_trait::async_trait;
use bytes::Bytes;
use lemonade_catalog::{ModelDescriptor, RecipeOptions};
use lemonade_common::{Error, Result, TelemetryRecord};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::manager::BackendFactory;
use crate::process::ProcessHandle;
use crate::{backends, http, ports, ByteSink, ModelBackend, SharedBackend, StreamingProxy};

const PORT_SEED: u16 = 8001;
const STOP_GRACE_SECS: u64 = 5;
// Up to 10 minutes at 100ms intervals; large models can take a while to load
const READY_MAX_ATTEMPTS: u32 = 6000;
const READY_POLL_INTERVAL_MS: u64 = 100;
const READY_PROGRESS_EVERY: u32 = 100;
const WARMUP_TIMEOUT_SECS: u64 = 120;

enum ReadyOutcome {
    Ready,
    Died(Option<i32>),
    TimedOut,
}

/// A catalog model bound to a running subprocess. Created by the model
/// manager, which owns it exclusively through an `Arc` slot.
pub struct WrappedServer {
    server_name: String,
    descriptor: ModelDescriptor,
    options: RecipeOptions,
    models_dir: PathBuf,
    bin_dir: PathBuf,
    approximate_tokens: bool,
    port: StdMutex<Option<u16>>,
    process: Mutex<Option<ProcessHandle>>,
    telemetry: StdMutex<TelemetryRecord>,
    inference_client: reqwest::Client,
    health_client: reqwest::Client,
}

impl std::fmt::Debug for WrappedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedServer")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl WrappedServer {
    pub fn new(
        descriptor: ModelDescriptor,
        options: RecipeOptions,
        models_dir: PathBuf,
        bin_dir: PathBuf,
        approximate_tokens: bool,
    ) -> Result<Self> {
        Ok(Self {
            server_name: backends::server_name_for(descriptor.recipe).to_string(),
            descriptor,
            options,
            models_dir,
            bin_dir,
            approximate_tokens,
            port: StdMutex::new(None),
            process: Mutex::new(None),
            telemetry: StdMutex::new(TelemetryRecord::default()),
            inference_client: http::inference_client()?,
            health_client: http::health_client()?,
        })
    }

    fn set_telemetry(&self, record: TelemetryRecord) {
        info!(
            "{} completion: input_tokens={} output_tokens={} ttft={:.3}s tps={:.1}",
            self.server_name,
            record.input_tokens,
            record.output_tokens,
            record.time_to_first_token,
            record.tokens_per_second
        );
        if let Ok(mut guard) = self.telemetry.lock() {
            *guard = record;
        }
    }

    fn store_port(&self, port: u16) {
        if let Ok(mut guard) = self.port.lock() {
            *guard = Some(port);
        }
    }

    /// Poll both health endpoints until the backend answers, the process
    /// dies, or the ceiling is reached.
    async fn wait_for_ready(&self, process: &mut ProcessHandle, port: u16) -> ReadyOutcome {
        let base = format!("http://{}:{}", backends::LOOPBACK_HOST, port);
        let health_url = format!("{}/health", base);
        // FLM answers on /v1/health, llama-server on /health
        let health_url_v1 = format!("{}/v1/health", base);

        info!("Waiting for {} to be ready...", self.server_name);

        for attempt in 0..READY_MAX_ATTEMPTS {
            if !process.is_running() {
                let exit_code = process.exit_code();
                error!(
                    "{} process terminated during startup with exit code {:?}; \
                     this usually means missing drivers or an incompatible model file",
                    self.server_name, exit_code
                );
                return ReadyOutcome::Died(exit_code);
            }

            if http::probe(&self.health_client, &health_url).await
                || http::probe(&self.health_client, &health_url_v1).await
            {
                info!("{} is ready on port {}", self.server_name, port);
                return ReadyOutcome::Ready;
            }

            tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;

            if attempt > 0 && attempt % READY_PROGRESS_EVERY == 0 {
                info!("Still waiting for {}...", self.server_name);
            }
        }

        ReadyOutcome::TimedOut
    }

    async fn run_warmup(&self) {
        if let Some((endpoint, body)) = backends::warmup_request(&self.descriptor) {
            info!("Warming up {} with a dummy request", self.server_name);
            let response = self
                .forward_request(
                    endpoint,
                    &body,
                    Some(Duration::from_secs(WARMUP_TIMEOUT_SECS)),
                )
                .await;
            if response.get("error").is_some() {
                warn!("{} warmup request failed: {}", self.server_name, response);
            }
        }
    }
}

#[async_trait]
impl ModelBackend for WrappedServer {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn start(&self) -> Result<()> {
        let port = ports::find_free_port(PORT_SEED).await?;
        info!("{} will use port {}", self.server_name, port);
        info!(
            "Launching {} for {} ({})",
            self.server_name,
            self.descriptor.id,
            self.options.to_log_string(true)
        );

        let command = backends::build_command(
            &self.descriptor,
            &self.options,
            &self.models_dir,
            &self.bin_dir,
            port,
        )?;

        let mut process = ProcessHandle::spawn(&self.server_name, command).map_err(|e| {
            Error::BackendStartFailed {
                reason: format!("failed to spawn {}: {}", self.server_name, e),
                exit_code: None,
            }
        })?;

        match self.wait_for_ready(&mut process, port).await {
            ReadyOutcome::Ready => {
                self.store_port(port);
                *self.process.lock().await = Some(process);
                self.run_warmup().await;
                Ok(())
            }
            ReadyOutcome::Died(exit_code) => Err(Error::BackendStartFailed {
                reason: format!("{} process terminated during startup", self.server_name),
                exit_code,
            }),
            ReadyOutcome::TimedOut => {
                warn!("{} failed to start within timeout", self.server_name);
                process
                    .terminate(Duration::from_secs(STOP_GRACE_SECS))
                    .await;
                Err(Error::BackendStartFailed {
                    reason: format!("{} did not become ready within timeout", self.server_name),
                    exit_code: process.exit_code(),
                })
            }
        }
    }

    async fn stop(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            process
                .terminate(Duration::from_secs(STOP_GRACE_SECS))
                .await;
            process.join().await;
        }
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => process.is_running(),
            None => false,
        }
    }

    fn base_url(&self) -> Option<String> {
        self.port
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .map(|port| format!("http://{}:{}", backends::LOOPBACK_HOST, port))
    }

    async fn forward_request(
        &self,
        endpoint: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Value {
        if !self.is_running().await {
            return Error::ModelNotLoaded(self.server_name.clone()).to_response_value();
        }
        let Some(base_url) = self.base_url() else {
            return Error::ModelNotLoaded(self.server_name.clone()).to_response_value();
        };

        let url = format!("{}{}", base_url, endpoint);
        let mut builder = self.inference_client.post(&url).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<Value>().await.unwrap_or_else(|e| {
                    Error::NetworkError(format!("invalid JSON from backend: {}", e))
                        .to_response_value()
                })
            }
            Ok(response) => {
                let status_code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let details =
                    serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
                Error::BackendError {
                    message: format!("{} request failed", self.server_name),
                    status_code,
                    response: details,
                }
                .to_response_value()
            }
            Err(e) => Error::NetworkError(e.to_string()).to_response_value(),
        }
    }

    async fn forward_streaming_request(
        &self,
        endpoint: &str,
        request_body: Bytes,
        sink: ByteSink,
        sse: bool,
    ) {
        if !self.is_running().await {
            let frame = format!(
                "data: {{\"error\":{{\"message\":\"No model loaded: {}\",\"type\":\"model_not_loaded\"}}}}\n\n",
                self.server_name
            );
            let _ = sink.send(Bytes::from(frame)).await;
            return;
        }
        let Some(base_url) = self.base_url() else {
            return;
        };
        let url = format!("{}{}", base_url, endpoint);

        // Completion calls carry no proxy-side timeout
        if sse {
            StreamingProxy::forward_sse_stream(
                &self.inference_client,
                &url,
                request_body,
                &sink,
                self.approximate_tokens,
                |telemetry| self.set_telemetry(telemetry),
            )
            .await;
        } else {
            StreamingProxy::forward_byte_stream(&self.inference_client, &url, request_body, &sink)
                .await;
        }
    }

    fn telemetry(&self) -> TelemetryRecord {
        self.telemetry
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// Builds `WrappedServer`s for the recipes the catalog knows about
pub struct WrappedServerFactory {
    pub models_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub approximate_tokens: bool,
}

#[async_trait]
impl BackendFactory for WrappedServerFactory {
    async fn create(
        &self,
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
    ) -> Result<SharedBackend> {
        let server = WrappedServer::new(
            descriptor.clone(),
            options.clone(),
            self.models_dir.clone(),
            self.bin_dir.clone(),
            self.approximate_tokens,
        )?;
        Ok(Arc::new(server))
    }
}
