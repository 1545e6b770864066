//! HTTP client helpers for talking to backend subprocesses and to a
//! running router (CLI side).

use lemonade_common::{Error, Result};
use reqwest::Client;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const HEALTH_TIMEOUT_SECS: u64 = 1;
const HEALTH_CONNECT_TIMEOUT_MS: u64 = 500;

/// Client for inference calls. No total timeout: completions may
/// legitimately run for minutes.
pub fn inference_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| Error::NetworkError(format!("Failed to create HTTP client: {}", e)))
}

/// Client for readiness probes, with short timeouts
pub fn health_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
        .connect_timeout(Duration::from_millis(HEALTH_CONNECT_TIMEOUT_MS))
        .build()
        .map_err(|e| Error::NetworkError(format!("Failed to create health client: {}", e)))
}

/// True iff a GET completes with a 2xx status within `timeout`
pub async fn is_reachable(url: &str, timeout: Duration) -> bool {
    let Ok(client) = Client::builder().timeout(timeout).build() else {
        return false;
    };
    probe(&client, url).await
}

/// `is_reachable` with a caller-owned client, for tight polling loops
pub async fn probe(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Simple GET returning status and body text
pub async fn get(url: &str, timeout: Duration) -> Result<(u16, String)> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    Ok((status, body))
}

/// Simple JSON POST returning status and body text. `timeout` of `None`
/// means unbounded.
pub async fn post_json(
    url: &str,
    body: &serde_json::Value,
    timeout: Option<Duration>,
) -> Result<(u16, String)> {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder
        .build()
        .map_err(|e| Error::NetworkError(e.to_string()))?;

    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    Ok((status, text))
}
