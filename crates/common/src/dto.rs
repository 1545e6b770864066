use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The two fields the router reads out of a completion body before
/// forwarding the raw bytes to the backend.
#[derive(Debug, Clone)]
pub struct CompletionRouting {
    pub model: String,
    pub stream: bool,
}

impl CompletionRouting {
    /// Parse a copy of the request body; the original bytes are forwarded
    /// untouched.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::BadRequest(format!("Invalid JSON body: {}", e)))?;

        let model = value
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| Error::BadRequest("Missing required field: model".into()))?
            .to_string();

        let stream = value
            .get("stream")
            .and_then(|s| s.as_bool())
            .unwrap_or(false);

        Ok(Self { model, stream })
    }
}

/// Health response payload
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub models_loaded: Vec<String>,
}

/// One row of the catalog listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    pub recipe: String,
    pub downloaded: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// `GET /api/v1/models` response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

/// `POST /api/v1/pull` request
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub model_name: String,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub mmproj: Option<String>,
}

impl PullRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(Error::BadRequest("model_name cannot be empty".into()));
        }
        Ok(())
    }
}

/// `POST /api/v1/delete` request
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub model: String,
}

impl DeleteRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::BadRequest("model cannot be empty".into()));
        }
        Ok(())
    }
}
