use lemonade_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::options::RecipeOptions;

/// Tag selecting which backend binary and option schema apply to a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipe {
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "whispercpp")]
    WhisperCpp,
    #[serde(rename = "oga-npu")]
    OgaNpu,
    #[serde(rename = "oga-hybrid")]
    OgaHybrid,
    #[serde(rename = "oga-cpu")]
    OgaCpu,
    #[serde(rename = "ryzenai")]
    RyzenAi,
    #[serde(rename = "flm")]
    Flm,
}

impl Recipe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::WhisperCpp => "whispercpp",
            Recipe::OgaNpu => "oga-npu",
            Recipe::OgaHybrid => "oga-hybrid",
            Recipe::OgaCpu => "oga-cpu",
            Recipe::RyzenAi => "ryzenai",
            Recipe::Flm => "flm",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "llamacpp" => Ok(Recipe::LlamaCpp),
            "whispercpp" => Ok(Recipe::WhisperCpp),
            "oga-npu" => Ok(Recipe::OgaNpu),
            "oga-hybrid" => Ok(Recipe::OgaHybrid),
            "oga-cpu" => Ok(Recipe::OgaCpu),
            "ryzenai" => Ok(Recipe::RyzenAi),
            "flm" => Ok(Recipe::Flm),
            other => Err(Error::CatalogError(format!("Unknown recipe: {}", other))),
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot pool a loaded model counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelClass {
    Llm,
    Embedding,
    Reranker,
    Audio,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Llm => "llm",
            ModelClass::Embedding => "embedding",
            ModelClass::Reranker => "reranker",
            ModelClass::Audio => "audio",
        }
    }

    pub const ALL: [ModelClass; 4] = [
        ModelClass::Llm,
        ModelClass::Embedding,
        ModelClass::Reranker,
        ModelClass::Audio,
    ];
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog entry: a model the router knows how to serve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable identifier used in API requests
    pub id: String,
    /// Display name; falls back to the id when absent
    #[serde(default)]
    pub name: Option<String>,
    pub recipe: Recipe,
    /// Artifact locator, relative to the models dir unless absolute
    pub checkpoint: String,
    /// Multimodal projector path for vision models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reasoning: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub vision: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Raw per-model options; filtered through the recipe key set on use
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ModelDescriptor {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Class used for slot accounting. `whispercpp` models are audio;
    /// otherwise the catalog labels narrow llamacpp/OGA models down from the
    /// default LLM class.
    pub fn class(&self) -> ModelClass {
        if self.recipe == Recipe::WhisperCpp {
            return ModelClass::Audio;
        }
        for label in &self.labels {
            match label.as_str() {
                "embedding" | "embeddings" => return ModelClass::Embedding,
                "reranker" | "rerank" => return ModelClass::Reranker,
                _ => {}
            }
        }
        ModelClass::Llm
    }

    /// Model-level options, restricted to the recipe's key set
    pub fn recipe_options(&self) -> RecipeOptions {
        RecipeOptions::new(self.recipe, &self.options)
    }

    pub fn artifact_path(&self, models_dir: &Path) -> PathBuf {
        let checkpoint = Path::new(&self.checkpoint);
        if checkpoint.is_absolute() {
            checkpoint.to_path_buf()
        } else {
            models_dir.join(checkpoint)
        }
    }

    pub fn mmproj_path(&self, models_dir: &Path) -> Option<PathBuf> {
        self.mmproj.as_ref().map(|p| {
            let path = Path::new(p);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                models_dir.join(path)
            }
        })
    }
}
