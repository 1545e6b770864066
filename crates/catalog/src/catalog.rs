use lemonade_common::{Error, ModelEntry, PullRequest, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::descriptor::{ModelDescriptor, Recipe};
use crate::paths;

const USER_CATALOG_FILE: &str = "user_models.json";

/// On-disk shape of both the built-in and the user catalog
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    models: Vec<ModelDescriptor>,
}

/// The model catalog: a built-in model set merged with user-registered
/// models persisted under the cache dir. User entries shadow built-ins.
#[derive(Debug)]
pub struct Catalog {
    builtin: HashMap<String, ModelDescriptor>,
    user: HashMap<String, ModelDescriptor>,
    models_dir: PathBuf,
    user_catalog_path: PathBuf,
}

impl Catalog {
    /// Load from the standard cache location
    pub fn load() -> Result<Self> {
        Self::load_from_cache_dir(&paths::cache_dir())
    }

    pub fn load_from_cache_dir(cache_dir: &Path) -> Result<Self> {
        let builtin = Self::parse_models(include_str!("builtin_models.json"))?;

        let user_catalog_path = cache_dir.join(USER_CATALOG_FILE);
        let user = if user_catalog_path.exists() {
            let content = std::fs::read_to_string(&user_catalog_path)?;
            match Self::parse_models(&content) {
                Ok(models) => models,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable user catalog at {}: {}",
                        user_catalog_path.display(),
                        e
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            builtin,
            user,
            models_dir: cache_dir.join("models"),
            user_catalog_path,
        })
    }

    fn parse_models(json: &str) -> Result<HashMap<String, ModelDescriptor>> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let mut models = HashMap::new();
        for descriptor in file.models {
            if models
                .insert(descriptor.id.clone(), descriptor)
                .is_some()
            {
                return Err(Error::CatalogError("Duplicate model id in catalog".into()));
            }
        }
        Ok(models)
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Look up a descriptor; user entries shadow built-ins
    pub fn get(&self, id: &str) -> Result<&ModelDescriptor> {
        self.user
            .get(id)
            .or_else(|| self.builtin.get(id))
            .ok_or_else(|| Error::UnknownModel(id.to_string()))
    }

    /// Observable downloaded state: the artifact is present on disk
    pub fn is_downloaded(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.artifact_path(&self.models_dir).exists()
    }

    /// Catalog listing with merged downloaded status. Without `show_all`,
    /// only downloaded models are returned.
    pub fn list(&self, show_all: bool) -> Vec<ModelEntry> {
        let mut ids: Vec<&String> = self.builtin.keys().chain(self.user.keys()).collect();
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .filter_map(|id| {
                let descriptor = self.get(id).ok()?;
                let downloaded = self.is_downloaded(descriptor);
                if !show_all && !downloaded {
                    return None;
                }
                Some(ModelEntry {
                    id: descriptor.id.clone(),
                    name: descriptor.display_name().to_string(),
                    recipe: descriptor.recipe.to_string(),
                    downloaded,
                    labels: descriptor.labels.clone(),
                })
            })
            .collect()
    }

    /// Register (or update) a model in the user catalog. Fetching the
    /// artifact itself is delegated; this records the descriptor so the
    /// router can serve the model once the artifact is in place.
    pub fn pull(&mut self, request: &PullRequest) -> Result<ModelEntry> {
        request.validate()?;
        let id = request.model_name.clone();

        let has_overrides = request.checkpoint.is_some()
            || request.recipe.is_some()
            || request.mmproj.is_some()
            || request.reasoning
            || request.vision;

        if !has_overrides {
            // Plain pull of a known model: report its current state
            let descriptor = self.get(&id)?.clone();
            return Ok(self.entry_for(&descriptor));
        }

        let existing = self.user.get(&id).or_else(|| self.builtin.get(&id));

        let recipe = match &request.recipe {
            Some(tag) => Recipe::parse(tag)?,
            None => existing.map(|d| d.recipe).ok_or_else(|| {
                Error::BadRequest(format!("Registering new model {} requires a recipe", id))
            })?,
        };
        let checkpoint = match &request.checkpoint {
            Some(checkpoint) => checkpoint.clone(),
            None => existing.map(|d| d.checkpoint.clone()).ok_or_else(|| {
                Error::BadRequest(format!("Registering new model {} requires a checkpoint", id))
            })?,
        };

        let descriptor = ModelDescriptor {
            id: id.clone(),
            name: existing.and_then(|d| d.name.clone()),
            recipe,
            checkpoint,
            mmproj: request
                .mmproj
                .clone()
                .or_else(|| existing.and_then(|d| d.mmproj.clone())),
            reasoning: request.reasoning || existing.map(|d| d.reasoning).unwrap_or(false),
            vision: request.vision || existing.map(|d| d.vision).unwrap_or(false),
            labels: existing.map(|d| d.labels.clone()).unwrap_or_default(),
            options: existing.map(|d| d.options.clone()).unwrap_or_default(),
        };

        info!("Registered model {} (recipe {})", id, recipe);
        let entry = self.entry_for(&descriptor);
        self.user.insert(id, descriptor);
        self.save_user_catalog()?;
        Ok(entry)
    }

    /// Remove a model's artifact, and its user-catalog entry if one exists
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let descriptor = self.get(id)?.clone();

        let artifact = descriptor.artifact_path(&self.models_dir);
        if artifact.exists() {
            std::fs::remove_file(&artifact)?;
            info!("Deleted artifact {}", artifact.display());
        }
        if let Some(mmproj) = descriptor.mmproj_path(&self.models_dir) {
            if mmproj.exists() {
                std::fs::remove_file(&mmproj)?;
            }
        }

        if self.user.remove(id).is_some() {
            self.save_user_catalog()?;
        }
        Ok(())
    }

    fn entry_for(&self, descriptor: &ModelDescriptor) -> ModelEntry {
        ModelEntry {
            id: descriptor.id.clone(),
            name: descriptor.display_name().to_string(),
            recipe: descriptor.recipe.to_string(),
            downloaded: self.is_downloaded(descriptor),
            labels: descriptor.labels.clone(),
        }
    }

    fn save_user_catalog(&self) -> Result<()> {
        if let Some(parent) = self.user_catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut models: Vec<ModelDescriptor> = self.user.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        let content = serde_json::to_string_pretty(&CatalogFile { models })?;
        std::fs::write(&self.user_catalog_path, content)?;
        Ok(())
    }
}
