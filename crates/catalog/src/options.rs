use lemonade_common::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::descriptor::Recipe;

const DEFAULT_CTX_SIZE: i64 = 4096;
const DEFAULT_LLAMACPP_BACKEND: &str = "vulkan";
const DEFAULT_LLAMACPP_ARGS: &str = "";

/// Option keys a recipe accepts, in logging order
pub fn keys_for_recipe(recipe: Recipe) -> &'static [&'static str] {
    match recipe {
        Recipe::LlamaCpp => &["ctx_size", "llamacpp_backend", "llamacpp_args"],
        Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::OgaCpu | Recipe::RyzenAi | Recipe::Flm => {
            &["ctx_size"]
        }
        // whispercpp has currently no option
        Recipe::WhisperCpp => &[],
    }
}

fn default_for(key: &str) -> Value {
    match key {
        "ctx_size" => Value::from(DEFAULT_CTX_SIZE),
        "llamacpp_backend" => Value::from(DEFAULT_LLAMACPP_BACKEND),
        "llamacpp_args" => Value::from(DEFAULT_LLAMACPP_ARGS),
        _ => Value::Null,
    }
}

/// `-1` and `""` are "not set" sentinels and never stored
fn is_empty_option(value: &Value) -> bool {
    (value.is_number() && value.as_i64() == Some(-1))
        || (value.is_string() && value.as_str() == Some(""))
}

/// Options for one recipe: a key/value map restricted to the recipe's
/// allowed keys, with merge-by-inheritance and per-key defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeOptions {
    recipe: Recipe,
    options: BTreeMap<String, Value>,
}

impl RecipeOptions {
    /// Keep only keys the recipe allows, dropping empty sentinels
    pub fn new(recipe: Recipe, raw: &serde_json::Map<String, Value>) -> Self {
        let mut options = BTreeMap::new();
        for key in keys_for_recipe(recipe) {
            if let Some(value) = raw.get(*key) {
                if !is_empty_option(value) {
                    options.insert((*key).to_string(), value.clone());
                }
            }
        }
        Self { recipe, options }
    }

    pub fn empty(recipe: Recipe) -> Self {
        Self {
            recipe,
            options: BTreeMap::new(),
        }
    }

    pub fn recipe(&self) -> Recipe {
        self.recipe
    }

    /// Merge in keys from `other` that are absent here. Stored values win;
    /// the donor must share the recipe.
    pub fn inherit(&self, other: &RecipeOptions) -> Result<RecipeOptions> {
        if other.recipe != self.recipe {
            return Err(Error::RecipeMismatch {
                expected: self.recipe.to_string(),
                actual: other.recipe.to_string(),
            });
        }

        let mut merged = self.options.clone();
        for (key, value) in &other.options {
            if !merged.contains_key(key) && !is_empty_option(value) {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(RecipeOptions {
            recipe: self.recipe,
            options: merged,
        })
    }

    /// Stored value, or the compile-time default for the key
    pub fn get_option(&self, key: &str) -> Value {
        self.options
            .get(key)
            .cloned()
            .unwrap_or_else(|| default_for(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn ctx_size(&self) -> i64 {
        self.get_option("ctx_size")
            .as_i64()
            .unwrap_or(DEFAULT_CTX_SIZE)
    }

    pub fn llamacpp_backend(&self) -> String {
        match self.get_option("llamacpp_backend") {
            Value::String(s) => s,
            _ => DEFAULT_LLAMACPP_BACKEND.to_string(),
        }
    }

    pub fn llamacpp_args(&self) -> String {
        match self.get_option("llamacpp_args") {
            Value::String(s) => s,
            _ => DEFAULT_LLAMACPP_ARGS.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// `key=value` pairs in recipe-key order. Numbers print as integers,
    /// the empty string as `(none)`. With `resolve_defaults` off, keys not
    /// present in the stored map are omitted.
    pub fn to_log_string(&self, resolve_defaults: bool) -> String {
        let mut parts = Vec::new();
        for key in keys_for_recipe(self.recipe) {
            if resolve_defaults || self.options.contains_key(*key) {
                parts.push(format!("{}={}", key, format_option(&self.get_option(key))));
            }
        }
        parts.join(", ")
    }
}

fn format_option(value: &Value) -> String {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .unwrap_or_else(|| n.to_string()),
        Value::String(s) if s.is_empty() => "(none)".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
