use crate::{Catalog, ModelClass, ModelDescriptor, Recipe, RecipeOptions};
use lemonade_common::{Error, PullRequest, Result};
use serde_json::{json, Map, Value};

fn raw(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[test]
fn test_options_drop_sentinels() {
    let options = RecipeOptions::new(
        Recipe::LlamaCpp,
        &raw(json!({"ctx_size": -1, "llamacpp_backend": "rocm"})),
    );

    assert!(!options.contains("ctx_size"));
    assert_eq!(options.get_option("llamacpp_backend"), json!("rocm"));
    // Absent keys resolve to compile-time defaults
    assert_eq!(options.get_option("ctx_size"), json!(4096));
}

#[test]
fn test_options_restrict_to_recipe_keys() {
    let options = RecipeOptions::new(
        Recipe::Flm,
        &raw(json!({"ctx_size": 2048, "llamacpp_backend": "rocm"})),
    );
    assert_eq!(options.get_option("ctx_size"), json!(2048));
    assert!(!options.contains("llamacpp_backend"));

    let options = RecipeOptions::new(Recipe::WhisperCpp, &raw(json!({"ctx_size": 2048})));
    assert!(!options.contains("ctx_size"));
}

#[test]
fn test_inherit_prefers_stored_values() -> Result<()> {
    let model = RecipeOptions::new(Recipe::LlamaCpp, &raw(json!({"ctx_size": 8192})));
    let request = RecipeOptions::new(
        Recipe::LlamaCpp,
        &raw(json!({"ctx_size": 2048, "llamacpp_backend": "cpu"})),
    );

    let merged = model.inherit(&request)?;
    assert_eq!(merged.get_option("ctx_size"), json!(8192));
    assert_eq!(merged.get_option("llamacpp_backend"), json!("cpu"));
    Ok(())
}

#[test]
fn test_inherit_is_right_associative_with_left_precedence() -> Result<()> {
    let a = RecipeOptions::new(Recipe::LlamaCpp, &raw(json!({"ctx_size": 1024})));
    let b = RecipeOptions::new(Recipe::LlamaCpp, &raw(json!({"llamacpp_backend": "rocm"})));
    let c = RecipeOptions::new(
        Recipe::LlamaCpp,
        &raw(json!({"llamacpp_backend": "cpu", "llamacpp_args": "--no-mmap"})),
    );

    let left = a.inherit(&b)?.inherit(&c)?;
    let right = a.inherit(&b.inherit(&c)?)?;
    assert_eq!(left, right);
    assert_eq!(left.get_option("ctx_size"), json!(1024));
    assert_eq!(left.get_option("llamacpp_backend"), json!("rocm"));
    assert_eq!(left.get_option("llamacpp_args"), json!("--no-mmap"));
    Ok(())
}

#[test]
fn test_inherit_rejects_recipe_mismatch() {
    let a = RecipeOptions::empty(Recipe::LlamaCpp);
    let b = RecipeOptions::empty(Recipe::Flm);
    match a.inherit(&b) {
        Err(Error::RecipeMismatch { expected, actual }) => {
            assert_eq!(expected, "llamacpp");
            assert_eq!(actual, "flm");
        }
        other => panic!("expected RecipeMismatch, got {:?}", other),
    }
}

#[test]
fn test_to_log_string_resolves_defaults() {
    let options = RecipeOptions::new(Recipe::LlamaCpp, &raw(json!({"ctx_size": 2048})));

    assert_eq!(
        options.to_log_string(true),
        "ctx_size=2048, llamacpp_backend=vulkan, llamacpp_args=(none)"
    );
    assert_eq!(options.to_log_string(false), "ctx_size=2048");
}

#[test]
fn test_recipe_round_trip() -> Result<()> {
    for tag in [
        "llamacpp",
        "whispercpp",
        "oga-npu",
        "oga-hybrid",
        "oga-cpu",
        "ryzenai",
        "flm",
    ] {
        assert_eq!(Recipe::parse(tag)?.as_str(), tag);
    }
    assert!(Recipe::parse("vllm").is_err());
    Ok(())
}

#[test]
fn test_class_derivation() -> Result<()> {
    let catalog = Catalog::load_from_cache_dir(std::path::Path::new("/nonexistent"))?;

    assert_eq!(
        catalog.get("Qwen2.5-0.5B-Instruct-GGUF")?.class(),
        ModelClass::Llm
    );
    assert_eq!(
        catalog.get("nomic-embed-text-v1.5-GGUF")?.class(),
        ModelClass::Embedding
    );
    assert_eq!(
        catalog.get("bge-reranker-v2-m3-GGUF")?.class(),
        ModelClass::Reranker
    );
    assert_eq!(
        catalog.get("Whisper-Base-WhisperCpp")?.class(),
        ModelClass::Audio
    );
    Ok(())
}

#[test]
fn test_unknown_model_is_404() -> Result<()> {
    let catalog = Catalog::load_from_cache_dir(std::path::Path::new("/nonexistent"))?;
    let err = catalog.get("no-such-model").unwrap_err();
    assert_eq!(err.status_code(), 404);
    Ok(())
}

#[test]
fn test_list_show_all_and_downloaded_filter() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut catalog = Catalog::load_from_cache_dir(dir.path())?;

    // Nothing on disk yet: default listing is empty, show_all lists the catalog
    assert!(catalog.list(false).is_empty());
    let all = catalog.list(true);
    assert!(all.len() >= 5);
    assert!(all.iter().all(|entry| !entry.downloaded));

    // Materialize one artifact and it shows up as downloaded
    let descriptor = catalog.get("Qwen2.5-0.5B-Instruct-GGUF")?.clone();
    let artifact = descriptor.artifact_path(catalog.models_dir());
    std::fs::create_dir_all(artifact.parent().expect("parent")).expect("mkdir");
    std::fs::write(&artifact, b"gguf").expect("write artifact");

    let downloaded = catalog.list(false);
    assert_eq!(downloaded.len(), 1);
    assert_eq!(downloaded[0].id, "Qwen2.5-0.5B-Instruct-GGUF");
    assert!(downloaded[0].downloaded);

    // Delete removes the artifact again
    catalog.delete("Qwen2.5-0.5B-Instruct-GGUF")?;
    assert!(!artifact.exists());
    assert!(catalog.list(false).is_empty());
    Ok(())
}

#[test]
fn test_pull_registers_user_model_and_persists() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let mut catalog = Catalog::load_from_cache_dir(dir.path())?;
        let request = PullRequest {
            model_name: "user.tiny-llama".into(),
            checkpoint: Some("tiny-llama/tiny-llama-q4.gguf".into()),
            recipe: Some("llamacpp".into()),
            reasoning: false,
            vision: false,
            mmproj: None,
        };
        let entry = catalog.pull(&request)?;
        assert_eq!(entry.id, "user.tiny-llama");
        assert_eq!(entry.recipe, "llamacpp");
        assert!(!entry.downloaded);
    }

    // A fresh load sees the persisted user entry
    let catalog = Catalog::load_from_cache_dir(dir.path())?;
    let descriptor = catalog.get("user.tiny-llama")?;
    assert_eq!(descriptor.recipe, Recipe::LlamaCpp);
    assert_eq!(descriptor.checkpoint, "tiny-llama/tiny-llama-q4.gguf");
    Ok(())
}

#[test]
fn test_pull_new_model_requires_recipe_and_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut catalog = Catalog::load_from_cache_dir(dir.path())?;

    let request = PullRequest {
        model_name: "user.mystery".into(),
        checkpoint: Some("mystery.gguf".into()),
        recipe: None,
        reasoning: false,
        vision: false,
        mmproj: None,
    };
    assert_eq!(catalog.pull(&request).unwrap_err().status_code(), 400);

    // Plain pull of an unknown model is a 404
    let request = PullRequest {
        model_name: "user.mystery".into(),
        checkpoint: None,
        recipe: None,
        reasoning: false,
        vision: false,
        mmproj: None,
    };
    assert_eq!(catalog.pull(&request).unwrap_err().status_code(), 404);
    Ok(())
}

#[test]
fn test_descriptor_artifact_paths() {
    let descriptor = ModelDescriptor {
        id: "m".into(),
        name: None,
        recipe: Recipe::LlamaCpp,
        checkpoint: "sub/model.gguf".into(),
        mmproj: Some("/abs/mmproj.gguf".into()),
        reasoning: false,
        vision: true,
        labels: vec![],
        options: Map::new(),
    };

    let models_dir = std::path::Path::new("/cache/models");
    assert_eq!(
        descriptor.artifact_path(models_dir),
        std::path::Path::new("/cache/models/sub/model.gguf")
    );
    assert_eq!(
        descriptor.mmproj_path(models_dir).expect("mmproj"),
        std::path::Path::new("/abs/mmproj.gguf")
    );
}
