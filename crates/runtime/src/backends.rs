//! Concrete backend launch recipes: which executable, which argv, which
//! warmup for each recipe tag. Backends hold no state of their own; the
//! wrapped server owns everything per instance.

use lemonade_catalog::{ModelClass, ModelDescriptor, Recipe, RecipeOptions};
use lemonade_common::{Error, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;

pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Display name used in logs and error payloads
pub fn server_name_for(recipe: Recipe) -> &'static str {
    match recipe {
        Recipe::LlamaCpp => "llama-server",
        Recipe::WhisperCpp => "whisper-server",
        Recipe::Flm => "flm-server",
        Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::OgaCpu | Recipe::RyzenAi => "oga-server",
    }
}

/// Build the argv for a backend subprocess serving `descriptor` on `port`
pub fn build_command(
    descriptor: &ModelDescriptor,
    options: &RecipeOptions,
    models_dir: &Path,
    bin_dir: &Path,
    port: u16,
) -> Result<Command> {
    match descriptor.recipe {
        Recipe::LlamaCpp => llama_command(descriptor, options, models_dir, bin_dir, port),
        Recipe::WhisperCpp => whisper_command(descriptor, models_dir, bin_dir, port),
        Recipe::Flm => flm_command(descriptor, options, port),
        Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::OgaCpu | Recipe::RyzenAi => {
            oga_command(descriptor, options, models_dir, bin_dir, port)
        }
    }
}

/// Optional dummy request sent after readiness so the first real completion
/// doesn't pay compilation/warm-up cost. Only the accelerator recipes need
/// one.
pub fn warmup_request(descriptor: &ModelDescriptor) -> Option<(&'static str, Value)> {
    match descriptor.recipe {
        Recipe::Flm | Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::RyzenAi => Some((
            "/v1/chat/completions",
            json!({
                "model": descriptor.id,
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
                "stream": false,
            }),
        )),
        _ => None,
    }
}

fn llama_command(
    descriptor: &ModelDescriptor,
    options: &RecipeOptions,
    models_dir: &Path,
    bin_dir: &Path,
    port: u16,
) -> Result<Command> {
    // One binary tree per compute backend under <bin>/llamacpp/<backend>/
    let exe = bin_dir
        .join("llamacpp")
        .join(options.llamacpp_backend())
        .join("llama-server");

    let mut cmd = Command::new(exe);
    cmd.arg("--model")
        .arg(descriptor.artifact_path(models_dir))
        .arg("--ctx-size")
        .arg(options.ctx_size().to_string())
        .arg("--host")
        .arg(LOOPBACK_HOST)
        .arg("--port")
        .arg(port.to_string());

    match descriptor.class() {
        ModelClass::Embedding => {
            cmd.arg("--embeddings");
        }
        ModelClass::Reranker => {
            cmd.arg("--reranking");
        }
        _ => {}
    }

    if let Some(mmproj) = descriptor.mmproj_path(models_dir) {
        cmd.arg("--mmproj").arg(mmproj);
    }

    // User-supplied passthrough flags; must not conflict with managed args
    for extra in options.llamacpp_args().split_whitespace() {
        cmd.arg(extra);
    }

    Ok(cmd)
}

fn whisper_command(
    descriptor: &ModelDescriptor,
    models_dir: &Path,
    bin_dir: &Path,
    port: u16,
) -> Result<Command> {
    let exe = bin_dir.join("whispercpp").join("whisper-server");

    let mut cmd = Command::new(exe);
    cmd.arg("--model")
        .arg(descriptor.artifact_path(models_dir))
        .arg("--host")
        .arg(LOOPBACK_HOST)
        .arg("--port")
        .arg(port.to_string());
    Ok(cmd)
}

fn flm_command(descriptor: &ModelDescriptor, options: &RecipeOptions, port: u16) -> Result<Command> {
    // FLM installs itself on PATH; it is not a managed download
    let exe = find_on_path("flm").ok_or_else(|| Error::BackendStartFailed {
        reason: "flm executable not found on PATH".into(),
        exit_code: None,
    })?;

    let mut cmd = Command::new(exe);
    cmd.arg("serve")
        .arg(&descriptor.checkpoint)
        .arg("--port")
        .arg(port.to_string())
        .arg("--ctx-size")
        .arg(options.ctx_size().to_string());
    Ok(cmd)
}

fn oga_command(
    descriptor: &ModelDescriptor,
    options: &RecipeOptions,
    models_dir: &Path,
    bin_dir: &Path,
    port: u16,
) -> Result<Command> {
    let device = match descriptor.recipe {
        Recipe::OgaNpu => "npu",
        Recipe::OgaHybrid | Recipe::RyzenAi => "hybrid",
        _ => "cpu",
    };

    let mut cmd = Command::new(bin_dir.join("oga").join("oga-server"));
    cmd.arg("--model")
        .arg(descriptor.artifact_path(models_dir))
        .arg("--device")
        .arg(device)
        .arg("--host")
        .arg(LOOPBACK_HOST)
        .arg("--port")
        .arg(port.to_string())
        .arg("--ctx-size")
        .arg(options.ctx_size().to_string());
    Ok(cmd)
}

fn find_on_path(name: &str) -> Option<std::path::PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = dir.join(format!("{}.exe", name));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}
