//! Cache directory layout. `LEMONADE_CACHE_DIR` overrides the per-user
//! default; downloaded binaries live under `<cache>/bin`, model artifacts
//! under `<cache>/models`.

use lemonade_common::Result;
use std::path::PathBuf;

pub const CACHE_DIR_ENV: &str = "LEMONADE_CACHE_DIR";

pub fn cache_dir() -> PathBuf {
    resolve_cache_dir(std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from))
}

fn resolve_cache_dir(override_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir;
    }
    dirs::home_dir()
        .map(|home| home.join(".cache").join("lemonade"))
        .unwrap_or_else(|| PathBuf::from(".cache/lemonade"))
}

pub fn models_dir() -> PathBuf {
    cache_dir().join("models")
}

/// Downloaded backend binaries; created on demand
pub fn bin_dir() -> Result<PathBuf> {
    let dir = cache_dir().join("bin");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}
