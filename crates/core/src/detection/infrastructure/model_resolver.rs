use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelResolveError {
    #[error("model {name} not found in {}", searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound { name: String, searched: Vec<PathBuf> },
    #[error("could not determine cache directory")]
    NoCacheDir,
}

/// Resolve a model file by name.
///
/// Resolution order:
/// 1. Explicit model directory (from configuration)
/// 2. User cache directory (platform-specific)
///
/// Models are provisioned out of band; nothing is downloaded at runtime.
pub fn resolve(name: &str, model_dir: Option<&Path>) -> Result<PathBuf, ModelResolveError> {
    let mut searched = Vec::new();

    if let Some(dir) = model_dir {
        let path = dir.join(name);
        if path.exists() {
            return Ok(path);
        }
        searched.push(dir.to_path_buf());
    }

    let cache_dir = model_cache_dir()?;
    let cached_path = cache_dir.join(name);
    if cached_path.exists() {
        return Ok(cached_path);
    }
    searched.push(cache_dir);

    Err(ModelResolveError::NotFound {
        name: name.to_string(),
        searched,
    })
}

/// Platform-specific model cache directory.
///
/// - macOS: `~/Library/Application Support/DeskGuard/models/`
/// - Linux: `$XDG_CACHE_HOME/DeskGuard/models/` or `~/.cache/DeskGuard/models/`
/// - Windows: `%LOCALAPPDATA%/DeskGuard/models/`
pub fn model_cache_dir() -> Result<PathBuf, ModelResolveError> {
    #[cfg(target_os = "macos")]
    {
        dirs::data_dir()
            .map(|d| d.join("DeskGuard").join("models"))
            .ok_or(ModelResolveError::NoCacheDir)
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::cache_dir()
            .map(|d| d.join("DeskGuard").join("models"))
            .ok_or(ModelResolveError::NoCacheDir)
    }
}
