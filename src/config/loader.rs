//! Loading and saving the runtime configuration file.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use super::schema::ChorusConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Base directory for all agent data (`~/.chorus-agents` by default).
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chorus-agents")
}

/// Load `config.json` from `home`, falling back to defaults when the file
/// does not exist.  A present-but-invalid file is an error, not a fallback.
pub fn load_config(home: &Path) -> Result<ChorusConfig, ConfigError> {
    let path = home.join("config.json");
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(ChorusConfig::default());
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Write the configuration back to `<home>/config.json`, creating the
/// directory if needed.
pub fn save_config(home: &Path, config: &ChorusConfig) -> Result<(), ConfigError> {
    std::fs::create_dir_all(home)?;
    let path = home.join("config.json");
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text)?;
    Ok(())
}

/// Read the validated-model cache (`<home>/available_models.json`), written
/// by the key-validation surface.  Missing or unreadable means no hint.
pub fn load_available_models(home: &Path) -> Vec<String> {
    let path = home.join("available_models.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    serde_json::from_str(&text).unwrap_or_default()
}

/// Persist the validated-model cache.
pub fn save_available_models(home: &Path, models: &[String]) -> Result<(), ConfigError> {
    std::fs::create_dir_all(home)?;
    let path = home.join("available_models.json");
    std::fs::write(&path, serde_json::to_string_pretty(models)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_uses_defaults() {
        let home = TempDir::new().unwrap();
        let cfg = load_config(home.path()).unwrap();
        assert_eq!(cfg, ChorusConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let home = TempDir::new().unwrap();
        let mut cfg = ChorusConfig::default();
        cfg.default_model = "gpt-4o-mini".to_owned();
        save_config(home.path(), &cfg).unwrap();
        let back = load_config(home.path()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let home = TempDir::new().unwrap();
        std::fs::write(home.path().join("config.json"), "{not json").unwrap();
        assert!(load_config(home.path()).is_err());
    }

    #[test]
    fn model_cache_round_trips_and_defaults_empty() {
        let home = TempDir::new().unwrap();
        assert!(load_available_models(home.path()).is_empty());
        let models = vec!["claude-sonnet-4-5".to_owned(), "gpt-4o".to_owned()];
        save_available_models(home.path(), &models).unwrap();
        assert_eq!(load_available_models(home.path()), models);
    }
}
