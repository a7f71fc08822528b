use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration, usually loaded from `config.toml`.
///
/// Every section is optional; omitted keys fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_level: String,
    pub model: ModelConfig,
    pub ocr: OcrConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Usually supplied through `GEMINI_API_KEY` rather than the file.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcrConfig {
    pub tesseract_data_path: Option<String>,
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for stored images and records. The platform data dir when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            model: ModelConfig::default(),
            ocr: OcrConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            timeout_secs: DEFAULT_MODEL_TIMEOUT_SECS,
            api_key: None,
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self { tesseract_data_path: None, language: "eng".to_string() }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_content)?)
    }

    /// Load from `path`. `None` when the file does not exist.
    ///
    /// Nothing is logged here: the log level comes from the loaded config, so
    /// the caller reports which source was used once logging is set up.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Read { path: path.to_path_buf(), source }),
        }
    }

    /// Apply environment overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the variable source.
    ///
    /// `GEMINI_API_KEY` wins over `API_KEY`; `TILLSLIP_MODEL` replaces the
    /// model name. Empty values are ignored.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(name) = non_empty("TILLSLIP_MODEL") {
            self.model.name = name;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model.name, DEFAULT_MODEL);
        assert_eq!(config.model.timeout(), Duration::from_secs(30));
        assert_eq!(config.ocr.language, "eng");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [model]
            timeout_secs = 5

            [storage]
            data_dir = "/srv/tillslip"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.model.timeout_secs, 5);
        assert_eq!(config.model.base_url, DEFAULT_MODEL_BASE_URL);
        assert_eq!(config.storage.data_dir, Some(PathBuf::from("/srv/tillslip")));
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = Config::from_toml("[model]\ntimeout_secs = 0").unwrap();
        assert_eq!(config.model.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(matches!(Config::from_toml("[model"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_reported_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load(&dir.path().join("absent.toml")).unwrap(), None);
    }

    #[test]
    fn unreadable_path_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ocr]\nlanguage = \"deu\"\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().unwrap().ocr.language, "deu");
    }

    #[test]
    fn gemini_key_wins_over_generic_key() {
        let config = Config::default()
            .with_overrides_from(env(&[("API_KEY", "generic"), ("GEMINI_API_KEY", "gemini")]));
        assert_eq!(config.model.api_key.as_deref(), Some("gemini"));

        let config = Config::default().with_overrides_from(env(&[("API_KEY", "generic")]));
        assert_eq!(config.model.api_key.as_deref(), Some("generic"));
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let mut base = Config::default();
        base.model.api_key = Some("from-file".into());
        let config = base.with_overrides_from(env(&[("GEMINI_API_KEY", " "), ("TILLSLIP_MODEL", "")]));
        assert_eq!(config.model.api_key.as_deref(), Some("from-file"));
        assert_eq!(config.model.name, DEFAULT_MODEL);
    }

    #[test]
    fn model_name_override() {
        let config =
            Config::default().with_overrides_from(env(&[("TILLSLIP_MODEL", "gemini-2.0-flash")]));
        assert_eq!(config.model.name, "gemini-2.0-flash");
    }
}
