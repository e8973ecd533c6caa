use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use eventfeed_core::CoreConfig;
use serde::{Deserialize, Serialize};

pub const API_URL_ENV: &str = "EVENTFEED_API_URL";
pub const TOKEN_ENV: &str = "EVENTFEED_TOKEN";

/// CLI configuration: the pipeline settings plus the bearer token
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Bearer token for the events API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(flatten)]
    pub core: CoreConfig,
}

/// Values given on the command line; they win over the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub token: Option<String>,
}

impl CliConfig {
    /// `<config_dir>/eventfeed/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("eventfeed").join("config.json"))
    }

    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    /// Load from an explicit path, else the default path if it exists, else defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Apply environment then command-line overrides
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
        overrides: &Overrides,
    ) {
        if let Some(url) = env(API_URL_ENV).filter(|v| !v.is_empty()) {
            self.core.api_base_url = url;
        }
        if let Some(token) = env(TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.token = Some(token);
        }
        if let Some(url) = &overrides.api_url {
            self.core.api_base_url = url.clone();
        }
        if let Some(token) = &overrides.token {
            self.token = Some(token.clone());
        }
    }

    /// Full resolution as used by the binary
    pub fn resolve(explicit: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = Self::discover(explicit)?;
        config.apply_overrides(|key| std::env::var(key).ok(), overrides);
        config.core.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn require_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .with_context(|| format!("No API token configured (set {} or pass --token)", TOKEN_ENV))
    }

    /// Copy safe to print, with the token masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if let Some(token) = &config.token {
            let visible: String = token.chars().take(4).collect();
            config.token = Some(format!("{}…", visible));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config_flattens_core_settings() {
        let json = r#"{
            "token": "secret",
            "apiBaseUrl": "https://events.example.com",
            "pageSize": 12,
            "thumbnail": { "maxConcurrent": 2 }
        }"#;
        let config = CliConfig::from_json(json).unwrap();
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.core.api_base_url, "https://events.example.com");
        assert_eq!(config.core.page_size, 12);
        assert_eq!(config.core.thumbnail.max_concurrent, 2);
        assert_eq!(config.core.thumbnail.sub_batch_size, 5);
    }

    #[test]
    fn test_parse_config_minimal() {
        let config = CliConfig::from_json("{}").unwrap();
        assert!(config.token.is_none());
        assert_eq!(config.core, CoreConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"callerId": "kiosk-3"}"#).unwrap();

        let config = CliConfig::discover(Some(&path)).unwrap();
        assert_eq!(config.core.caller_id, "kiosk-3");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_flags_win_over_environment() {
        let mut config = CliConfig::default();
        let env = env_from(&[(API_URL_ENV, "http://env:1"), (TOKEN_ENV, "env-token")]);

        config.apply_overrides(&env, &Overrides::default());
        assert_eq!(config.core.api_base_url, "http://env:1");
        assert_eq!(config.token.as_deref(), Some("env-token"));

        let flags = Overrides {
            api_url: Some("http://flag:2".to_string()),
            token: None,
        };
        config.apply_overrides(&env, &flags);
        assert_eq!(config.core.api_base_url, "http://flag:2");
        assert_eq!(config.token.as_deref(), Some("env-token"));
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = CliConfig::default();
        config.apply_overrides(env_from(&[(TOKEN_ENV, "")]), &Overrides::default());
        assert!(config.token.is_none());
        assert!(config.require_token().is_err());
    }

    #[test]
    fn test_redacted_masks_token() {
        let config = CliConfig {
            token: Some("abcdefgh".to_string()),
            ..CliConfig::default()
        };
        assert_eq!(config.redacted().token.as_deref(), Some("abcd…"));
    }
}
