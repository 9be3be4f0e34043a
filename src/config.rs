use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::ExecutorConfig;
use crate::llm::{GeminiClientConfig, GenerationParams};

/// Environment variable that overrides the stored API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const CONFIG_FILE: &str = "config.json";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const CREDENTIALS_FILE: &str = "credentials.json";

/// Directory holding config, credentials and workflow state.
///
/// `./.mindflow` by default, or the user data directory when `global` is set.
pub fn default_data_dir(global: bool) -> PathBuf {
    if global {
        if let Some(dir) = dirs::data_dir() {
            return dir.join("mindflow");
        }
    }
    PathBuf::from(".mindflow")
}

/// Settings read from `config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MindflowConfig {
    /// Model and endpoint
    pub gemini: GeminiClientConfig,
    /// Sent with every model call
    pub generation: GenerationParams,
    /// Per-call timeout. Unset waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Timeout for page and API fetches during input resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_timeout_secs: Option<u64>,
}

impl MindflowConfig {
    /// Load from config file, falling back to defaults
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config.json")?;
        let value: serde_json::Value =
            serde_json::from_str(&content).context("Failed to parse config.json")?;
        // `serde(default)` would otherwise accept `[]` or `null` as an empty config
        if !value.is_object() {
            bail!("config.json must contain a JSON object");
        }
        serde_json::from_value(value).context("Failed to parse config.json")
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(data_dir.join(CONFIG_FILE), content).context("Failed to write config.json")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            generation: self.generation.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS))
    }

    /// Gemini client settings with the API key filled in
    pub fn gemini_config(&self, api_key: Option<String>) -> GeminiClientConfig {
        GeminiClientConfig {
            api_key: api_key.unwrap_or_default(),
            ..self.gemini.clone()
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gemini_api_key: Option<String>,
}

/// API key storage, kept apart from workflow state
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CREDENTIALS_FILE),
        }
    }

    fn read(&self) -> Result<Credentials> {
        if !self.path.exists() {
            return Ok(Credentials::default());
        }
        let content =
            std::fs::read_to_string(&self.path).context("Failed to read credentials.json")?;
        serde_json::from_str(&content).context("Failed to parse credentials.json")
    }

    fn write(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let content =
            serde_json::to_string_pretty(credentials).context("Failed to serialize credentials")?;
        std::fs::write(&self.path, content).context("Failed to write credentials.json")
    }

    /// Stored key, ignoring the environment
    pub fn stored_api_key(&self) -> Result<Option<String>> {
        Ok(self.read()?.gemini_api_key.filter(|k| !k.trim().is_empty()))
    }

    /// `GEMINI_API_KEY` if set, otherwise the stored key
    pub fn api_key(&self) -> Result<Option<String>> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => self.stored_api_key(),
        }
    }

    pub fn set_api_key(&self, key: &str) -> Result<()> {
        self.write(&Credentials {
            gemini_api_key: Some(key.trim().to_string()),
        })
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove credentials.json")?;
        }
        Ok(())
    }
}
