//! Settings shared by the CLI and the library.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "moderras";
const APPLICATION: &str = "phone-orchestrator";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("Failed to write settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize settings: {0}")]
    Format(#[from] serde_json::Error),
}

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// ADB device ID, empty for the default device
    pub device_id: String,
    /// Language code ("cn" or "en")
    pub lang: String,
    /// Maximum retries for model requests
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    /// Maximum steps per task
    pub max_steps: u32,
    /// Access policy file, empty for `access_policy.json` in the config directory
    pub policy_path: String,
    /// Task log file, empty to log through tracing only
    pub task_log_path: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            device_id: String::new(),
            lang: "cn".to_string(),
            max_retries: 3,
            retry_delay: 2,
            max_steps: 100,
            policy_path: String::new(),
            task_log_path: String::new(),
        }
    }
}

impl AppSettings {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Get logs directory path.
    pub fn logs_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("logs"))
    }

    /// Access policy file: the configured path, or one next to the settings file.
    pub fn policy_file(&self) -> Option<PathBuf> {
        if !self.policy_path.is_empty() {
            return Some(PathBuf::from(&self.policy_path));
        }
        Self::config_dir().map(|dir| dir.join("access_policy.json"))
    }

    /// Task log file, if one is configured.
    pub fn task_log_file(&self) -> Option<PathBuf> {
        (!self.task_log_path.is_empty()).then(|| PathBuf::from(&self.task_log_path))
    }

    /// Load settings from the config file, falling back to defaults.
    pub fn load() -> Self {
        Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let dir = Self::config_dir().ok_or(SettingsError::NoConfigDir)?;
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join("settings.json"), content)?;
        Ok(())
    }

    /// Apply environment overrides on top of the loaded settings.
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("MODEL_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("MODEL_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = var("MODEL_NAME") {
            self.model_name = v;
        }
        if let Some(v) = var("MODEL_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.max_retries = v;
        }
        if let Some(v) = var("MODEL_RETRY_DELAY").and_then(|v| v.parse().ok()) {
            self.retry_delay = v;
        }
        if let Some(v) = var("ADB_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = var("AGENT_LANG") {
            self.lang = v;
        }
        if let Some(v) = var("AGENT_MAX_STEPS").and_then(|v| v.parse().ok()) {
            self.max_steps = v;
        }
        if let Some(v) = var("ACCESS_POLICY_PATH") {
            self.policy_path = v;
        }
        if let Some(v) = var("TASK_LOG_PATH") {
            self.task_log_path = v;
        }
    }
}
