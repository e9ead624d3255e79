use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};

pub const DEFAULT_RETRY_COUNT: u32 = 3;

const CONFIG_FILE_PATH: &str = "dialog_tree.toml";

/// Session-level settings supplied by the host. The tree never owns these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    pub retry_count: u32,
    pub timeout_secs: Option<u64>,
    pub retry_delay_ms: u64,
    /// Keep only the most recent N messages when materializing context.
    pub max_context_messages: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout_secs: None,
            retry_delay_ms: 0,
            max_context_messages: None,
        }
    }
}

fn dialog_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".dialog_tree")
}

fn config_json_path() -> PathBuf {
    dialog_dir().join("config.json")
}

impl SessionConfig {
    /// Resolve the config from the user's config dir, then the working directory,
    /// then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file(&config_json_path())
            .or_else(|| Self::load_file(Path::new(CONFIG_FILE_PATH)))
            .unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn load_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        };
        match parsed {
            Ok(config) => Some(config),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "SessionConfig: ignoring unreadable config file");
                None
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TreeError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(prompt) = lookup("DIALOG_SYSTEM_PROMPT") {
            self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        }
        if let Some(count) = lookup("DIALOG_RETRY_COUNT").and_then(|v| v.trim().parse().ok()) {
            self.retry_count = count;
        }
        if let Some(secs) = lookup("DIALOG_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.timeout_secs = if secs == 0 { None } else { Some(secs) };
        }
        if let Some(delay) = lookup("DIALOG_RETRY_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            self.retry_delay_ms = delay;
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
