//! Configuration management for git-split
//!
//! Stores settings in ~/.config/git-split/config.json. Environment variables
//! override the file; command-line flags override both.

use crate::git_ops::DEFAULT_GIT_TIMEOUT_SECS;
use crate::llm::client::REQUEST_TIMEOUT_SECS;
use crate::llm::{Provider, ProviderSettings, DEFAULT_OLLAMA_BASE_URL};
use crate::rotation::{RotationPolicy, DEFAULT_MAX_SWEEPS, DEFAULT_WAIT_MINUTES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "git-split";
const DATABASE_FILE: &str = "git_split.db";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// gemini, openai or ollama
    pub default_provider: Option<String>,
    pub gemini_model: Option<String>,
    pub openai_model: Option<String>,
    pub ollama_model: Option<String>,
    pub ollama_base_url: Option<String>,
    /// Cooldown once every pooled key is rate limited
    pub wait_minutes: Option<u64>,
    /// Cooldowns allowed per request before giving up
    pub max_sweeps: Option<u32>,
    /// Credential pool location
    pub database_path: Option<PathBuf>,
    pub git_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// A corrupt file is moved aside and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                eprintln!(
                    "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("Could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    eprintln!("  Warning: Failed to set config directory permissions: {}", e);
                }
            }
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        #[cfg(unix)]
        {
            write_config_atomic(path, &content).context("Failed to write config")?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, content).context("Failed to write config")?;
        }

        Ok(())
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/git-split/config.json".to_string())
    }
}

/// Config merged with the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub provider: Provider,
    gemini_model: String,
    openai_model: String,
    ollama_model: String,
    pub ollama_base_url: String,
    pub wait: Duration,
    pub max_sweeps: u32,
    pub database_path: PathBuf,
    pub git_timeout: Duration,
    pub request_timeout_secs: u64,
}

impl Settings {
    /// Resolve against the process environment
    pub fn from_env(config: &Config) -> Result<Self> {
        Self::resolve(config, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup
    pub fn resolve<F>(config: &Config, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let provider = match &config.default_provider {
            Some(name) => name
                .parse::<Provider>()
                .map_err(anyhow::Error::msg)
                .context("Invalid default_provider in config")?,
            None => Provider::Gemini,
        };

        let wait_minutes = match env("API_KEY_WAIT_MINUTES") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("API_KEY_WAIT_MINUTES must be a whole number, got '{}'", raw))?,
            None => config.wait_minutes.unwrap_or(DEFAULT_WAIT_MINUTES),
        };

        let database_path = match env("GIT_SPLIT_DB") {
            Some(path) => PathBuf::from(path),
            None => match &config.database_path {
                Some(path) => path.clone(),
                None => default_database_path()?,
            },
        };

        Ok(Self {
            provider,
            gemini_model: env("GEMINI_MODEL")
                .or_else(|| config.gemini_model.clone())
                .unwrap_or_else(|| Provider::Gemini.default_model().to_string()),
            openai_model: env("OPENAI_MODEL")
                .or_else(|| config.openai_model.clone())
                .unwrap_or_else(|| Provider::OpenAi.default_model().to_string()),
            ollama_model: config
                .ollama_model
                .clone()
                .unwrap_or_else(|| Provider::Ollama.default_model().to_string()),
            ollama_base_url: env("OLLAMA_BASE_URL")
                .or_else(|| config.ollama_base_url.clone())
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            wait: Duration::from_secs(wait_minutes.saturating_mul(60)),
            max_sweeps: config.max_sweeps.unwrap_or(DEFAULT_MAX_SWEEPS),
            database_path,
            git_timeout: Duration::from_secs(
                config.git_timeout_secs.unwrap_or(DEFAULT_GIT_TIMEOUT_SECS),
            ),
            request_timeout_secs: config.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS),
        })
    }

    pub fn model_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::Gemini => &self.gemini_model,
            Provider::OpenAi => &self.openai_model,
            Provider::Ollama => &self.ollama_model,
        }
    }

    /// Connection details for `provider`, with an optional model override
    pub fn provider_settings(&self, provider: Provider, model: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            provider,
            model: model
                .map(str::to_string)
                .unwrap_or_else(|| self.model_for(provider).to_string()),
            base_url: match provider {
                Provider::Ollama => Some(self.ollama_base_url.clone()),
                _ => None,
            },
        }
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            wait: self.wait,
            max_sweeps: self.max_sweeps,
            ..RotationPolicy::default()
        }
    }
}

/// Key from `GOOGLE_API_KEY` / `OPENAI_API_KEY`, used when the pool is empty
pub fn fallback_secret(provider: Provider) -> Option<String> {
    provider
        .key_env_var()
        .and_then(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_database_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .or_else(dirs::config_dir)
        .context("Could not determine a data directory; set GIT_SPLIT_DB")?;
    Ok(dir.join(APP_DIR).join(DATABASE_FILE))
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        eprintln!("  Warning: Failed to set temp config file permissions: {}", e);
    }

    file.write_all(content.as_bytes())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
