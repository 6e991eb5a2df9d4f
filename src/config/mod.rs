//! Configuration
//!
//! Persistence of user-tunable settings: model location, generation
//! parameters, and the prompt's system message.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::inference::engine::GenerationParams;
use crate::inference::prompt::DEFAULT_SYSTEM_PROMPT;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application config directory
///
/// Returns the platform-specific configuration directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\Fireside\Fireside`
/// - macOS: `/Users/{user}/Library/Application Support/com.Fireside.Fireside`
/// - Linux: `/home/{user}/.config/fireside`
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "Fireside", "Fireside")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            ConfigError::ConfigDirError("Could not determine config directory".to_string())
        })
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Model package directory (or direct path to a .gguf file)
    pub model_dir: PathBuf,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Maximum total sequence length, prompt tokens included
    pub max_length: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// System message placed in the prompt template
    pub system_prompt: String,
    /// Sleep before each generation step, in milliseconds (advisory)
    pub step_yield_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            gpu_layers: 99, // Offload all layers to GPU by default
            max_length: 2048,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            step_yield_ms: 10,
        }
    }
}

impl Settings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = self.top_p.clamp(0.0, 1.0);

        // Ensure reasonable values for other parameters
        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.max_length == 0 {
            self.max_length = 2048;
        }

        // The yield is a scheduling courtesy; anything past a second would
        // throttle generation to a crawl
        if self.step_yield_ms > 1000 {
            self.step_yield_ms = 1000;
        }

        if self.system_prompt.trim().is_empty() {
            self.system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
        }
    }

    /// Generation parameters derived from these settings
    pub fn to_params(&self) -> GenerationParams {
        GenerationParams {
            max_length: self.max_length,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            system_prompt: self.system_prompt.clone(),
            step_yield: Duration::from_millis(self.step_yield_ms),
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> Settings {
    match load_settings_internal() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal() -> Result<Settings, ConfigError> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(&path)?;
    let mut settings: Settings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    let path = get_settings_path()?;

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to disk");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_length, 2048);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.top_p, 0.95);
        assert_eq!(settings.step_yield_ms, 10);
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();

        // Test temperature clamping
        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        // Test top_p clamping
        settings.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        // Zeroed-out knobs fall back to defaults
        settings.top_k = 0;
        settings.max_length = 0;
        settings.validate();
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_length, 2048);

        // Test yield cap
        settings.step_yield_ms = 60_000;
        settings.validate();
        assert_eq!(settings.step_yield_ms, 1000);

        // Blank system prompt falls back to the default
        settings.system_prompt = "   ".to_string();
        settings.validate();
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings::default();

        let json = serde_json::to_string(&settings).unwrap();
        let deserialized: Settings = serde_json::from_str(&json).unwrap();

        assert_eq!(settings.max_length, deserialized.max_length);
        assert_eq!(settings.temperature, deserialized.temperature);
        assert_eq!(settings.system_prompt, deserialized.system_prompt);
    }

    #[test]
    fn test_to_params() {
        let mut settings = Settings::default();
        settings.max_length = 1024;
        settings.step_yield_ms = 0;

        let params = settings.to_params();
        assert_eq!(params.max_length, 1024);
        assert!(params.step_yield.is_zero());
        assert_eq!(params.system_prompt, settings.system_prompt);
    }
}
