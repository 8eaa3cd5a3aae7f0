//! Configuration for typometer
//!
//! Loads configuration from a TOML file at `~/.config/typometer/config.toml`
//! (or the path in `TYPOMETER_CONFIG`). Auto-generates the default file on
//! first run if missing. The watched region always comes from the command line.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "TYPOMETER_CONFIG";

/// Longest delay between key events, in milliseconds
pub const MAX_JITTER_MS: u64 = 60_000;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub capture: CaptureConfig,
    pub keys: KeysConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {:#}", e);
            }
            return Ok(Self::default());
        }

        let config = Self::load_from(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Read, parse and validate the file at `path`
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine can't work with
    pub fn validate(&self) -> Result<()> {
        let timing = &self.timing;
        if timing.jitter_min_ms == 0 {
            bail!("timing.jitter_min_ms must be at least 1");
        }
        if timing.jitter_min_ms > timing.jitter_max_ms {
            bail!(
                "timing.jitter_min_ms ({}) is larger than timing.jitter_max_ms ({})",
                timing.jitter_min_ms,
                timing.jitter_max_ms
            );
        }
        if timing.jitter_max_ms > MAX_JITTER_MS {
            bail!(
                "timing.jitter_max_ms ({}) must not exceed {}",
                timing.jitter_max_ms,
                MAX_JITTER_MS
            );
        }

        let character = self.keys.character.trim();
        let invalid = |c: char| c.is_whitespace() || "{}[];".contains(c);
        if character.is_empty() || character.chars().any(invalid) {
            bail!("keys.character {:?} is not a valid keysym name", self.keys.character);
        }

        if let Some(output) = &self.capture.output {
            if output.is_empty() {
                bail!("capture.output must not be empty");
            }
        }

        Ok(())
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("typometer");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Delays between injected key events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Shortest delay in milliseconds (inclusive)
    pub jitter_min_ms: u64,
    /// Longest delay in milliseconds (inclusive)
    pub jitter_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: 50,
            jitter_max_ms: 99,
        }
    }
}

/// Screen capture configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// `wl_output` name to capture (e.g. "DP-1"); first output if unset
    pub output: Option<String>,
    /// Include the cursor in captured frames
    pub overlay_cursor: bool,
}

/// Injected keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// XKB keysym name of the key that makes a character appear
    pub character: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            character: "a".to_string(),
        }
    }
}
