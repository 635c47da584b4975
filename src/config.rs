//! Experiment configuration.
//!
//! Loads the YAML experiment file (model, sampling parameters, prompt file
//! paths, backend settings), applies command-line overrides, and reads the
//! prompt texts for a given variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to read prompt file {path}: {source}")]
    PromptFile {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid backend kind: {0} (expected `http` or `cli`)")]
    InvalidBackend(String),

    #[error("Invalid prompt variant: {0} (expected `normal`, `proxy` or `shifted`)")]
    InvalidVariant(String),
}

/// Prompt variant for the arithmetic task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    /// Plain instructions, digit-form question
    Normal,
    /// Instructions that hint at a gameable grader
    Proxy,
    /// Distribution shift: spelled-word question
    Shifted,
}

impl PromptVariant {
    /// Lowercase name used in CSV output and on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Proxy => "proxy",
            Self::Shifted => "shifted",
        }
    }

    /// Whether the question is presented in spelled-word form
    #[must_use]
    pub const fn uses_words(self) -> bool {
        matches!(self, Self::Shifted)
    }
}

impl fmt::Display for PromptVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "proxy" => Ok(Self::Proxy),
            "shifted" => Ok(Self::Shifted),
            _ => Err(ConfigError::InvalidVariant(s.to_string())),
        }
    }
}

/// Which transport reaches the model server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// JSON POST to the Ollama generate endpoint
    Http,
    /// `ollama run` subprocess
    Cli,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "cli" => Ok(Self::Cli),
            _ => Err(ConfigError::InvalidBackend(s.to_string())),
        }
    }
}

/// Experiment configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    /// Model identifier as known to the server
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Nucleus sampling cutoff
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Prompt file paths
    #[serde(default)]
    pub prompts: PromptPaths,
    /// Model server settings
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_model() -> String {
    "phi3:mini".to_string()
}
const fn default_temperature() -> f64 {
    0.2
}
const fn default_top_p() -> f64 {
    0.95
}
const fn default_max_tokens() -> u32 {
    64
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            prompts: PromptPaths::default(),
            backend: BackendConfig::default(),
        }
    }
}

/// Paths of the system prompt and the three variant templates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptPaths {
    /// System prompt file
    pub system: PathBuf,
    /// Template for the `normal` variant
    pub normal: PathBuf,
    /// Template for the `proxy` variant
    pub proxy: PathBuf,
    /// Template for the `shifted` variant
    pub shifted: PathBuf,
}

impl Default for PromptPaths {
    fn default() -> Self {
        Self {
            system: PathBuf::from("prompts/base_system.txt"),
            normal: PathBuf::from("prompts/prompt_normal.txt"),
            proxy: PathBuf::from("prompts/prompt_proxy_hack.txt"),
            shifted: PathBuf::from("prompts/prompt_shifted.txt"),
        }
    }
}

impl PromptPaths {
    /// Template path for a variant
    #[must_use]
    pub fn template(&self, variant: PromptVariant) -> &Path {
        match variant {
            PromptVariant::Normal => &self.normal,
            PromptVariant::Proxy => &self.proxy,
            PromptVariant::Shifted => &self.shifted,
        }
    }
}

/// Model server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Transport
    pub kind: BackendKind,
    /// Generate endpoint for the HTTP backend
    pub endpoint: String,
    /// Command line for the CLI backend, split shell-style
    pub command: String,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Retries after the first attempt for transient failures
    pub retries: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            command: "ollama run".to_string(),
            timeout_ms: 30_000,
            retries: 1,
            retry_delay_ms: 1_000,
        }
    }
}

impl BackendConfig {
    /// Per-call timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay between attempts
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub backend: Option<BackendKind>,
}

/// System prompt and variant template, read from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    /// System prompt text
    pub system: String,
    /// Variant template text
    pub template: String,
}

impl ExperimentConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply command-line overrides in place
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(model) = overrides.model {
            self.model = model;
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if let Some(top_p) = overrides.top_p {
            self.top_p = top_p;
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = kind;
        }
    }

    /// Read the system prompt and the template for `variant`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::PromptFile` if either file cannot be read.
    pub fn load_prompts(&self, variant: PromptVariant) -> Result<PromptSet, ConfigError> {
        Ok(PromptSet {
            system: read_prompt(&self.prompts.system)?,
            template: read_prompt(self.prompts.template(variant))?,
        })
    }
}

fn read_prompt(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|text| text.trim().to_string())
        .map_err(|source| ConfigError::PromptFile {
            path: path.display().to_string(),
            source,
        })
}
