//! Configuration management
//!
//! This module handles loading, validation, and management of the waypoint
//! configuration. Configuration is stored in TOML format at
//! ~/.waypoint/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **server**: Bind address, public base URL, management token
//! - **signing**: Scheduler verifying keys and clock tolerance
//! - **scheduler**: How continuation steps are delivered
//! - **executor**: Default step and cost limits for new operations
//! - **agent**: Model endpoint, tool gateway, approval policy
//!
//! # Secrets
//!
//! Signing keys and the scheduler token may be left out of the file and
//! supplied through the environment instead:
//!
//! - `WAYPOINT_SIGNING_CURRENT_KEY`
//! - `WAYPOINT_SIGNING_NEXT_KEY`
//! - `WAYPOINT_SCHEDULER_TOKEN`
//! - `WAYPOINT_BASE_URL`
//!
//! # Examples
//!
//! ```no_run
//! use waypoint_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Listening on {}", config.server.bind_addr);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::{CostLimit, CostLimitAction};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Scheduler signature verification
    #[serde(default)]
    pub signing: SigningConfig,

    /// Continuation delivery
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Defaults applied to new operations
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Step body collaborators
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Public base URL; continuations are delivered to `<base_url>/agent/run`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token required by the management routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

/// Scheduler signature configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Hex ed25519 verifying key currently used by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_key: Option<String>,

    /// Hex ed25519 verifying key the scheduler is rotating to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_key: Option<String>,

    /// Accepted clock skew for the signed timestamp
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,

    /// Header carrying the signature
    #[serde(default = "default_signature_header")]
    pub header: String,
}

/// How continuation steps are delivered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Publish to the external push scheduler
    Http,
    /// Deliver through an in-process worker
    Local,
    /// Never schedule; steps are driven by hand
    Disabled,
}

/// Continuation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_mode")]
    pub mode: SchedulerMode,

    /// Publish endpoint of the external scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_scheduler_timeout")]
    pub timeout_secs: u64,
}

/// Cost cap as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLimitConfig {
    pub max_total_cost: f64,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub on_exceeded: CostLimitAction,
}

impl CostLimitConfig {
    pub fn to_limit(&self) -> CostLimit {
        CostLimit {
            max_total_cost: self.max_total_cost,
            currency: self.currency.clone(),
            on_exceeded: self.on_exceeded,
        }
    }
}

/// Defaults for new operations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_steps: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<CostLimitConfig>,
}

/// Agent collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// OpenAI-compatible API base URL
    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the model API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_input_cost")]
    pub input_cost_per_1k: f64,

    #[serde(default = "default_output_cost")]
    pub output_cost_per_1k: f64,

    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Tool gateway; without one only the built-in human tools exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,

    /// Tool names that need human approval, or `["*"]` for all
    #[serde(default)]
    pub require_approval: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.waypoint/data")
}

fn default_bind_addr() -> String {
    "127.0.0.1:3010".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:3010".to_string()
}

fn default_tolerance_secs() -> u64 {
    300
}

fn default_signature_header() -> String {
    "x-scheduler-signature".to_string()
}

fn default_scheduler_mode() -> SchedulerMode {
    SchedulerMode::Local
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_scheduler_timeout() -> u64 {
    10
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_model_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_input_cost() -> f64 {
    0.00015
}

fn default_output_cost() -> f64 {
    0.0006
}

fn default_model_timeout() -> u64 {
    60
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_url: default_base_url(),
            api_token: None,
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            current_key: None,
            next_key: None,
            tolerance_secs: default_tolerance_secs(),
            header: default_signature_header(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: default_scheduler_mode(),
            publish_url: None,
            token: None,
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_scheduler_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            input_cost_per_1k: default_input_cost(),
            output_cost_per_1k: default_output_cost(),
            timeout_secs: default_model_timeout(),
            gateway_url: None,
            require_approval: Vec::new(),
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.waypoint/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails (bad log level, malformed keys, missing publish URL)
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        // Write before env overrides so secrets never land in the file
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.waypoint/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".waypoint").join("config.toml"))
    }

    /// Apply environment overrides for secrets and the public URL
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(key) = non_empty("WAYPOINT_SIGNING_CURRENT_KEY") {
            self.signing.current_key = Some(key);
        }
        if let Some(key) = non_empty("WAYPOINT_SIGNING_NEXT_KEY") {
            self.signing.next_key = Some(key);
        }
        if let Some(token) = non_empty("WAYPOINT_SCHEDULER_TOKEN") {
            self.scheduler.token = Some(token);
        }
        if let Some(url) = non_empty("WAYPOINT_BASE_URL") {
            self.server.base_url = url;
        }
    }

    /// Continuation endpoint the scheduler delivers to
    pub fn run_endpoint(&self) -> String {
        format!("{}/agent/run", self.server.base_url.trim_end_matches('/'))
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates enumerated and numeric fields
    /// - Checks signing keys are 32-byte hex strings
    /// - Requires a publish URL in http scheduler mode
    /// - Expands ~ in the data directory and creates it
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        for (name, key) in [
            ("signing.current_key", &self.signing.current_key),
            ("signing.next_key", &self.signing.next_key),
        ] {
            if let Some(key) = key {
                let valid = hex::decode(key.trim())
                    .map(|bytes| bytes.len() == 32)
                    .unwrap_or(false);
                if !valid {
                    return Err(EngineError::Config(format!(
                        "{} must be a 32-byte hex ed25519 public key",
                        name
                    )));
                }
            }
        }

        if self.signing.tolerance_secs == 0 {
            return Err(EngineError::Config(
                "signing.tolerance_secs must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.mode == SchedulerMode::Http && self.scheduler.publish_url.is_none() {
            return Err(EngineError::Config(
                "scheduler.publish_url is required when scheduler.mode = \"http\"".to_string(),
            ));
        }

        if self.scheduler.max_attempts == 0 {
            return Err(EngineError::Config(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(limit) = &self.executor.cost_limit {
            if !limit.max_total_cost.is_finite() || limit.max_total_cost <= 0.0 {
                return Err(EngineError::Config(
                    "executor.cost_limit.max_total_cost must be positive".to_string(),
                ));
            }
        }

        if self.server.base_url.trim().is_empty() {
            return Err(EngineError::Config("server.base_url is empty".to_string()));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("waypoint.db")
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
