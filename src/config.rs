//! Configuration surface for the dispatch daemon.
//!
//! Supports both command-line arguments and a TOML configuration file;
//! CLI arguments take precedence. The loaded settings are read-only to
//! the core: the registry derives its connection table from them once at
//! startup.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the dispatch daemon.
#[derive(Parser, Debug)]
#[command(name = "judge-relay")]
#[command(version = "0.1.0")]
#[command(about = "Dispatch layer between web handlers and judge/middle services", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    /// The account/message "middle" service.
    #[serde(default)]
    pub middle: MiddleSettings,
    /// Judge servers, each reachable on up to three capability ports.
    #[serde(default, rename = "judge")]
    pub judge_servers: Vec<JudgeServerSettings>,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Middle-service endpoints. Either port may be absent when the matching
/// tier is not deployed.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddleSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub account_port: Option<u16>,
    pub message_port: Option<u16>,
}

impl Default for MiddleSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            account_port: None,
            message_port: None,
        }
    }
}

/// One judge server. Each port is optional: a server may offer any
/// subset of the submit/query/discussion capabilities.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeServerSettings {
    /// Server id embedded in composite record ids (0-255).
    pub id: u8,
    pub host: String,
    pub submit_port: Option<u16>,
    pub query_port: Option<u16>,
    pub discussion_port: Option<u16>,
}

/// Protocol-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSettings {
    /// Version string sent with problem-list refresh requests.
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from CLI args and the optional TOML file.
    /// CLI arguments take precedence over file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut settings = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            Settings::default()
        };

        if cli.log_level != "info" {
            settings.logging.level = cli.log_level;
        }
        Ok(settings)
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
