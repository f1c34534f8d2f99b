//! Configuration management for the Termlink server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("auth_timeout_secs must be between 1 and 300, got {0}")]
    InvalidAuthTimeout(u64),

    #[error("credential_ttl_secs must be greater than 0, got {0}")]
    InvalidCredentialTtl(u64),

    #[error("port must not be 0")]
    InvalidPort,

    #[error("auth token must not be empty")]
    EmptyToken,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Termlink server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General server configuration.
    pub server: ServerConfig,

    /// Authentication and trust configuration.
    pub auth: AuthConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener on.
    pub bind: String,

    /// TCP port for the HTTP/WebSocket listener.
    pub port: u16,

    /// Hostname reported to clients. Defaults to the OS hostname.
    pub hostname: Option<String>,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Authentication and trusted-network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Long-lived token clients exchange for session credentials.
    pub token: String,

    /// Secret for signing session credentials. Empty means a random
    /// per-process secret.
    pub secret: String,

    /// Session credential lifetime in seconds.
    pub credential_ttl_secs: u64,

    /// Seconds a connection may stay unauthenticated before being closed.
    pub auth_timeout_secs: u64,

    /// Peer-address prefixes allowed to connect. Loopback is always
    /// allowed. Default covers the Tailscale CGNAT range.
    pub trusted_prefixes: Vec<String>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Default working directory for new sessions.
    pub default_cwd: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8787,
            hostname: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            secret: String::new(),
            credential_ttl_secs: 24 * 60 * 60,
            auth_timeout_secs: 10,
            trusted_prefixes: vec!["100.".to_string()],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cwd: default_cwd(),
            max_sessions: 10,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termlink")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Returns the default working directory for new sessions.
fn default_cwd() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .display()
        .to_string()
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMLINK_TOKEN: Override the long-lived auth token
    /// - TERMLINK_SECRET: Override the credential signing secret
    /// - TERMLINK_PORT: Override the listener port
    /// - TERMLINK_SHELL: Override the default shell
    /// - TERMLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TERMLINK_TOKEN") {
            if !token.is_empty() {
                self.auth.token = token;
            }
        }

        if let Ok(secret) = std::env::var("TERMLINK_SECRET") {
            if !secret.is_empty() {
                self.auth.secret = secret;
            }
        }

        if let Ok(port) = std::env::var("TERMLINK_PORT") {
            if let Ok(port) = port.parse() {
                tracing::info!("Overriding port from environment: {}", port);
                self.server.port = port;
            }
        }

        if let Ok(shell) = std::env::var("TERMLINK_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }

        if let Ok(level) = std::env::var("TERMLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.auth.auth_timeout_secs < 1 || self.auth.auth_timeout_secs > 300 {
            return Err(ConfigError::InvalidAuthTimeout(self.auth.auth_timeout_secs));
        }

        if self.auth.credential_ttl_secs == 0 {
            return Err(ConfigError::InvalidCredentialTtl(
                self.auth.credential_ttl_secs,
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.auth.token.is_empty() {
            return Err(ConfigError::EmptyToken);
        }

        // Validate default_shell path exists
        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", e.message()))
    }

    /// Save configuration to a file, creating parent directories if needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Hostname reported to clients.
    pub fn hostname(&self) -> String {
        self.server
            .hostname
            .clone()
            .or_else(os_hostname)
            .unwrap_or_else(|| "termlink".to_string())
    }
}

fn os_hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}
