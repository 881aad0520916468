//! Configuration module for charmfs
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("CHARM_TOKEN", "abc");
/// let result = expand_env_vars("Bearer ${CHARM_TOKEN}");
/// assert_eq!(result, "Bearer abc");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.remote.url) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid remote url '{}': must start with http:// or https://",
                self.remote.url
            )));
        }

        if self.remote.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "remote.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.encryption.enabled {
            match self.encryption.key.as_deref() {
                Some(key) if !key.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::ValidationError(
                        "encryption.key is required when encryption is enabled".into(),
                    ))
                }
            }
        }

        if self.upload.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.chunk_size must be at least 1 byte".into(),
            ));
        }

        if self.upload.pipe_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "upload.pipe_capacity must be at least 1 chunk".into(),
            ));
        }

        if self.upload.file_mode > 0o777 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid upload.file_mode {:o}: must be a permission value up to 0777",
                self.upload.file_mode
            )));
        }

        Ok(())
    }
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the storage server. Supports ${VAR} expansion.
    pub url: String,

    /// Bearer token sent with every request. Supports ${VAR} expansion.
    #[serde(default)]
    pub token: Option<String>,

    /// Path prefix joined onto every remote path
    #[serde(default)]
    pub root: String,

    /// Request timeout in seconds. Default: 300
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    300
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt file contents and names. Default: true
    #[serde(default = "default_encryption_enabled")]
    pub enabled: bool,

    /// Base64 encoded 32-byte master key. Supports ${VAR} expansion.
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: default_encryption_enabled(),
            key: None,
        }
    }
}

fn default_encryption_enabled() -> bool {
    true
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Bytes of ciphertext handed to the pipe per write. Default: 64MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of chunks the pipe buffers before the producer waits. Default: 1
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Permission bits declared for created objects. Default: 0o664
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            pipe_capacity: default_pipe_capacity(),
            file_mode: default_file_mode(),
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_pipe_capacity() -> usize {
    1
}

fn default_file_mode() -> u32 {
    0o664
}
