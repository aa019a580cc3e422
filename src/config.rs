//! Server configuration

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::str::FromStr;

/// How the server is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// stdio transport with filesystem access
    Local,
    /// HTTP transport without filesystem access
    Remote,
}

impl DeploymentMode {
    pub fn has_filesystem(&self) -> bool {
        matches!(self, DeploymentMode::Local)
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "stdio" => Ok(DeploymentMode::Local),
            "remote" | "http" => Ok(DeploymentMode::Remote),
            other => Err(Error::Config {
                reason: format!("OCR_MCP_MODE must be 'local' or 'remote', got '{}'", other),
            }),
        }
    }
}

/// Security, resource and OCR service configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deployment variant (default: local)
    pub mode: DeploymentMode,
    /// Listen address for remote mode (default: 127.0.0.1:8000)
    pub bind_addr: SocketAddr,
    /// Directories exposed as resources and allowed for path access (local mode)
    pub resource_dirs: Vec<String>,
    /// Mistral API key
    pub api_key: Option<String>,
    /// Mistral API base URL (default: https://api.mistral.ai/v1)
    pub api_base: String,
    /// OCR model name (default: mistral-ocr-latest)
    pub model: String,
    /// Maximum document size in bytes for path and base64 sources (default: 50MB)
    pub max_file_bytes: u64,
    /// Timeout for a single OCR request (default: 120s)
    pub request_timeout_secs: u64,
    /// Retries after the first failed OCR attempt (default: 3)
    pub max_retries: u32,
    /// Base backoff between retries, doubled per attempt (default: 1000ms)
    pub retry_backoff_ms: u64,
    /// Maximum number of cache entries (default: 100)
    pub cache_max_entries: usize,
    /// Maximum total bytes in cache (default: 256MB)
    pub cache_max_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Local,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            resource_dirs: Vec::new(),
            api_key: None,
            api_base: "https://api.mistral.ai/v1".to_string(),
            model: "mistral-ocr-latest".to_string(),
            max_file_bytes: 50 * 1024 * 1024, // 50MB
            request_timeout_secs: 120,
            max_retries: 3,
            retry_backoff_ms: 1000,
            cache_max_entries: 100,
            cache_max_bytes: 256 * 1024 * 1024, // 256MB
        }
    }
}

impl ServerConfig {
    /// Build configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    /// Unset or blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = ServerConfig::default();

        if let Some(mode) = get("OCR_MCP_MODE") {
            config.mode = mode.parse()?;
        }
        if let Some(addr) = get("OCR_MCP_BIND") {
            config.bind_addr = parse_value("OCR_MCP_BIND", &addr)?;
        }
        if let Some(dirs) = get("OCR_MCP_RESOURCE_DIRS") {
            config.resource_dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        config.api_key = get("MISTRAL_API_KEY").map(|k| k.trim().to_string());
        if let Some(base) = get("MISTRAL_API_BASE") {
            url::Url::parse(&base).map_err(|e| Error::Config {
                reason: format!("MISTRAL_API_BASE is not a valid URL: {}", e),
            })?;
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("MISTRAL_OCR_MODEL") {
            config.model = model;
        }
        if let Some(v) = get("OCR_MCP_MAX_FILE_BYTES") {
            config.max_file_bytes = parse_value("OCR_MCP_MAX_FILE_BYTES", &v)?;
        }
        if let Some(v) = get("OCR_MCP_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_value("OCR_MCP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("OCR_MCP_MAX_RETRIES") {
            config.max_retries = parse_value("OCR_MCP_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("OCR_MCP_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = parse_value("OCR_MCP_RETRY_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("OCR_MCP_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = parse_value("OCR_MCP_CACHE_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = get("OCR_MCP_CACHE_MAX_BYTES") {
            config.cache_max_bytes = parse_value("OCR_MCP_CACHE_MAX_BYTES", &v)?;
        }

        if config.mode == DeploymentMode::Remote && !config.resource_dirs.is_empty() {
            tracing::warn!("OCR_MCP_RESOURCE_DIRS is ignored in remote mode");
        }

        Ok(config)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| Error::Config {
        reason: format!("{} has invalid value '{}': {}", key, raw, e),
    })
}
