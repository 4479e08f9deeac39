use crate::capture::server::{ServerConfig, MAX_BODY_BYTES};
use crate::templates::service::DEFAULT_INDEX_TTL;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Values supplied by the command line or its environment fallbacks.
/// Anything left `None` keeps the default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub home: Option<PathBuf>,
    pub captures_dir: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
    pub templates_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub home: PathBuf,
    pub captures_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub cache_file: PathBuf,
    pub templates_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub index_ttl: Duration,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
}

impl Config {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            captures_dir: home.join("captures"),
            templates_dir: home.join("templates"),
            cache_file: home.join("cache").join("templates-index.json"),
            home,
            templates_url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            index_ttl: DEFAULT_INDEX_TTL,
            max_body_bytes: MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// `~/.hookbox`, or `./.hookbox` when there is no home directory.
    pub fn default_home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hookbox")
    }

    pub fn resolve(overrides: Overrides) -> Self {
        let mut config = Self::with_home(overrides.home.unwrap_or_else(Self::default_home));
        if let Some(dir) = overrides.captures_dir {
            config.captures_dir = dir;
        }
        if let Some(dir) = overrides.templates_dir {
            config.templates_dir = dir;
        }
        if let Some(url) = overrides.templates_url.filter(|u| !u.trim().is_empty()) {
            config.templates_url = Some(url);
        }
        if let Some(host) = overrides.host {
            config.host = host;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(level) = overrides.log_level {
            config.log_level = level;
        }
        config
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_body_bytes: self.max_body_bytes,
            request_timeout: self.request_timeout,
        }
    }
}
