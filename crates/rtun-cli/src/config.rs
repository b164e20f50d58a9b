//! Client configuration file and command-line overrides.
//!
//! The file is flat JSON (`~/.rtun/config.json` by default) using the same
//! keys as the command-line flags, or TOML when the path ends in `.toml`.
//! Command-line flags always override file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rtun_client::{Config, TunnelSpec};

/// On-disk configuration. Missing keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server_hostname: String,
    pub server_port: u16,
    pub user: String,
    pub password: String,

    pub http_hostname: String,
    pub http_subdomain: String,
    pub http_auth: String,
    pub http_local_port: u16,

    pub https_hostname: String,
    pub https_subdomain: String,
    pub https_auth: String,
    pub https_local_port: u16,

    pub read_buf_size: usize,
    pub max_proxy_count: usize,
    pub ping_interval: u64,
}

/// Command-line settings. Each one, when given, replaces the file value.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Server hostname, IP or domain name
    #[arg(long, alias = "server_hostname")]
    pub server_hostname: Option<String>,

    /// Server port
    #[arg(long, alias = "server_port")]
    pub server_port: Option<u16>,

    /// Username to register
    #[arg(long)]
    pub user: Option<String>,

    /// Password of the user
    #[arg(long)]
    pub password: Option<String>,

    /// Requested HTTP hostname (optional)
    #[arg(long, alias = "http_hostname")]
    pub http_hostname: Option<String>,

    /// Requested HTTP subdomain (optional, some servers ignore it)
    #[arg(long, alias = "http_subdomain")]
    pub http_subdomain: Option<String>,

    /// HTTP basic auth `user:password` enforced by the server (optional)
    #[arg(long, alias = "http_auth")]
    pub http_auth: Option<String>,

    /// Local HTTP service port
    #[arg(long, alias = "http_local_port")]
    pub http_local_port: Option<u16>,

    /// Requested HTTPS hostname (optional)
    #[arg(long, alias = "https_hostname")]
    pub https_hostname: Option<String>,

    /// Requested HTTPS subdomain (optional, some servers ignore it)
    #[arg(long, alias = "https_subdomain")]
    pub https_subdomain: Option<String>,

    /// HTTP basic auth for the HTTPS tunnel (optional)
    #[arg(long, alias = "https_auth")]
    pub https_auth: Option<String>,

    /// Local HTTPS service port
    #[arg(long, alias = "https_local_port")]
    pub https_local_port: Option<u16>,

    /// Socket read buffer size in bytes
    #[arg(long, alias = "read_buf_size")]
    pub read_buf_size: Option<usize>,

    /// Maximum concurrent proxy connections
    #[arg(long, alias = "max_proxy_count")]
    pub max_proxy_count: Option<usize>,

    /// Keepalive ping interval in seconds (0 disables)
    #[arg(long, alias = "ping_interval")]
    pub ping_interval: Option<u64>,
}

impl FileConfig {
    /// Load a config file. A missing file at the default location yields
    /// defaults; a missing file that was asked for explicitly is an error.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if !path.exists() {
            if explicit {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = Self::parse(&content, is_toml(path))
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    fn parse(content: &str, toml: bool) -> Result<Self> {
        if toml {
            Ok(toml::from_str(content)?)
        } else {
            Ok(serde_json::from_str(content)?)
        }
    }

    /// Apply `overrides` and produce the library configuration.
    ///
    /// Zero or empty file values mean "not set" and keep the library default.
    pub fn merge(self, overrides: &Overrides) -> Config {
        let defaults = Config::default();
        let pick = |flag: &Option<String>, file: String| flag.clone().unwrap_or(file);

        Config {
            server_hostname: pick(&overrides.server_hostname, self.server_hostname),
            server_port: overrides.server_port.unwrap_or(self.server_port),
            user: pick(&overrides.user, self.user),
            password: pick(&overrides.password, self.password),
            http: TunnelSpec {
                hostname: pick(&overrides.http_hostname, self.http_hostname),
                subdomain: pick(&overrides.http_subdomain, self.http_subdomain),
                auth: pick(&overrides.http_auth, self.http_auth),
                local_port: overrides.http_local_port.unwrap_or(self.http_local_port),
            },
            https: TunnelSpec {
                hostname: pick(&overrides.https_hostname, self.https_hostname),
                subdomain: pick(&overrides.https_subdomain, self.https_subdomain),
                auth: pick(&overrides.https_auth, self.https_auth),
                local_port: overrides.https_local_port.unwrap_or(self.https_local_port),
            },
            read_buf_size: positive(overrides.read_buf_size, self.read_buf_size)
                .unwrap_or(defaults.read_buf_size),
            max_proxy_count: positive(overrides.max_proxy_count, self.max_proxy_count)
                .unwrap_or(defaults.max_proxy_count),
            ping_interval_secs: overrides.ping_interval.unwrap_or(self.ping_interval),
            ..defaults
        }
    }
}

fn positive(flag: Option<usize>, file: usize) -> Option<usize> {
    flag.filter(|v| *v > 0)
        .or((file > 0).then_some(file))
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// `~/.rtun/config.json`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".rtun")
        .join("config.json")
}
