//! Gateway configuration: TOML file + CLI overrides (spec.md §6's
//! "Configuration (recognized options)").
//!
//! Two-layer shape — a `#[derive(Deserialize)]` file struct merged with CLI
//! overrides into a resolved `ServerConfig` — follows the teacher's
//! `wsh-server::config` (`ConfigFile`/`ServerSection`/`ServerConfig`).

use mip_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
}

/// `[server]` section: the reverse-connection listener and the public host
/// used to build HTTP endpoint URLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    /// Address clients dial to establish a control connection.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host used to build `{keyID}.{publicHost}` HTTP endpoints.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Address the HTTP edge binds to for public end-user traffic.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_host: default_public_host(),
            http_listen: default_http_listen(),
        }
    }
}

/// `[tcp]` section: the TCP edge's listen host and port pool range.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSection {
    #[serde(default = "default_tcp_listen_host")]
    pub listen_host: String,
    #[serde(default)]
    pub port_range: PortRangeSection,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            listen_host: default_tcp_listen_host(),
            port_range: PortRangeSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRangeSection {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl Default for PortRangeSection {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

/// `[credentials]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSection {
    /// Default TTL, in seconds, for credentials minted without an explicit
    /// expiry (spec.md §6's `defaultTokenExpiry`).
    #[serde(default = "default_token_expiry")]
    pub default_token_expiry: u64,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            default_token_expiry: default_token_expiry(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7835".to_string()
}
fn default_public_host() -> String {
    "tunnel.example.com".to_string()
}
fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_tcp_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port_min() -> u16 {
    10000
}
fn default_port_max() -> u16 {
    20000
}
fn default_token_expiry() -> u64 {
    86400
}

/// Resolved gateway configuration: TOML values merged with CLI overrides
/// and validated (spec.md §6: `min >= 1024, max <= 65535, min <= max`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub public_host: String,
    pub http_listen: String,
    pub tcp_listen_host: String,
    pub tcp_port_min: u16,
    pub tcp_port_max: u16,
    pub default_token_expiry: u64,
}

impl ServerConfig {
    /// Load configuration from a TOML file (if it exists; otherwise
    /// defaults are used silently), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_public_host: Option<&str>,
        cli_http_listen: Option<&str>,
        cli_tcp_listen_host: Option<&str>,
        cli_tcp_port_min: Option<u16>,
        cli_tcp_port_max: Option<u16>,
        cli_default_token_expiry: Option<u64>,
    ) -> TunnelResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let listen = cli_listen.map(str::to_string).unwrap_or(file_config.server.listen);
        let public_host = cli_public_host
            .map(str::to_string)
            .unwrap_or(file_config.server.public_host);
        let http_listen = cli_http_listen
            .map(str::to_string)
            .unwrap_or(file_config.server.http_listen);
        let tcp_listen_host = cli_tcp_listen_host
            .map(str::to_string)
            .unwrap_or(file_config.tcp.listen_host);
        let tcp_port_min = cli_tcp_port_min.unwrap_or(file_config.tcp.port_range.min);
        let tcp_port_max = cli_tcp_port_max.unwrap_or(file_config.tcp.port_range.max);
        let default_token_expiry =
            cli_default_token_expiry.unwrap_or(file_config.credentials.default_token_expiry);

        let config = Self {
            listen,
            public_host,
            http_listen,
            tcp_listen_host,
            tcp_port_min,
            tcp_port_max,
            default_token_expiry,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> TunnelResult<()> {
        if self.tcp_port_min < 1024 {
            return Err(TunnelError::Other(format!(
                "tcp.portRange.min must be >= 1024, got {}",
                self.tcp_port_min
            )));
        }
        if self.tcp_port_max < self.tcp_port_min {
            return Err(TunnelError::Other(format!(
                "tcp.portRange.max ({}) must be >= tcp.portRange.min ({})",
                self.tcp_port_max, self.tcp_port_min
            )));
        }
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
