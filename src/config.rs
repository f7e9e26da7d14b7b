//! Server configuration, loaded from TOML and overridden by CLI flags

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};

use crate::protocol::timeouts;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// Offer `AUTH TLS`. Implied by `implicit` or an explicit certificate.
    pub enabled: bool,
    /// Handshake right after accept (FTPS, usually port 990)
    pub implicit: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl TlsConfig {
    pub fn wanted(&self) -> bool {
        self.enabled || self.implicit || self.cert.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name, IP address, `*` (IPv4 and IPv6) or `any` (IPv4)
    pub listen: String,
    pub port: u16,
    pub root: PathBuf,
    /// 0 = unlimited
    pub max_connections: usize,
    /// Seconds without activity before a connection is closed, 0 = never
    pub idle_timeout_secs: u64,
    pub check_interval_secs: u64,
    /// `encoding_rs` label of the default control channel encoding
    pub encoding: String,
    pub pasv_min_port: Option<u16>,
    pub pasv_max_port: Option<u16>,
    /// Address announced in `227` replies instead of the local address
    pub pasv_address: Option<IpAddr>,
    /// Local port for active mode connections, ephemeral when unset
    pub active_data_port: Option<u16>,
    pub banner: String,
    pub anonymous: bool,
    /// user name -> password
    pub users: HashMap<String, String>,
    pub transfer_log: Option<PathBuf>,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "any".to_string(),
            port: 21,
            root: PathBuf::from("."),
            max_connections: 0,
            idle_timeout_secs: 300,
            check_interval_secs: timeouts::INACTIVITY_CHECK_SECS,
            encoding: "utf-8".to_string(),
            pasv_min_port: None,
            pasv_max_port: None,
            pasv_address: None,
            active_data_port: None,
            banner: "ftpd ready".to_string(),
            anonymous: false,
            users: HashMap::new(),
            transfer_log: None,
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: ServerConfig = toml::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.control_encoding()?;
        if let (Some(min), Some(max)) = (self.pasv_min_port, self.pasv_max_port) {
            if min > max {
                bail!("passive port range is empty: {}-{}", min, max);
            }
        }
        if self.check_interval_secs == 0 {
            bail!("check interval must be at least one second");
        }
        Ok(())
    }

    pub fn control_encoding(&self) -> Result<&'static Encoding> {
        Encoding::for_label(self.encoding.as_bytes())
            .with_context(|| format!("unknown encoding: {}", self.encoding))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Passive listener ports. Ports below 1024 are never used.
    pub fn pasv_port_range(&self) -> Option<RangeInclusive<u16>> {
        if self.pasv_min_port.is_none() && self.pasv_max_port.is_none() {
            return None;
        }
        let min = self.pasv_min_port.unwrap_or(1024).max(1024);
        let max = self.pasv_max_port.unwrap_or(u16::MAX);
        (min <= max).then(|| min..=max)
    }
}
