//! Command line options for the ftpd binary

use clap::{ArgAction, Parser};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::config::ServerConfig;

/// FTP/FTPS server
#[derive(Clone, Debug, Parser)]
#[command(name = "ftpd", version)]
pub struct DaemonOpts {
    /// Listen address: host name, IP, `*` (IPv4 and IPv6) or `any`
    #[arg(long)]
    pub bind: Option<String>,

    /// Control connection port
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Offer AUTH TLS (a self-signed certificate is generated when needed)
    #[arg(long)]
    pub tls: bool,

    /// TLS right after accept instead of AUTH TLS
    #[arg(long)]
    pub implicit_tls: bool,

    /// Path to TLS certificate (PEM)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Maximum simultaneous connections, 0 = unlimited
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds of inactivity before a connection is closed, 0 = never
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    #[arg(long)]
    pub pasv_min_port: Option<u16>,

    #[arg(long)]
    pub pasv_max_port: Option<u16>,

    /// Address announced in PASV replies (e.g. behind NAT)
    #[arg(long)]
    pub pasv_address: Option<IpAddr>,

    /// Default control channel encoding label
    #[arg(long)]
    pub encoding: Option<String>,

    /// Allow anonymous (read-only) logins
    #[arg(long)]
    pub anonymous: bool,

    /// Append finished transfers to this JSONL file
    #[arg(long)]
    pub transfer_log: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    /// Overrides `config` with every flag that was given.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.listen = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if self.pasv_min_port.is_some() {
            config.pasv_min_port = self.pasv_min_port;
        }
        if self.pasv_max_port.is_some() {
            config.pasv_max_port = self.pasv_max_port;
        }
        if self.pasv_address.is_some() {
            config.pasv_address = self.pasv_address;
        }
        if let Some(encoding) = &self.encoding {
            config.encoding = encoding.clone();
        }
        if self.transfer_log.is_some() {
            config.transfer_log = self.transfer_log.clone();
        }
        config.anonymous |= self.anonymous;
        config.tls.enabled |= self.tls;
        config.tls.implicit |= self.implicit_tls;
        if self.tls_cert.is_some() {
            config.tls.cert = self.tls_cert.clone();
        }
        if self.tls_key.is_some() {
            config.tls.key = self.tls_key.clone();
        }
    }

    /// Default tracing filter for the verbosity flag.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let opts = DaemonOpts::parse_from(["ftpd", "--port", "2121", "--anonymous", "--implicit-tls", "-vv"]);
        let mut config = ServerConfig { port: 21, banner: "hi".into(), ..Default::default() };
        opts.apply(&mut config);
        assert_eq!(config.port, 2121);
        assert!(config.anonymous);
        assert!(config.tls.implicit && config.tls.wanted());
        assert_eq!(config.banner, "hi");
        assert_eq!(opts.log_filter(), "trace");
    }
}
