//! TLS identity for explicit (`AUTH TLS`) and implicit FTPS

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

/// Where the generated self-signed identity is kept.
pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    if let Some(appdata) = std::env::var_os("APPDATA") {
        return PathBuf::from(appdata).join("ftpd");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("ftpd"),
        None => PathBuf::from(".ftpd"),
    }
}

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

/// Server certificate plus the rustls configuration built from it.
#[derive(Clone)]
pub struct TlsIdentity {
    config: Arc<rustls::ServerConfig>,
    fingerprint: String,
}

impl TlsIdentity {
    pub fn new(config: rustls::ServerConfig, fingerprint: String) -> Self {
        Self { config: Arc::new(config), fingerprint }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }

    /// SHA-256 of the leaf certificate, lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").field("fingerprint", &self.fingerprint).finish()
    }
}

/// Loads the certificate and key, generating a self-signed pair first when
/// the files don't exist yet.
pub fn load_or_generate_server_config(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<TlsIdentity> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => return Err(anyhow!("--tls-cert requires --tls-key"))
    };

    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed(&cert_path, &key_path)?;
    }

    let certs = read_certs(&cert_path)?;
    let leaf = certs.first().context("certificate file contains no certificate")?;
    let fingerprint = sha256_hex(leaf);
    let key = read_key(&key_path)?;

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(TlsIdentity::new(cfg, fingerprint))
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    let mut names = vec!["localhost".to_string()];
    if let Ok(h) = hostname::get() {
        let h = h.to_string_lossy().to_string();
        if !h.is_empty() && h != "localhost" {
            names.push(h);
        }
    }
    let cert = rcgen::generate_simple_self_signed(names).context("generate self-signed certificate")?;
    let cert_pem = cert.serialize_pem().context("serialize certificate")?;
    for (path, pem) in [(cert_path, cert_pem), (key_path, cert.serialize_private_key_pem())] {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        fs::write(path, pem).with_context(|| format!("write {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(key_path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("open certificate {}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", path.display()))
}

/// First PKCS#8, PKCS#1 or SEC1 key in the file.
fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse key {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

fn sha256_hex(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref()).iter().map(|b| format!("{b:02x}")).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_support::identity(dir.path());
        assert_eq!(first.fingerprint().len(), 64);
        // Second load reads the persisted files instead of generating new ones
        let second = test_support::identity(dir.path());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let err = load_or_generate_server_config(Some(PathBuf::from("c.pem")), None).unwrap_err();
        assert!(err.to_string().contains("--tls-key"));
    }
}
