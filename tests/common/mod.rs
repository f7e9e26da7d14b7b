#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ftpd::config::ServerConfig;
use ftpd::context::Services;
use ftpd::server::FtpServer;
use ftpd::tls::TlsIdentity;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub server: Arc<FtpServer>,
    pub root: TempDir,
    pub addr: SocketAddr,
    _certs: TempDir,
}

impl TestServer {
    pub async fn start(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        Self::start_inner(configure, false).await
    }

    pub async fn start_tls(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        Self::start_inner(configure, true).await
    }

    async fn start_inner(configure: impl FnOnce(&mut ServerConfig), tls: bool) -> Self {
        let root = TempDir::new().unwrap();
        let certs = TempDir::new().unwrap();
        let mut config = ServerConfig {
            listen: "127.0.0.1".into(),
            port: 0,
            root: root.path().to_path_buf(),
            anonymous: true,
            ..ServerConfig::default()
        };
        config.users.insert("bob".into(), "secret".into());
        configure(&mut config);

        let identity: Option<TlsIdentity> = tls.then(|| {
            ftpd::tls::load_or_generate_server_config(
                Some(certs.path().join("cert.pem")),
                Some(certs.path().join("key.pem")),
            )
            .unwrap()
        });
        let services = Services::from_config(config, identity).unwrap();
        let server = FtpServer::bind(services).await.unwrap();
        server.start();
        let addr = server.local_addrs()[0];
        Self { server, root, addr, _certs: certs }
    }

    pub async fn connect(&self) -> Client<TcpStream> {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        Client::new(stream)
    }

    /// Connects and reads the greeting.
    pub async fn client(&self) -> Client<TcpStream> {
        let mut client = self.connect().await;
        assert_eq!(client.reply().await.0, 220);
        client
    }

    /// Connects and logs in as `user`.
    pub async fn login(&self, user: &str, password: &str) -> Client<TcpStream> {
        let mut client = self.client().await;
        assert_eq!(client.cmd(&format!("USER {user}")).await.0, 331);
        assert_eq!(client.cmd(&format!("PASS {password}")).await.0, 230);
        client
    }
}

/// Line based FTP control client.
pub struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufReader::new(stream) }
    }

    pub async fn send(&mut self, line: &str) {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let s = self.stream.get_mut();
        s.write_all(bytes).await.unwrap();
        s.flush().await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(WAIT, self.stream.read_line(&mut line)).await.unwrap().unwrap();
        assert!(n > 0, "control connection closed");
        line.trim_end().to_string()
    }

    /// Reads one complete (possibly multi-line) reply.
    pub async fn reply(&mut self) -> (u16, String) {
        let first = self.line().await;
        let code: u16 = first[..3].parse().unwrap();
        let mut text = first[4..].to_string();
        if first.as_bytes()[3] == b'-' {
            let end = format!("{code} ");
            loop {
                let line = self.line().await;
                text.push('\n');
                if let Some(last) = line.strip_prefix(&end) {
                    text.push_str(last);
                    break;
                }
                text.push_str(line.trim_start());
            }
        }
        (code, text)
    }

    pub async fn cmd(&mut self, line: &str) -> (u16, String) {
        self.send(line).await;
        self.reply().await
    }

    /// True once the server has closed the control connection.
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(tokio::time::timeout(WAIT, self.stream.read(&mut buf)).await, Ok(Ok(0)) | Ok(Err(_)))
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

/// Data port from a `227` reply text.
pub fn pasv_addr(text: &str) -> SocketAddr {
    let start = text.find('(').unwrap() + 1;
    let end = text.find(')').unwrap();
    let n: Vec<u16> = text[start..end].split(',').map(|p| p.parse().unwrap()).collect();
    let ip = format!("{}.{}.{}.{}", n[0], n[1], n[2], n[3]);
    SocketAddr::new(ip.parse().unwrap(), n[4] << 8 | n[5])
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

pub async fn read_all<R: AsyncRead + Unpin>(r: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(WAIT, r.read_to_end(&mut out)).await.unwrap().unwrap();
    out
}

#[derive(Debug)]
struct AcceptAny;

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn connector() -> tokio_rustls::TlsConnector {
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(cfg))
}

pub fn server_name() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}
