mod common;

use common::{connector, eventually, pasv_addr, read_all, server_name, Client, TestServer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Logs in over a control connection secured with `AUTH TLS`.
async fn secured_login(srv: &TestServer) -> Client<TlsStream<TcpStream>> {
    let mut plain = srv.client().await;
    assert_eq!(plain.cmd("AUTH TLS").await.0, 234);
    let tls = connector().connect(server_name(), plain.into_inner()).await.unwrap();
    let mut c = Client::new(tls);
    assert_eq!(c.cmd("USER bob").await.0, 331);
    assert_eq!(c.cmd("PASS secret").await.0, 230);
    c
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_tls_with_protected_listing() {
    let srv = TestServer::start_tls(|_| {}).await;
    std::fs::write(srv.root.path().join("report.csv"), b"a,b\n").unwrap();
    let mut c = secured_login(&srv).await;

    let (code, feat) = c.cmd("FEAT").await;
    assert_eq!(code, 211);
    assert!(feat.contains("AUTH TLS") && feat.contains("PROT"));
    assert_eq!(c.cmd("PBSZ 0").await.0, 200);
    assert_eq!(c.cmd("PROT Q").await.0, 536);
    assert_eq!(c.cmd("PROT P").await.0, 200);

    let (_, text) = c.cmd("PASV").await;
    let tcp = TcpStream::connect(pasv_addr(&text)).await.unwrap();
    c.send("NLST").await;
    // The handshake only starts once the 150 is in
    assert_eq!(c.reply().await.0, 150);
    let mut data = connector().connect(server_name(), tcp).await.unwrap();
    assert_eq!(read_all(&mut data).await, b"report.csv\r\n");
    assert_eq!(c.reply().await.0, 226);

    let (code, text) = c.cmd("STAT").await;
    assert_eq!(code, 211);
    assert!(text.contains("Logged in as bob"));
    assert!(text.contains("Security mechanism: AUTH TLS"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ccc_returns_to_clear_text() {
    let srv = TestServer::start_tls(|_| {}).await;
    let mut c = secured_login(&srv).await;
    assert_eq!(c.cmd("PROT P").await.0, 200);

    assert_eq!(c.cmd("CCC").await.0, 200);
    // close_notify follows the reply
    assert!(c.closed().await);
    let (tcp, _) = c.into_inner().into_inner();

    let mut plain = Client::new(tcp);
    assert_eq!(plain.cmd("NOOP").await.0, 200);
    assert_eq!(plain.cmd("PBSZ 0").await.0, 503);
    assert_eq!(plain.cmd("CCC").await.0, 503);
    assert!(plain.cmd("PWD").await.1.starts_with("\"/\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secured_control_rejects_a_second_auth_and_survives_rein() {
    let srv = TestServer::start_tls(|_| {}).await;
    let mut c = secured_login(&srv).await;
    assert_eq!(c.cmd("AUTH TLS").await.0, 503);

    let (code, text) = c.cmd("REIN").await;
    assert_eq!(code, 220);
    assert_eq!(text, "ftpd ready");
    assert_eq!(c.cmd("PWD").await.0, 530);
    // Still speaking TLS after the reset
    assert_eq!(c.cmd("PBSZ 0").await.0, 200);
    assert_eq!(c.cmd("USER anonymous").await.0, 331);
    assert_eq!(c.cmd("PASS x").await.0, 230);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_mechanisms_and_unconfigured_tls() {
    let srv = TestServer::start_tls(|_| {}).await;
    let mut c = srv.client().await;
    assert_eq!(c.cmd("AUTH KERBEROS").await.0, 504);
    assert_eq!(c.cmd("PROT P").await.0, 503);

    let plain = TestServer::start(|_| {}).await;
    let mut c = plain.client().await;
    assert_eq!(c.cmd("AUTH TLS").await.0, 502);
    let (_, feat) = c.cmd("FEAT").await;
    assert!(!feat.contains("AUTH TLS"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn implicit_tls_greets_after_the_handshake() {
    let srv = TestServer::start_tls(|cfg| cfg.tls.implicit = true).await;
    let tcp = TcpStream::connect(srv.addr).await.unwrap();
    let tls = connector().connect(server_name(), tcp).await.unwrap();
    let mut c = Client::new(tls);
    assert_eq!(c.reply().await.0, 220);
    assert_eq!(c.cmd("AUTH TLS").await.0, 503);
    assert_eq!(c.cmd("PBSZ 0").await.0, 200);
    assert_eq!(c.cmd("USER anonymous").await.0, 331);
    assert_eq!(c.cmd("PASS x").await.0, 230);
    // Only explicit sessions can be cleared
    assert_eq!(c.cmd("CCC").await.0, 503);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_tls_records_end_the_connection() {
    let srv = TestServer::start_tls(|cfg| cfg.idle_timeout_secs = 0).await;
    let mut plain = srv.client().await;
    assert_eq!(plain.cmd("AUTH TLS").await.0, 234);
    let tls = connector().connect(server_name(), plain.into_inner()).await.unwrap();
    assert_eq!(srv.server.statistics().active_connections, 1);

    // An application data record that fails to decrypt, on a socket that stays open
    let (mut raw, _) = tls.into_inner();
    raw.write_all(&[0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5]).await.unwrap();
    raw.flush().await.unwrap();
    eventually(|| srv.server.statistics().active_connections == 0).await;
    drop(raw);
}
