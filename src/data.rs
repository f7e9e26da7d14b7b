//! Data connections: establishment, protection and the per-transfer lifecycle
//!
//! A transfer asks for a data connection through the server command queue.
//! The connection is opened (active: we connect to the client, passive: the
//! client connects to our listener), wrapped in TLS when `PROT P` is in
//! effect, handed to the transfer and closed afterwards. A transfer that
//! answers `250` leaves the connection open for the next transfer.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::command::Command;
use crate::context::{BackgroundSlot, ConnectionContext, DataProtection};
use crate::dispatch::CommandContext;
use crate::error::FtpError;
use crate::protocol::{reply, timeouts};
use crate::response::Response;
use crate::server_command::ServerCommand;
use crate::stats::{TransferInfo, TransferStatus};

const BIND_RETRIES: u8 = 10;

pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// One established data connection. Counts the payload bytes moved over it.
pub struct DataConnection {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stream: DataStream,
    bytes: u64,
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("secure", &self.is_secure())
            .finish()
    }
}

impl DataConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Ok(Self {
            local_addr: stream.local_addr()?,
            remote_addr: stream.peer_addr()?,
            stream: DataStream::Plain(stream),
            bytes: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, DataStream::Tls(_))
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    /// Runs the server side of a TLS handshake on the data connection.
    pub async fn secure(self, acceptor: &TlsAcceptor) -> Result<Self, FtpError> {
        let tcp = match self.stream {
            DataStream::Plain(tcp) => tcp,
            tls @ DataStream::Tls(_) => return Ok(Self { stream: tls, ..self }),
        };
        let stream = tokio::time::timeout(timeouts::tls_handshake(), acceptor.accept(tcp))
            .await
            .map_err(|_| FtpError::Validation("TLS negotiation timed out on data connection.".into()))?
            .map_err(|e| FtpError::Validation(format!("TLS negotiation failed on data connection: {e}")))?;
        Ok(Self { stream: DataStream::Tls(Box::new(stream)), ..self })
    }

    /// Ends the TLS session (if any) and shuts the socket down.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("data connection shutdown: {}", e);
        }
    }
}

impl AsyncRead for DataConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let r = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = r {
            this.bytes += (buf.filled().len() - before) as u64;
        }
        r
    }
}

impl AsyncWrite for DataConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let r = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = r {
            this.bytes += n as u64;
        }
        r
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// What the next transfer connects over, as negotiated by
/// `PORT`/`EPRT`/`PASV`/`EPSV`.
#[derive(Default)]
pub enum DataChannel {
    #[default]
    None,
    Active(SocketAddr),
    Passive(TcpListener),
    /// Left open by a transfer that answered `250`
    Open(DataConnection),
}

fn cant_open(e: impl fmt::Display) -> FtpError {
    FtpError::Validation(format!("Can't open data connection: {e}"))
}

/// Maps IPv4-mapped IPv6 addresses back to IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Opens the negotiated data connection within the data connection timeout.
pub async fn establish(ctx: &ConnectionContext) -> Result<DataConnection, FtpError> {
    match ctx.take_data_channel() {
        DataChannel::None => Err(FtpError::Validation(ctx.t("Use PORT or PASV first."))),
        DataChannel::Open(conn) => Ok(conn),
        DataChannel::Active(target) => {
            let socket = match target {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(cant_open)?;
            if let Some(port) = ctx.services.config.active_data_port {
                socket.set_reuseaddr(true).map_err(cant_open)?;
                socket.bind(SocketAddr::new(ctx.local_addr().ip(), port)).map_err(cant_open)?;
            }
            let stream = tokio::time::timeout(timeouts::data_connection(), socket.connect(target))
                .await
                .map_err(|_| cant_open("connect timed out"))?
                .map_err(cant_open)?;
            DataConnection::new(stream).map_err(cant_open)
        }
        DataChannel::Passive(listener) => {
            let peer_ip = canonical_ip(ctx.remote_addr().ip());
            let accept = async {
                loop {
                    let (stream, addr) = listener.accept().await?;
                    if canonical_ip(addr.ip()) == peer_ip {
                        return Ok::<_, io::Error>(stream);
                    }
                    warn!(%addr, "data connection from foreign address rejected");
                }
            };
            let stream = tokio::time::timeout(timeouts::data_connection(), accept)
                .await
                .map_err(|_| cant_open("accept timed out"))?
                .map_err(cant_open)?;
            DataConnection::new(stream).map_err(cant_open)
        }
    }
}

fn listen_on(ip: IpAddr, port: u16) -> io::Result<TcpListener> {
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::new(ip, port))?;
    socket.listen(1)
}

/// Binds a passive listener on `ip`, on a random port from `ports` when a
/// range is configured.
pub fn bind_passive(ip: IpAddr, ports: Option<RangeInclusive<u16>>) -> io::Result<TcpListener> {
    let Some(ports) = ports else {
        return listen_on(ip, 0);
    };
    let mut last = io::Error::new(io::ErrorKind::AddrInUse, "no free passive port");
    for _ in 0..BIND_RETRIES {
        match listen_on(ip, fastrand::u16(ports.clone())) {
            Ok(listener) => return Ok(listener),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Text of a `227` reply.
pub fn pasv_reply(ip: Ipv4Addr, port: u16) -> String {
    let o = ip.octets();
    format!("Entering Passive Mode ({},{},{},{},{},{}).", o[0], o[1], o[2], o[3], port >> 8, port & 0xff)
}

/// Text of a `229` reply.
pub fn epsv_reply(port: u16) -> String {
    format!("Entering Extended Passive Mode (|||{}|).", port)
}

/// `PORT h1,h2,h3,h4,p1,p2`
pub fn parse_port(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<u8> = arg.trim().split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
    let [a, b, c, d, p1, p2] = parts[..] else {
        return None;
    };
    let port = u16::from(p1) << 8 | u16::from(p2);
    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
}

/// `EPRT |af|address|port|`, any printable delimiter
pub fn parse_eprt(arg: &str) -> Option<SocketAddr> {
    let arg = arg.trim();
    let delim = arg.chars().next()?;
    let fields: Vec<&str> = arg.split(delim).collect();
    let [_, af, addr, port, _] = fields[..] else {
        return None;
    };
    let ip: IpAddr = match af {
        "1" => IpAddr::V4(addr.parse().ok()?),
        "2" => IpAddr::V6(addr.parse().ok()?),
        _ => return None,
    };
    Some(SocketAddr::new(ip, port.parse().ok()?))
}

/// The payload side of a transfer, run once the data connection is open.
#[async_trait]
pub trait DataTransfer: Send {
    /// Returns the final reply. `250` keeps the data connection open.
    async fn transfer(
        self: Box<Self>,
        connection: &mut DataConnection,
        cancel: &CancellationToken,
    ) -> Result<Response, FtpError>;
}

pub struct DataTransferRequest {
    pub command: Command,
    pub transfer: Box<dyn DataTransfer>,
    pub info: TransferInfo,
    pub cancel: CancellationToken,
    /// Released just before the final reply is queued.
    pub slot: Option<BackgroundSlot>,
    pub done: oneshot::Sender<()>,
}

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Queues the transfer and waits until its final reply has been queued.
pub async fn start_transfer(
    cx: &CommandContext,
    path: Option<String>,
    transfer: Box<dyn DataTransfer>,
) -> Result<Option<Response>, FtpError> {
    let ctx = &cx.connection;
    let command = &cx.command;
    let info = TransferInfo {
        id: NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed),
        connection_id: ctx.id().to_string(),
        user: ctx.user().map(|u| u.name),
        command: command.verb().to_string(),
        path,
    };
    let (done, finished) = oneshot::channel();
    let request = DataTransferRequest {
        command: command.clone(),
        transfer,
        info,
        cancel: cx.cancel.clone(),
        slot: cx.slot.clone(),
        done,
    };
    if ctx.server_commands.send(ServerCommand::OpenDataConnection(request)).await.is_err() {
        return Err(FtpError::Cancelled);
    }
    // Dropped unanswered only when the connection goes away
    let _ = finished.await;
    Ok(None)
}

/// Reports the transfer to the statistics collectors; a transfer that never
/// finishes (task aborted) is reported as interrupted.
struct TransferRegistration<'a> {
    ctx: &'a ConnectionContext,
    info: TransferInfo,
    finished: bool,
}

impl<'a> TransferRegistration<'a> {
    fn start(ctx: &'a ConnectionContext, info: TransferInfo) -> Self {
        ctx.keepalive.transfer_started();
        ctx.notify(|c| c.transfer_started(&info));
        Self { ctx, info, finished: false }
    }

    fn finish(mut self, status: TransferStatus, bytes: u64) {
        self.report(status, bytes);
    }

    fn report(&mut self, status: TransferStatus, bytes: u64) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ctx.keepalive.transfer_stopped();
        let info = &self.info;
        self.ctx.notify(|c| c.transfer_stopped(info, status, bytes));
    }
}

impl Drop for TransferRegistration<'_> {
    fn drop(&mut self) {
        self.report(TransferStatus::Interrupted, 0);
    }
}

fn transfer_status(code: u16) -> TransferStatus {
    match code {
        reply::CLOSING_DATA | reply::FILE_ACTION_OK => TransferStatus::Completed,
        reply::TRANSFER_ABORTED => TransferStatus::Interrupted,
        _ => TransferStatus::Failed,
    }
}

/// Wraps the connection in TLS when `PROT P` is in effect.
async fn protect(ctx: &ConnectionContext, conn: DataConnection) -> Result<DataConnection, FtpError> {
    if ctx.data_protection() != DataProtection::Private || conn.is_secure() {
        return Ok(conn);
    }
    let Some(identity) = &ctx.services.tls else {
        conn.close().await;
        return Err(FtpError::Validation(ctx.t("Data protection requires TLS.")));
    };
    conn.secure(&identity.acceptor()).await
}

/// The data connection unit spawned for `OpenDataConnection`.
pub async fn run_transfer(ctx: Arc<ConnectionContext>, request: DataTransferRequest) {
    let DataTransferRequest { command, transfer, info, cancel, slot, done } = request;
    let span = tracing::debug_span!("transfer", id = info.id, command = %command.verb());
    async move {
        let registration = TransferRegistration::start(&ctx, info);
        let queue = &ctx.server_commands;
        let release = || {
            if let Some(slot) = &slot {
                slot.release();
            }
        };

        // Any failure to get a connection, ABOR included, is a 425
        let opened = tokio::select! {
            r = establish(&ctx) => r,
            _ = cancel.cancelled() => Err(FtpError::Validation(ctx.t("Data connection aborted."))),
        };
        let conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                debug!("data connection failed: {}", e);
                registration.finish(TransferStatus::Failed, 0);
                release();
                let _ = queue.respond(Response::new(reply::CANT_OPEN_DATA, e.to_string())).await;
                let _ = done.send(());
                return;
            }
        };

        // Clients start the PROT P handshake only after they have seen the 150
        let _ = queue.respond(Response::new(reply::OPENING_DATA, ctx.t("Opening data connection."))).await;
        let secured = tokio::select! {
            r = protect(&ctx, conn) => r,
            _ = cancel.cancelled() => Err(FtpError::Cancelled),
        };
        let mut conn = match secured {
            Ok(conn) => conn,
            Err(e) => {
                debug!("data connection protection failed: {}", e);
                registration.finish(transfer_status(e.code()), 0);
                release();
                let _ = queue.respond(e.to_response()).await;
                let _ = done.send(());
                return;
            }
        };

        let result = tokio::select! {
            r = transfer.transfer(&mut conn, &cancel) => r,
            _ = cancel.cancelled() => Err(FtpError::Cancelled),
        };
        let response = result.unwrap_or_else(|e| e.to_response());
        let bytes = conn.bytes_transferred();

        if response.code == reply::FILE_ACTION_OK {
            ctx.park_data_connection(conn);
        } else {
            let _ = queue.send(ServerCommand::CloseDataConnection(conn)).await;
        }
        registration.finish(transfer_status(response.code), bytes);
        release();
        let _ = queue.respond(response).await;
        let _ = done.send(());
    }
    .instrument(span)
    .await
}
