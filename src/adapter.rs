//! Byte forwarding between the socket pipe and the connection pipe
//!
//! Exactly one adapter is active at a time. The pass-through adapter moves
//! bytes unchanged, the TLS adapter decrypts client input and encrypts
//! replies. Swapping adapters (`AUTH TLS`, end of a TLS session, `REIN`)
//! always stops the previous adapter before the next one touches the pipes.
//!
//! Only the inbound direction runs as a background pump. Replies are written
//! by the response loop through [`SecureConnectionAdapterManager::write_all`],
//! so pausing the adapter never holds back a reply such as `234`.

use std::fmt;
use std::io;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipe::{ConnectionPipe, SocketPipe};
use crate::protocol::{timeouts, PIPE_BUFFER_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Pump<S> {
    stop: CancellationToken,
    task: JoinHandle<(ReadHalf<S>, ConnectionPipe)>,
}

/// One forwarding adapter over a stream `S` (the raw socket pipe or a TLS
/// session on top of it).
struct Forwarder<S> {
    status: ServiceStatus,
    reader: Option<ReadHalf<S>>,
    sink: Option<ConnectionPipe>,
    writer: WriteHalf<S>,
    pump: Option<Pump<S>>,
    closed: CancellationToken,
}

impl<S> Forwarder<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn new(stream: S, sink: ConnectionPipe, closed: CancellationToken) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            status: ServiceStatus::Stopped,
            reader: Some(reader),
            sink: Some(sink),
            writer,
            pump: None,
            closed,
        }
    }

    fn spawn(&mut self) -> io::Result<()> {
        let (Some(reader), Some(sink)) = (self.reader.take(), self.sink.take()) else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter pipes are gone"));
        };
        let stop = self.closed.child_token();
        let task = tokio::spawn(forward(reader, sink, stop.clone(), self.closed.clone()));
        self.pump = Some(Pump { stop, task });
        Ok(())
    }

    async fn halt(&mut self) -> io::Result<()> {
        let Some(pump) = self.pump.take() else {
            return Ok(());
        };
        pump.stop.cancel();
        match pump.task.await {
            Ok((reader, sink)) => {
                self.reader = Some(reader);
                self.sink = Some(sink);
                Ok(())
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, format!("adapter pump failed: {e}"))),
        }
    }

    async fn start(&mut self) -> io::Result<()> {
        match self.status {
            ServiceStatus::Stopped => {
                self.status = ServiceStatus::Starting;
                self.spawn()?;
                self.status = ServiceStatus::Running;
                Ok(())
            }
            ServiceStatus::Paused => self.resume().await,
            _ => Ok(()),
        }
    }

    async fn stop(&mut self) -> io::Result<()> {
        if self.status == ServiceStatus::Stopped {
            return Ok(());
        }
        let result = self.halt().await;
        self.status = ServiceStatus::Stopped;
        result
    }

    async fn pause(&mut self) -> io::Result<()> {
        if self.status != ServiceStatus::Running {
            return Ok(());
        }
        self.status = ServiceStatus::Pausing;
        self.halt().await?;
        self.status = ServiceStatus::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> io::Result<()> {
        if self.status != ServiceStatus::Paused {
            return Ok(());
        }
        self.status = ServiceStatus::Resuming;
        self.spawn()?;
        self.status = ServiceStatus::Running;
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Recombines the stream. The adapter must be stopped.
    fn into_parts(self) -> io::Result<(S, ConnectionPipe)> {
        match (self.reader, self.sink) {
            (Some(reader), Some(sink)) => Ok((reader.unsplit(self.writer), sink)),
            _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter is still running")),
        }
    }
}

async fn forward<S>(
    mut reader: ReadHalf<S>,
    mut sink: ConnectionPipe,
    stop: CancellationToken,
    closed: CancellationToken,
) -> (ReadHalf<S>, ConnectionPipe)
where
    S: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            r = reader.read(&mut buf) => match r {
                Ok(0) => {
                    let _ = sink.shutdown().await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("adapter read failed: {}", e);
                    let _ = sink.shutdown().await;
                    break;
                }
            },
        };
        tokio::select! {
            r = sink.write_all(&buf[..n]) => {
                if r.is_err() {
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    (reader, sink)
}

enum ActiveAdapter {
    PassThrough(Forwarder<SocketPipe>),
    Tls(Forwarder<TlsStream<SocketPipe>>),
}

impl ActiveAdapter {
    fn status(&self) -> ServiceStatus {
        match self {
            ActiveAdapter::PassThrough(f) => f.status,
            ActiveAdapter::Tls(f) => f.status,
        }
    }

    async fn start(&mut self) -> io::Result<()> {
        match self {
            ActiveAdapter::PassThrough(f) => f.start().await,
            ActiveAdapter::Tls(f) => f.start().await,
        }
    }

    async fn stop(&mut self) -> io::Result<()> {
        match self {
            ActiveAdapter::PassThrough(f) => f.stop().await,
            ActiveAdapter::Tls(f) => f.stop().await,
        }
    }

    async fn pause(&mut self) -> io::Result<()> {
        match self {
            ActiveAdapter::PassThrough(f) => f.pause().await,
            ActiveAdapter::Tls(f) => f.pause().await,
        }
    }

    async fn resume(&mut self) -> io::Result<()> {
        match self {
            ActiveAdapter::PassThrough(f) => f.resume().await,
            ActiveAdapter::Tls(f) => f.resume().await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            ActiveAdapter::PassThrough(f) => f.write_all(data).await,
            ActiveAdapter::Tls(f) => f.write_all(data).await,
        }
    }

    /// Stops the adapter and hands back the raw socket pipe. A TLS session
    /// is ended with `close_notify` first.
    async fn into_parts(mut self) -> io::Result<(SocketPipe, ConnectionPipe)> {
        self.stop().await?;
        match self {
            ActiveAdapter::PassThrough(f) => f.into_parts(),
            ActiveAdapter::Tls(f) => {
                let (mut tls, sink) = f.into_parts()?;
                tls.get_mut().1.send_close_notify();
                if let Err(e) = tls.flush().await {
                    debug!("close_notify not delivered: {}", e);
                }
                Ok((tls.into_inner().0, sink))
            }
        }
    }
}

/// Owns the socket pipe, the connection pipe and the adapter between them.
pub struct SecureConnectionAdapterManager {
    active: Option<ActiveAdapter>,
    closed: CancellationToken,
}

impl SecureConnectionAdapterManager {
    /// Creates a manager with a stopped pass-through adapter.
    pub fn new(socket: SocketPipe, sink: ConnectionPipe, closed: CancellationToken) -> Self {
        let adapter = ActiveAdapter::PassThrough(Forwarder::new(socket, sink, closed.clone()));
        Self { active: Some(adapter), closed }
    }

    pub fn status(&self) -> ServiceStatus {
        self.active.as_ref().map(ActiveAdapter::status).unwrap_or(ServiceStatus::Stopped)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.active, Some(ActiveAdapter::Tls(_)))
    }

    fn adapter(&mut self) -> io::Result<&mut ActiveAdapter> {
        self.active
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection adapter closed"))
    }

    pub async fn start(&mut self) -> io::Result<()> {
        self.adapter()?.start().await
    }

    pub async fn stop(&mut self) -> io::Result<()> {
        match self.active.as_mut() {
            Some(adapter) => adapter.stop().await,
            None => Ok(()),
        }
    }

    pub async fn pause(&mut self) -> io::Result<()> {
        self.adapter()?.pause().await
    }

    pub async fn resume(&mut self) -> io::Result<()> {
        self.adapter()?.resume().await
    }

    /// Writes reply bytes to the client through the active adapter.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.adapter()?.write_all(data).await
    }

    async fn take_parts(&mut self) -> io::Result<(SocketPipe, ConnectionPipe)> {
        let adapter = self
            .active
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection adapter closed"))?;
        match adapter.into_parts().await {
            Ok(parts) => Ok(parts),
            Err(e) => {
                // Without the pipes there is nothing left to talk over
                self.closed.cancel();
                Err(e)
            }
        }
    }

    async fn install_pass_through(&mut self, socket: SocketPipe, sink: ConnectionPipe) -> io::Result<()> {
        let mut adapter = ActiveAdapter::PassThrough(Forwarder::new(socket, sink, self.closed.clone()));
        let started = adapter.start().await;
        self.active = Some(adapter);
        started
    }

    /// Replaces the active adapter with a fresh, running pass-through adapter.
    pub async fn reset(&mut self) -> io::Result<()> {
        let (socket, sink) = self.take_parts().await?;
        self.install_pass_through(socket, sink).await?;
        debug!("connection adapter reset to pass-through");
        Ok(())
    }

    /// Stops the current adapter and runs a TLS handshake over the socket
    /// pipe. On handshake failure a pass-through adapter is restored before
    /// the error is returned.
    pub async fn enable_tls(&mut self, acceptor: &TlsAcceptor) -> anyhow::Result<()> {
        if self.is_secure() {
            bail!("TLS is already active on this connection");
        }
        let (socket, sink) = self.take_parts().await.context("stop adapter for TLS")?;

        let handshake = tokio::time::timeout(
            timeouts::tls_handshake(),
            acceptor.accept(socket).into_fallible(),
        );
        let outcome = tokio::select! {
            r = handshake => r,
            _ = self.closed.cancelled() => bail!("connection closed during TLS handshake"),
        };

        match outcome {
            Ok(Ok(stream)) => {
                let mut adapter = ActiveAdapter::Tls(Forwarder::new(stream, sink, self.closed.clone()));
                adapter.start().await.context("start TLS adapter")?;
                self.active = Some(adapter);
                info!("control connection secured");
                Ok(())
            }
            Ok(Err((e, socket))) => {
                warn!("TLS handshake failed: {}", e);
                self.install_pass_through(socket, sink)
                    .await
                    .context("restore pass-through adapter")?;
                Err(anyhow!(e).context("TLS handshake failed"))
            }
            Err(_) => {
                // The timed out handshake owned the socket pipe
                self.closed.cancel();
                bail!("TLS handshake timed out")
            }
        }
    }

    /// Stops the adapter and releases both pipes. Dropping the socket pipe
    /// lets the socket pump drain and close the network stream.
    pub async fn close(&mut self) {
        if let Some(adapter) = self.active.take() {
            if let Err(e) = adapter.into_parts().await {
                debug!("adapter close: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{connection_pipe, SocketPump, TransportInput};
    use crate::tls::test_support;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        client: DuplexStream,
        input: TransportInput,
        manager: SecureConnectionAdapterManager,
        _pump: SocketPump,
    }

    fn harness() -> Harness {
        let (client, server) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let closed = CancellationToken::new();
        let (socket, pump) = SocketPump::start(server, closed.clone());
        let (sink, input) = connection_pipe();
        let manager = SecureConnectionAdapterManager::new(socket, sink, closed);
        Harness { client, input, manager, _pump: pump }
    }

    async fn read_n<R: AsyncRead + Unpin>(r: &mut R, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(WAIT, r.read_exact(&mut buf)).await.unwrap().unwrap();
        buf
    }

    #[tokio::test]
    async fn pass_through_forwards_both_ways() {
        let mut h = harness();
        h.manager.start().await.unwrap();
        h.client.write_all(b"USER bob\r\n").await.unwrap();
        assert_eq!(read_n(&mut h.input, 10).await, b"USER bob\r\n");
        h.manager.write_all(b"331 Password?\r\n").await.unwrap();
        assert_eq!(read_n(&mut h.client, 15).await, b"331 Password?\r\n");
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut h = harness();
        h.manager.start().await.unwrap();
        h.manager.start().await.unwrap();
        assert_eq!(h.manager.status(), ServiceStatus::Running);
        h.manager.stop().await.unwrap();
        h.manager.stop().await.unwrap();
        assert_eq!(h.manager.status(), ServiceStatus::Stopped);
        h.manager.start().await.unwrap();
        h.client.write_all(b"NOOP\r\n").await.unwrap();
        assert_eq!(read_n(&mut h.input, 6).await, b"NOOP\r\n");
    }

    #[tokio::test]
    async fn paused_adapter_holds_input_until_resumed() {
        let mut h = harness();
        h.manager.start().await.unwrap();
        h.manager.pause().await.unwrap();
        assert_eq!(h.manager.status(), ServiceStatus::Paused);
        h.client.write_all(b"PWD\r\n").await.unwrap();
        let mut buf = [0u8; 5];
        let early = tokio::time::timeout(Duration::from_millis(100), h.input.read_exact(&mut buf)).await;
        assert!(early.is_err());
        h.manager.resume().await.unwrap();
        assert_eq!(read_n(&mut h.input, 5).await, b"PWD\r\n");
    }

    #[tokio::test]
    async fn tls_can_be_enabled_again_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = test_support::identity(dir.path()).acceptor();
        let Harness { client, mut input, mut manager, _pump } = harness();
        manager.start().await.unwrap();

        manager.pause().await.unwrap();
        let connector = test_support::connector();
        let (enabled, tls) = tokio::join!(
            manager.enable_tls(&acceptor),
            connector.connect(test_support::server_name(), client)
        );
        enabled.unwrap();
        let mut tls = tls.unwrap();
        assert!(manager.is_secure());
        assert_eq!(manager.status(), ServiceStatus::Running);

        tls.write_all(b"PBSZ 0\r\n").await.unwrap();
        tls.flush().await.unwrap();
        assert_eq!(read_n(&mut input, 8).await, b"PBSZ 0\r\n");
        manager.write_all(b"200 PBSZ=0\r\n").await.unwrap();
        assert_eq!(read_n(&mut tls, 12).await, b"200 PBSZ=0\r\n");

        manager.reset().await.unwrap();
        assert!(!manager.is_secure());
        // close_notify ends the client's TLS view of the stream
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, tls.read_to_end(&mut rest)).await.unwrap().unwrap();
        let (mut raw, _) = tls.into_inner();

        raw.write_all(b"NOOP\r\n").await.unwrap();
        assert_eq!(read_n(&mut input, 6).await, b"NOOP\r\n");

        manager.pause().await.unwrap();
        let (enabled, tls) = tokio::join!(
            manager.enable_tls(&acceptor),
            connector.connect(test_support::server_name(), raw)
        );
        enabled.unwrap();
        tls.unwrap();
        assert!(manager.is_secure());
    }

    #[tokio::test]
    async fn failed_handshake_falls_back_to_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let acceptor = test_support::identity(dir.path()).acceptor();
        let mut h = harness();
        h.manager.start().await.unwrap();
        h.manager.pause().await.unwrap();

        h.client.write_all(b"NOOP\r\n").await.unwrap();
        let err = h.manager.enable_tls(&acceptor).await.unwrap_err();
        assert!(err.to_string().contains("TLS handshake failed"));
        assert!(!h.manager.is_secure());
        assert_eq!(h.manager.status(), ServiceStatus::Running);

        h.client.write_all(b"FEAT\r\n").await.unwrap();
        assert_eq!(read_n(&mut h.input, 6).await, b"FEAT\r\n");
    }
}
