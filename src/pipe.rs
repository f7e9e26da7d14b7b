//! In-process duplex pipes between the network socket and the protocol engine
//!
//! ```text
//!  TCP/TLS socket <-> SocketPump <-> socket pipe <-> adapter <-> connection pipe <-> read loop
//!                                                       ^
//!                                      response writes -+
//! ```
//!
//! The socket pump only moves raw bytes. Whatever sits between the socket
//! pipe and the connection pipe (pass-through or TLS) is owned by the
//! `adapter::SecureConnectionAdapterManager` and can be swapped at runtime.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::PIPE_BUFFER_SIZE;

/// Adapter-facing end of the socket pipe. Bytes read from it came from the
/// network, bytes written to it go to the network.
pub type SocketPipe = DuplexStream;

/// Adapter-facing end of the connection pipe. The adapter writes decoded
/// client bytes into it.
pub type ConnectionPipe = DuplexStream;

/// Engine-facing end of the connection pipe, read by the command read loop.
pub type TransportInput = DuplexStream;

/// How long teardown waits for queued output to reach the network.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates the connection pipe pair: (adapter side, read loop side).
pub fn connection_pipe() -> (ConnectionPipe, TransportInput) {
    tokio::io::duplex(PIPE_BUFFER_SIZE)
}

/// Moves bytes between a network stream and the socket pipe.
///
/// The inbound half cancels `closed` when the peer disconnects. The outbound
/// half ends once every writer of the socket pipe is gone, then shuts the
/// network stream down so queued replies (e.g. `221`) still reach the client.
pub struct SocketPump {
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl SocketPump {
    pub fn start<S>(stream: S, closed: CancellationToken) -> (SocketPipe, SocketPump)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (pipe, peer) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let (mut net_rd, mut net_wr) = tokio::io::split(stream);
        let (mut peer_rd, mut peer_wr) = tokio::io::split(peer);

        let inbound = tokio::spawn(async move {
            let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
            loop {
                let n = match net_rd.read(&mut buf).await {
                    Ok(0) => {
                        debug!("socket closed by peer");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("socket read failed: {}", e);
                        break;
                    }
                };
                if peer_wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = peer_wr.shutdown().await;
            // Signal a closed connection
            closed.cancel();
        });

        let outbound = tokio::spawn(async move {
            let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
            loop {
                let n = match peer_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Err(e) = net_wr.write_all(&buf[..n]).await {
                    debug!("socket write failed: {}", e);
                    return;
                }
                if net_wr.flush().await.is_err() {
                    return;
                }
            }
            trace!("socket pipe drained");
            let _ = net_wr.shutdown().await;
        });

        (pipe, SocketPump { inbound, outbound })
    }

    /// Waits for pending output to be written, then stops reading.
    pub async fn finish(self) {
        let mut outbound = self.outbound;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut outbound).await.is_err() {
            debug!("socket output not drained in time");
            outbound.abort();
        }
        self.inbound.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pump_forwards_both_directions_and_drains_on_finish() {
        let (client, server) = tokio::io::duplex(1024);
        let closed = CancellationToken::new();
        let (mut pipe, pump) = SocketPump::start(server, closed.clone());
        let (mut client_rd, mut client_wr) = tokio::io::split(client);

        client_wr.write_all(b"NOOP\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NOOP\r\n");

        pipe.write_all(b"221 Bye\r\n").await.unwrap();
        drop(pipe);
        pump.finish().await;

        let mut out = Vec::new();
        client_rd.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"221 Bye\r\n");
    }

    #[tokio::test]
    async fn peer_disconnect_cancels_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let closed = CancellationToken::new();
        let (_pipe, _pump) = SocketPump::start(server, closed.clone());
        drop(client);
        tokio::time::timeout(Duration::from_secs(1), closed.cancelled()).await.unwrap();
    }
}
