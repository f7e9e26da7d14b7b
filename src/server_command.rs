//! Control-plane actions queued by handlers and executed by the response loop

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::context::{ConnectionContext, ControlSecurity};
use crate::data::{DataConnection, DataTransferRequest};
use crate::protocol::{reply, CRLF, SERVER_COMMAND_QUEUE_CAPACITY};
use crate::response::Response;

pub enum ServerCommand {
    SendResponse(Response),
    /// Fires the connection's cancellation. Sockets are closed by teardown.
    CloseConnection,
    PauseConnection,
    ResumeConnection,
    EnableTls,
    OpenDataConnection(DataTransferRequest),
    CloseDataConnection(DataConnection),
}

impl fmt::Debug for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerCommand::SendResponse(r) => write!(f, "SendResponse({})", r),
            ServerCommand::CloseConnection => f.write_str("CloseConnection"),
            ServerCommand::PauseConnection => f.write_str("PauseConnection"),
            ServerCommand::ResumeConnection => f.write_str("ResumeConnection"),
            ServerCommand::EnableTls => f.write_str("EnableTls"),
            ServerCommand::OpenDataConnection(r) => write!(f, "OpenDataConnection({})", r.command),
            ServerCommand::CloseDataConnection(_) => f.write_str("CloseDataConnection"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("server command queue closed")]
pub struct QueueClosed;

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    flushed: Notify,
}

/// Sending side of the bounded server command queue.
///
/// Tracks how many commands are queued or executing, so the dispatch loop
/// can wait until every reply to a command has been written before it
/// dispatches the next one.
#[derive(Clone)]
pub struct ServerCommandQueue {
    tx: mpsc::Sender<ServerCommand>,
    pending: Arc<Pending>,
}

pub struct ServerCommandReceiver {
    rx: mpsc::Receiver<ServerCommand>,
    pending: Arc<Pending>,
}

pub fn server_command_queue() -> (ServerCommandQueue, ServerCommandReceiver) {
    let (tx, rx) = mpsc::channel(SERVER_COMMAND_QUEUE_CAPACITY);
    let pending = Arc::new(Pending::default());
    (ServerCommandQueue { tx, pending: pending.clone() }, ServerCommandReceiver { rx, pending })
}

impl ServerCommandQueue {
    pub async fn send(&self, command: ServerCommand) -> Result<(), QueueClosed> {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(command).await.is_err() {
            self.complete_one();
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Best effort, never waits. Used by the server's inactivity sweep.
    pub fn try_send(&self, command: ServerCommand) -> Result<(), QueueClosed> {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        if self.tx.try_send(command).is_err() {
            self.complete_one();
            return Err(QueueClosed);
        }
        Ok(())
    }

    pub async fn respond(&self, response: Response) -> Result<(), QueueClosed> {
        let close = response.code == reply::SERVICE_NOT_AVAILABLE;
        self.send(ServerCommand::SendResponse(response)).await?;
        if close {
            self.send(ServerCommand::CloseConnection).await?;
        }
        Ok(())
    }

    /// Resolves once nothing is queued or executing.
    pub async fn flushed(&self) {
        loop {
            let notified = self.pending.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.count.load(Ordering::SeqCst) == 0 || self.tx.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn complete_one(&self) {
        complete_one(&self.pending);
    }
}

fn complete_one(pending: &Pending) {
    if pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
        pending.flushed.notify_waiters();
    }
}

impl ServerCommandReceiver {
    pub async fn recv(&mut self) -> Option<ServerCommand> {
        self.rx.recv().await
    }

    /// Marks the last received command as executed.
    pub fn done(&self) {
        complete_one(&self.pending);
    }

    /// Drops everything still queued.
    pub fn discard(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {
            complete_one(&self.pending);
        }
        self.pending.flushed.notify_waiters();
    }
}

/// Executes one server command. An error means the control connection is
/// unusable and must be aborted.
pub async fn execute(ctx: &Arc<ConnectionContext>, command: ServerCommand) -> std::io::Result<()> {
    match command {
        ServerCommand::SendResponse(response) => send_response(ctx, &response).await,
        ServerCommand::CloseConnection => {
            debug!("closing connection");
            ctx.closed().cancel();
            Ok(())
        }
        ServerCommand::PauseConnection => {
            if let Err(e) = ctx.adapter.lock().await.pause().await {
                warn!("pause connection failed: {}", e);
            }
            Ok(())
        }
        ServerCommand::ResumeConnection => {
            if let Err(e) = ctx.adapter.lock().await.resume().await {
                warn!("resume connection failed: {}", e);
            }
            Ok(())
        }
        ServerCommand::EnableTls => enable_tls(ctx).await,
        ServerCommand::OpenDataConnection(request) => {
            // Runs next to the response loop, which keeps writing its replies
            tokio::spawn(crate::data::run_transfer(ctx.clone(), request));
            Ok(())
        }
        ServerCommand::CloseDataConnection(connection) => {
            connection.close().await;
            Ok(())
        }
    }
}

async fn send_response(ctx: &ConnectionContext, response: &Response) -> std::io::Result<()> {
    let encoding = ctx.control_encoding();
    let mut adapter = ctx.adapter.lock().await;
    for line in response.wire_lines() {
        if ctx.closed().is_cancelled() && response.code != reply::SERVICE_NOT_AVAILABLE {
            debug!("connection closing, reply dropped");
            break;
        }
        let (bytes, _, _) = encoding.encode(&line);
        let mut out = bytes.into_owned();
        out.extend_from_slice(CRLF.as_bytes());
        adapter.write_all(&out).await?;
    }
    debug!(code = response.code, "{}", response);
    Ok(())
}

async fn enable_tls(ctx: &ConnectionContext) -> std::io::Result<()> {
    let result = match &ctx.services.tls {
        Some(identity) => ctx.adapter.lock().await.enable_tls(&identity.acceptor()).await,
        None => Err(anyhow::anyhow!("no certificate configured")),
    };
    match result {
        Ok(()) => {
            ctx.session.lock().control_security = ControlSecurity::Explicit;
            Ok(())
        }
        Err(e) => {
            info!("TLS not enabled: {:#}", e);
            let response = Response::new(reply::SERVICE_NOT_AVAILABLE, ctx.t("TLS negotiation failed."));
            send_response(ctx, &response).await?;
            ctx.closed().cancel();
            Ok(())
        }
    }
}
