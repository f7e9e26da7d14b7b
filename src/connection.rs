//! One FTP control connection and the tasks that drive it
//!
//! ```text
//!  adapter -> connection pipe -> read loop -> commands -> dispatch loop
//!                                                              |
//!  adapter <- response loop <- server commands <- handlers <---+
//! ```
//!
//! The dispatch loop handles one command at a time. After each command it
//! waits until every server command queued so far has been executed, so
//! replies leave in command order. Abortable commands run in the background
//! slot and don't hold the loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument, Span};

use crate::adapter::SecureConnectionAdapterManager;
use crate::collector::CommandCollector;
use crate::command::Command;
use crate::context::{ConnectionContext, ControlSecurity, Services};
use crate::dispatch::{CommandContext, Next};
use crate::pipe::{connection_pipe, SocketPump, TransportInput};
use crate::protocol::COMMAND_QUEUE_CAPACITY;
use crate::server_command::{execute, server_command_queue, ServerCommandReceiver};

/// How long `stop` waits for each connection task before aborting it.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 4096;

/// Pieces handed to the tasks on start, or released on stop.
struct Parts {
    input: Option<TransportInput>,
    commands: Option<ServerCommandReceiver>,
    pump: Option<SocketPump>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct FtpConnection {
    ctx: Arc<ConnectionContext>,
    parts: tokio::sync::Mutex<Parts>,
    started: AtomicBool,
    stopped: AtomicBool,
    span: Span,
}

impl FtpConnection {
    /// Wraps an accepted (and, for implicit TLS, already secured) stream.
    /// Nothing is read or written before [`FtpConnection::start`].
    pub fn new<S>(
        stream: S,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        services: Arc<Services>,
        control_security: ControlSecurity,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let closed = CancellationToken::new();
        let (socket, pump) = SocketPump::start(stream, closed.clone());
        let (sink, input) = connection_pipe();
        let adapter = SecureConnectionAdapterManager::new(socket, sink, closed.clone());
        let (queue, commands) = server_command_queue();
        let ctx = Arc::new(ConnectionContext::new(
            local_addr,
            remote_addr,
            services,
            control_security,
            queue,
            adapter,
            closed,
        ));
        let span = tracing::info_span!("connection", id = %ctx.id(), remote = %remote_addr);
        ctx.notify(|c| c.connection_opened(ctx.id()));
        Arc::new(Self {
            ctx,
            parts: tokio::sync::Mutex::new(Parts {
                input: Some(input),
                commands: Some(commands),
                pump: Some(pump),
                tasks: Vec::new(),
            }),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            span,
        })
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    /// Fires once when the connection ends, for whatever reason.
    pub fn closed(&self) -> &CancellationToken {
        self.ctx.closed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts the adapter and the connection tasks. The connection stops
    /// itself once closed.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut parts = self.parts.lock().await;
        let (Some(input), Some(commands)) = (parts.input.take(), parts.commands.take()) else {
            anyhow::bail!("connection already stopped");
        };
        self.ctx.adapter.lock().await.start().await.context("start connection adapter")?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        parts.tasks.push(tokio::spawn(read_loop(self.ctx.clone(), input, tx).instrument(self.span.clone())));
        parts.tasks.push(tokio::spawn(dispatch_loop(self.ctx.clone(), rx).instrument(self.span.clone())));
        parts.tasks.push(tokio::spawn(response_loop(self.ctx.clone(), commands).instrument(self.span.clone())));
        drop(parts);

        let this = self.clone();
        tokio::spawn(
            async move {
                this.ctx.closed().cancelled().await;
                this.stop().await;
            }
            .instrument(self.span.clone()),
        );
        debug!(parent: &self.span, "connection started");
        Ok(())
    }

    /// Closes the connection and waits for its tasks. Safe to call more
    /// than once and from any task.
    pub async fn stop(&self) {
        let mut parts = self.parts.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.closed().cancel();
        self.ctx.dispose().await;

        for mut task in parts.tasks.drain(..) {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                debug!(parent: &self.span, "connection task did not stop in time");
                task.abort();
            }
        }
        if let Some(mut commands) = parts.commands.take() {
            commands.discard();
        }
        parts.input.take();

        self.ctx.adapter.lock().await.close().await;
        if let Some(pump) = parts.pump.take() {
            pump.finish().await;
        }
        self.ctx.notify(|c| c.connection_closed(self.ctx.id()));
        info!(parent: &self.span, "connection closed");
    }
}

/// Bytes from the connection pipe to commands.
async fn read_loop(ctx: Arc<ConnectionContext>, mut input: TransportInput, tx: mpsc::Sender<Command>) {
    let closed = ctx.closed().clone();
    let encoding_ctx = ctx.clone();
    let mut collector = CommandCollector::new(move || encoding_ctx.control_encoding());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            r = input.read(&mut buf) => r,
            _ = closed.cancelled() => break,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("control read failed: {}", e);
                break;
            }
        };
        for command in collector.collect(&buf[..n]) {
            if tx.send(command).await.is_err() {
                return;
            }
        }
    }
    if collector.has_partial_line() {
        debug!("incomplete command line dropped");
    }
}

/// Commands through the middleware chain, one at a time.
async fn dispatch_loop(ctx: Arc<ConnectionContext>, mut rx: mpsc::Receiver<Command>) {
    let closed = ctx.closed().clone();
    loop {
        let command = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = ctx.background_completed() => {
                ctx.clear_finished_background();
                continue;
            }
            c = rx.recv() => match c {
                Some(c) => c,
                None => {
                    // Input is gone for good once the commands read before
                    // it have been handled
                    debug!("control input ended");
                    closed.cancel();
                    break;
                }
            },
        };
        ctx.clear_finished_background();
        ctx.keepalive.touch();
        ctx.notify(|c| c.command_received(ctx.id(), &command));

        let cx = CommandContext::new(command, ctx.clone());
        Next::new(&ctx.services.middleware).run(&cx).await;

        tokio::select! {
            _ = ctx.server_commands.flushed() => {}
            _ = closed.cancelled() => break,
        }
    }
}

/// Executes server commands in queue order.
async fn response_loop(ctx: Arc<ConnectionContext>, mut commands: ServerCommandReceiver) {
    let closed = ctx.closed().clone();
    loop {
        let command = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            c = commands.recv() => match c {
                Some(c) => c,
                None => break,
            },
        };
        let result = execute(&ctx, command).await;
        commands.done();
        if let Err(e) = result {
            debug!("control write failed: {}", e);
            closed.cancel();
            break;
        }
    }
    commands.discard();
}
