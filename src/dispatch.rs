//! Command dispatch: middleware chains, login gate and the background slot
//!
//! Two chains run per command. Connection middleware wraps the whole
//! dispatch step (handler lookup, login check, background scheduling).
//! Command middleware wraps only the handler call, so it also runs inside
//! background commands.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::command::Command;
use crate::context::{BackgroundSlot, ConnectionContext};
use crate::error::FtpError;
use crate::protocol::reply;
use crate::response::Response;

/// `Ok(None)`: the handler queued its replies itself.
pub type CommandResult = Result<Option<Response>, FtpError>;

/// One command on its way through the pipeline.
#[derive(Clone)]
pub struct CommandContext {
    pub command: Command,
    pub connection: Arc<ConnectionContext>,
    /// Cancelled by `ABOR` for background commands, by teardown otherwise.
    pub cancel: CancellationToken,
    /// Set for commands running in the background slot.
    pub slot: Option<BackgroundSlot>,
}

impl CommandContext {
    pub fn new(command: Command, connection: Arc<ConnectionContext>) -> Self {
        let cancel = connection.closed().clone();
        Self { command, connection, cancel, slot: None }
    }

    /// Frees the background slot ahead of the final reply, so a client that
    /// sends its next command right after it isn't refused.
    pub fn release_slot(&self) {
        if let Some(slot) = &self.slot {
            slot.release();
        }
    }

    pub fn argument(&self) -> &str {
        self.command.argument()
    }

    /// Reply with translated text.
    pub fn reply(&self, code: u16, message: &str) -> CommandResult {
        Ok(Some(Response::new(code, self.connection.t(message))))
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn login_required(&self) -> bool {
        true
    }

    /// Abortable commands run in the background slot.
    fn abortable(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, cx: &CommandContext, next: Next<'_>);
}

#[async_trait]
pub trait CommandMiddleware: Send + Sync {
    async fn invoke(&self, cx: &CommandContext, next: CommandNext<'_>) -> CommandResult;
}

/// Rest of the connection chain, ending in [`dispatch`].
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    pub async fn run(self, cx: &CommandContext) {
        match self.chain.split_first() {
            Some((head, rest)) => head.invoke(cx, Next { chain: rest }).await,
            None => dispatch(cx).await,
        }
    }
}

/// Rest of the command chain, ending in the handler.
pub struct CommandNext<'a> {
    chain: &'a [Arc<dyn CommandMiddleware>],
    handler: &'a dyn CommandHandler,
}

impl<'a> CommandNext<'a> {
    pub fn new(chain: &'a [Arc<dyn CommandMiddleware>], handler: &'a dyn CommandHandler) -> Self {
        Self { chain, handler }
    }

    pub async fn run(self, cx: &CommandContext) -> CommandResult {
        match self.chain.split_first() {
            Some((head, rest)) => head.invoke(cx, CommandNext { chain: rest, handler: self.handler }).await,
            None => self.handler.process(cx).await,
        }
    }
}

async fn execute(cx: &CommandContext, handler: &dyn CommandHandler) -> CommandResult {
    CommandNext::new(&cx.connection.services.command_middleware, handler).run(cx).await
}

async fn send_result(cx: &CommandContext, result: CommandResult) {
    let response = match result {
        Ok(Some(response)) => response,
        Ok(None) => return,
        Err(e) => {
            debug!(command = %cx.command, "command failed: {}", e);
            e.to_response()
        }
    };
    let _ = cx.connection.server_commands.respond(response).await;
}

/// Terminal step of the connection chain.
pub async fn dispatch(cx: &CommandContext) {
    let ctx = &cx.connection;
    let Some(handler) = ctx.services.handlers.get(cx.command.verb()) else {
        let response = Response::new(reply::SYNTAX_ERROR, ctx.t("Syntax error, command unrecognized."));
        let _ = ctx.server_commands.respond(response).await;
        return;
    };

    let authorized = ctx.login.lock().is_authorized();
    if handler.login_required() && !authorized {
        let response = Response::new(reply::NOT_LOGGED_IN, ctx.t("Not logged in."));
        let _ = ctx.server_commands.respond(response).await;
        return;
    }

    if !handler.abortable() {
        let result = execute(cx, handler.as_ref()).await;
        send_result(cx, result).await;
        return;
    }

    let cancel = ctx.closed().child_token();
    let command = cx.command.clone();
    let connection = ctx.clone();
    let started = ctx.start_background(cx.command.verb(), cancel.clone(), move |slot| {
        let background = CommandContext { command, connection, cancel, slot: Some(slot) };
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                let result = execute(&background, handler.as_ref()).await;
                background.release_slot();
                send_result(&background, result).await;
                background.connection.background_finished();
            }
            .instrument(span),
        )
    });
    if !started {
        let response = Response::new(reply::BAD_SEQUENCE, ctx.t("Parallel commands aren't allowed."));
        let _ = ctx.server_commands.respond(response).await;
    }
}

/// Runs each command inside its own tracing span.
pub struct CommandSpan;

#[async_trait]
impl Middleware for CommandSpan {
    async fn invoke(&self, cx: &CommandContext, next: Next<'_>) {
        let span = tracing::debug_span!("command", verb = %cx.command.verb());
        next.run(cx).instrument(span).await
    }
}

/// Logs each handler's reply code and run time.
pub struct ElapsedLogger;

#[async_trait]
impl CommandMiddleware for ElapsedLogger {
    async fn invoke(&self, cx: &CommandContext, next: CommandNext<'_>) -> CommandResult {
        let started = Instant::now();
        let result = next.run(cx).await;
        let code = match &result {
            Ok(Some(r)) => Some(r.code),
            Ok(None) => None,
            Err(e) => Some(e.code()),
        };
        debug!(command = %cx.command, code = ?code, elapsed_ms = started.elapsed().as_millis() as u64, "handled");
        result
    }
}

pub fn default_middleware() -> Vec<Arc<dyn Middleware>> {
    vec![Arc::new(CommandSpan)]
}

pub fn default_command_middleware() -> Vec<Arc<dyn CommandMiddleware>> {
    vec![Arc::new(ElapsedLogger)]
}
