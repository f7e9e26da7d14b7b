//! Login, logout and control channel security

use async_trait::async_trait;
use tracing::info;

use crate::context::{ControlSecurity, DataProtection};
use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::login::authenticate;
use crate::protocol::reply;
use crate::response::Response;
use crate::server_command::ServerCommand;

pub struct User;

#[async_trait]
impl CommandHandler for User {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let name = cx.argument().trim();
        if name.is_empty() {
            return cx.reply(reply::PARAMETER_ERROR, "User name required.");
        }
        cx.connection.login.lock().user(name);
        cx.reply(reply::NEED_PASSWORD, "User name okay, need password.")
    }
}

pub struct Pass;

#[async_trait]
impl CommandHandler for Pass {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let pending = ctx.login.lock().pending_user().map(str::to_string);
        let user = match pending {
            Ok(user) => user,
            Err(e) => return cx.reply(e.code, e.message),
        };

        let Some(principal) = authenticate(&ctx.services.authenticators, &user, cx.argument()).await else {
            ctx.login.lock().reject();
            info!(user = %user, "login failed");
            return cx.reply(reply::NOT_LOGGED_IN, "Not logged in.");
        };

        let file_system = ctx.services.file_systems.create(&principal)?;
        ctx.login.lock().authorize();
        info!(user = %principal, anonymous = principal.anonymous, "logged in");
        ctx.set_user(principal, file_system);
        cx.reply(reply::LOGGED_IN, "User logged in, proceed.")
    }
}

pub struct Quit;

#[async_trait]
impl CommandHandler for Quit {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let queue = &cx.connection.server_commands;
        let bye = Response::new(reply::CLOSING_CONTROL, cx.connection.t("Service closing control connection."));
        let _ = queue.send(ServerCommand::SendResponse(bye)).await;
        let _ = queue.send(ServerCommand::CloseConnection).await;
        Ok(None)
    }
}

pub struct Rein;

#[async_trait]
impl CommandHandler for Rein {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        cx.connection.reset().await;
        let banner = cx.connection.services.config.banner.clone();
        Ok(Some(Response::new(reply::READY, banner)))
    }
}

pub struct Auth;

#[async_trait]
impl CommandHandler for Auth {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let mechanism = cx.argument().trim().to_ascii_uppercase();
        if !matches!(mechanism.as_str(), "TLS" | "TLS-C" | "SSL") {
            return cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Unknown security mechanism.");
        }
        if ctx.services.tls.is_none() {
            return cx.reply(reply::NOT_IMPLEMENTED, "TLS is not configured.");
        }
        if ctx.control_security() != ControlSecurity::Plain {
            return cx.reply(reply::BAD_SEQUENCE, "TLS is already active.");
        }
        if let Err(e) = ctx.login.lock().select_mechanism(&mechanism) {
            return cx.reply(e.code, e.message);
        }

        // The reply must leave in clear text before the handshake starts,
        // and no client byte may be read by the plain adapter meanwhile
        let queue = &ctx.server_commands;
        let ready = Response::new(reply::SECURITY_EXCHANGE_OK, ctx.t("Enabling TLS connection."));
        let _ = queue.send(ServerCommand::PauseConnection).await;
        let _ = queue.send(ServerCommand::SendResponse(ready)).await;
        let _ = queue.send(ServerCommand::EnableTls).await;
        let _ = queue.send(ServerCommand::ResumeConnection).await;
        Ok(None)
    }
}

fn control_secured(cx: &CommandContext) -> bool {
    cx.connection.control_security() != ControlSecurity::Plain
}

pub struct Pbsz;

#[async_trait]
impl CommandHandler for Pbsz {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        if !control_secured(cx) {
            return cx.reply(reply::BAD_SEQUENCE, "Bad sequence of commands.");
        }
        match cx.argument().trim().parse::<u64>() {
            Ok(0) => cx.reply(reply::OK, "PBSZ=0"),
            _ => cx.reply(reply::PARAMETER_ERROR, "Protection buffer size not supported."),
        }
    }
}

pub struct Prot;

#[async_trait]
impl CommandHandler for Prot {
    fn login_required(&self) -> bool {
        false
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        if !control_secured(cx) {
            return cx.reply(reply::BAD_SEQUENCE, "Bad sequence of commands.");
        }
        let level = match cx.argument().trim().to_ascii_uppercase().as_str() {
            "C" => DataProtection::Clear,
            "P" => DataProtection::Private,
            _ => return cx.reply(reply::PROT_LEVEL_NOT_SUPPORTED, "Protection level not supported."),
        };
        cx.connection.session.lock().data_protection = level;
        cx.reply(reply::OK, "Protection level set.")
    }
}

/// `CCC`: drop back to a clear text control channel.
pub struct Ccc;

#[async_trait]
impl CommandHandler for Ccc {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        if ctx.control_security() != ControlSecurity::Explicit || ctx.background_running() {
            return cx.reply(reply::BAD_SEQUENCE, "Bad sequence of commands.");
        }
        let cleared = Response::new(reply::OK, ctx.t("Control connection cleared."));
        if ctx.server_commands.send(ServerCommand::SendResponse(cleared)).await.is_err() {
            return Ok(None);
        }
        // The reply is the last encrypted message
        ctx.server_commands.flushed().await;
        if let Err(e) = ctx.close_control_tls().await {
            info!("CCC failed: {:#}", e);
            return cx.reply(reply::SERVICE_NOT_AVAILABLE, "Control connection could not be cleared.");
        }
        Ok(None)
    }
}
