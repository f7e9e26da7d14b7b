//! Data channel negotiation and file transfers

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::data::{
    bind_passive, canonical_ip, epsv_reply, parse_eprt, parse_port, pasv_reply, start_transfer, DataChannel,
    DataConnection, DataTransfer,
};
use crate::context::Extension;
use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::error::FtpError;
use crate::fs::{display_path, resolve, FileReader, FileSystem, FileWriter};
use crate::protocol::{reply, TRANSFER_CHUNK_SIZE};
use crate::response::Response;

pub struct Pasv;

#[async_trait]
impl CommandHandler for Pasv {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let config = &ctx.services.config;
        let local = canonical_ip(ctx.local_addr().ip());
        let announced = match (config.pasv_address, local) {
            (Some(IpAddr::V4(ip)), _) | (None, IpAddr::V4(ip)) => ip,
            _ => return cx.reply(reply::PARAMETER_ERROR, "PASV is IPv4 only, use EPSV."),
        };
        let listener = match bind_passive(local, config.pasv_port_range()) {
            Ok(l) => l,
            Err(e) => {
                debug!("passive bind failed: {}", e);
                return cx.reply(reply::CANT_OPEN_DATA, "Can't open passive connection.");
            }
        };
        let port = listener.local_addr()?.port();
        ctx.set_data_channel(DataChannel::Passive(listener));
        Ok(Some(Response::new(reply::PASSIVE_MODE, pasv_reply(announced, port))))
    }
}

pub struct Epsv;

#[async_trait]
impl CommandHandler for Epsv {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        match cx.argument().trim().to_ascii_uppercase().as_str() {
            "" | "1" | "2" => {}
            "ALL" => return cx.reply(reply::OK, "EPSV ALL command successful."),
            _ => return cx.reply(reply::PARAMETER_NOT_IMPLEMENTED, "Network protocol not supported."),
        }
        let local = canonical_ip(ctx.local_addr().ip());
        let listener = match bind_passive(local, ctx.services.config.pasv_port_range()) {
            Ok(l) => l,
            Err(e) => {
                debug!("passive bind failed: {}", e);
                return cx.reply(reply::CANT_OPEN_DATA, "Can't open passive connection.");
            }
        };
        let port = listener.local_addr()?.port();
        ctx.set_data_channel(DataChannel::Passive(listener));
        Ok(Some(Response::new(reply::EXTENDED_PASSIVE_MODE, epsv_reply(port))))
    }
}

/// Active mode targets must be the client itself.
fn set_active(cx: &CommandContext, target: Option<SocketAddr>) -> CommandResult {
    let ctx = &cx.connection;
    let Some(target) = target.filter(|t| t.port() != 0) else {
        return cx.reply(reply::PARAMETER_ERROR, "Syntax error in parameters or arguments.");
    };
    if canonical_ip(target.ip()) != canonical_ip(ctx.remote_addr().ip()) {
        return cx.reply(reply::PARAMETER_ERROR, "Data connection must go to the client address.");
    }
    ctx.set_data_channel(DataChannel::Active(target));
    cx.reply(reply::OK, "Command okay.")
}

pub struct Port;

#[async_trait]
impl CommandHandler for Port {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        set_active(cx, parse_port(cx.argument()))
    }
}

pub struct Eprt;

#[async_trait]
impl CommandHandler for Eprt {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        set_active(cx, parse_eprt(cx.argument()))
    }
}

/// File to client.
struct SendFile {
    reader: FileReader,
    complete: Response,
}

#[async_trait]
impl DataTransfer for SendFile {
    async fn transfer(
        self: Box<Self>,
        connection: &mut DataConnection,
        cancel: &CancellationToken,
    ) -> Result<Response, FtpError> {
        let Self { mut reader, complete } = *self;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(FtpError::Cancelled);
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            connection.write_all(&buf[..n]).await.map_err(|_| FtpError::Cancelled)?;
        }
        connection.flush().await.map_err(|_| FtpError::Cancelled)?;
        Ok(complete)
    }
}

/// Client to file.
struct ReceiveFile {
    writer: FileWriter,
    complete: Response,
}

#[async_trait]
impl DataTransfer for ReceiveFile {
    async fn transfer(
        self: Box<Self>,
        connection: &mut DataConnection,
        cancel: &CancellationToken,
    ) -> Result<Response, FtpError> {
        let Self { mut writer, complete } = *self;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(FtpError::Cancelled);
            }
            let n = connection.read(&mut buf).await.map_err(|_| FtpError::Cancelled)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
        }
        writer.shutdown().await?;
        Ok(complete)
    }
}

fn target_path(cx: &CommandContext) -> Result<(Arc<dyn FileSystem>, Vec<String>), FtpError> {
    let arg = cx.argument().trim();
    if arg.is_empty() {
        return Err(FtpError::file_system(reply::PARAMETER_ERROR, cx.connection.t("File name required.")));
    }
    let session = cx.connection.session.lock();
    Ok((session.file_system.clone(), resolve(&session.path, arg)?))
}

/// Offset set by `REST`, used up by the next `RETR`, `STOR` or `APPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartOffset(pub u64);

impl Extension for RestartOffset {}

fn take_restart_offset(cx: &CommandContext) -> u64 {
    cx.connection.extensions.take::<RestartOffset>().map_or(0, |r| r.0)
}

pub struct Rest;

#[async_trait]
impl CommandHandler for Rest {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let Ok(offset) = cx.argument().trim().parse::<u64>() else {
            return cx.reply(reply::PARAMETER_ERROR, "Syntax error in parameters or arguments.");
        };
        cx.connection.extensions.insert(RestartOffset(offset));
        let text = format!("{} {}.", cx.connection.t("Restarting at"), offset);
        Ok(Some(Response::new(reply::PENDING_FURTHER_INFO, text)))
    }
}

pub struct Retr;

#[async_trait]
impl CommandHandler for Retr {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let offset = take_restart_offset(cx);
        let (fs, target) = target_path(cx)?;
        let reader = fs.open_read(&target, offset).await?;
        let complete = Response::new(reply::CLOSING_DATA, cx.connection.t("Transfer complete."));
        let transfer = SendFile { reader, complete };
        start_transfer(cx, Some(display_path(&target)), Box::new(transfer)).await
    }
}

pub struct Stor;

#[async_trait]
impl CommandHandler for Stor {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let offset = take_restart_offset(cx);
        let (fs, target) = target_path(cx)?;
        let writer = fs.create(&target, offset).await?;
        let complete = Response::new(reply::CLOSING_DATA, cx.connection.t("Transfer complete."));
        let transfer = ReceiveFile { writer, complete };
        start_transfer(cx, Some(display_path(&target)), Box::new(transfer)).await
    }
}

pub struct Appe;

#[async_trait]
impl CommandHandler for Appe {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        // Appending always continues at the end
        take_restart_offset(cx);
        let (fs, target) = target_path(cx)?;
        let writer = fs.append(&target).await?;
        let complete = Response::new(reply::CLOSING_DATA, cx.connection.t("Transfer complete."));
        let transfer = ReceiveFile { writer, complete };
        start_transfer(cx, Some(display_path(&target)), Box::new(transfer)).await
    }
}

pub struct Abor;

#[async_trait]
impl CommandHandler for Abor {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        if cx.connection.abort_background().await {
            cx.reply(reply::CLOSING_DATA, "ABOR command successful.")
        } else {
            cx.reply(reply::NO_TRANSFER_IN_PROGRESS, "No transfer in progress.")
        }
    }
}
