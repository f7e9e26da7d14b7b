//! Renaming: `RNFR` names the source, `RNTO` completes the move

use async_trait::async_trait;

use crate::context::Extension;
use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::fs::resolve;
use crate::protocol::reply;

/// Source accepted by `RNFR`, waiting for its `RNTO`. Dropped on `REIN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameFrom(pub Vec<String>);

impl Extension for RenameFrom {}

pub struct Rnfr;

#[async_trait]
impl CommandHandler for Rnfr {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let arg = cx.argument().trim();
        if arg.is_empty() {
            return cx.reply(reply::PARAMETER_ERROR, "File name required.");
        }
        let (fs, source) = {
            let session = ctx.session.lock();
            (session.file_system.clone(), resolve(&session.path, arg)?)
        };
        fs.metadata(&source).await?;
        ctx.extensions.insert(RenameFrom(source));
        cx.reply(reply::PENDING_FURTHER_INFO, "File exists, ready for destination name.")
    }
}

pub struct Rnto;

#[async_trait]
impl CommandHandler for Rnto {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let Some(RenameFrom(source)) = ctx.extensions.take::<RenameFrom>() else {
            return cx.reply(reply::BAD_SEQUENCE, "RNFR required first.");
        };
        let arg = cx.argument().trim();
        if arg.is_empty() {
            return cx.reply(reply::PARAMETER_ERROR, "File name required.");
        }
        let (fs, target) = {
            let session = ctx.session.lock();
            (session.file_system.clone(), resolve(&session.path, arg)?)
        };
        fs.rename(&source, &target).await?;
        cx.reply(reply::FILE_ACTION_OK, "Rename successful.")
    }
}
