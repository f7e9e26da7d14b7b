//! Working directory commands: `PWD`, `CWD` and `CDUP`

use async_trait::async_trait;

use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::fs::{display_path, resolve};
use crate::protocol::reply;
use crate::response::Response;

/// Quotes a path for a `257` reply; embedded quotes are doubled.
fn quoted(path: &str) -> String {
    format!("\"{}\"", path.replace('"', "\"\""))
}

pub struct Pwd;

#[async_trait]
impl CommandHandler for Pwd {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let path = display_path(&cx.connection.session.lock().path);
        let text = format!("{} {}", quoted(&path), cx.connection.t("is current directory."));
        Ok(Some(Response::new(reply::PATH_CREATED, text)))
    }
}

async fn change_dir(cx: &CommandContext, arg: &str) -> CommandResult {
    let (fs, target) = {
        let session = cx.connection.session.lock();
        (session.file_system.clone(), resolve(&session.path, arg)?)
    };
    match fs.metadata(&target).await {
        Ok(entry) if entry.is_dir || target.is_empty() => {
            cx.connection.session.lock().path = target;
            cx.reply(reply::FILE_ACTION_OK, "Directory changed.")
        }
        Ok(_) => cx.reply(reply::FILE_UNAVAILABLE, "Not a directory."),
        Err(e) => Err(e),
    }
}

pub struct Cwd;

#[async_trait]
impl CommandHandler for Cwd {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let arg = cx.argument().trim();
        if arg.is_empty() {
            return cx.reply(reply::PARAMETER_ERROR, "Syntax error in parameters or arguments.");
        }
        change_dir(cx, arg).await
    }
}

pub struct Cdup;

#[async_trait]
impl CommandHandler for Cdup {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        change_dir(cx, "..").await
    }
}
