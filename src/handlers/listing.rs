//! Directory listings: `LIST`, `NLST`, `MLSD` over a data connection and
//! `MLST` on the control connection

use async_trait::async_trait;
use chrono::{Duration, Utc};
use encoding_rs::Encoding;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::context::{ConnectionContext, Extension};
use crate::data::{start_transfer, DataConnection, DataTransfer};
use crate::dispatch::{CommandContext, CommandHandler, CommandResult};
use crate::error::FtpError;
use crate::fs::{display_path, resolve, FileEntry};
use crate::protocol::{reply, CRLF};
use crate::response::Response;

/// Facts this server can report in `MLST`/`MLSD` lines.
pub const KNOWN_FACTS: [&str; 3] = ["type", "size", "modify"];

/// Facts selected with `OPTS MLST`. Dropped on `REIN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MlstFacts(pub Vec<String>);

impl Extension for MlstFacts {}

pub(super) fn active_facts(ctx: &ConnectionContext) -> Vec<String> {
    ctx.extensions
        .with::<MlstFacts, _>(|f| f.0.clone())
        .unwrap_or_else(|| KNOWN_FACTS.iter().map(|f| f.to_string()).collect())
}

/// `FEAT` form: every known fact, active ones starred.
pub(super) fn feat_facts(active: &[String]) -> String {
    KNOWN_FACTS
        .iter()
        .map(|f| if active.iter().any(|a| a == f) { format!("{f}*;") } else { format!("{f};") })
        .collect()
}

/// `ls -l` style line.
pub(super) fn unix_line(entry: &FileEntry) -> String {
    let perms = if entry.is_dir { "drwxr-xr-x" } else { "-rw-r--r--" };
    let date = match entry.modified {
        Some(t) if Utc::now() - t < Duration::days(180) => t.format("%b %e %H:%M").to_string(),
        Some(t) => t.format("%b %e  %Y").to_string(),
        None => "Jan  1  1970".to_string(),
    };
    format!("{} 1 ftp ftp {:>12} {} {}", perms, entry.size, date, entry.name)
}

fn mlst_line(entry: &FileEntry, facts: &[String], name: &str) -> String {
    let mut line = String::new();
    for fact in facts {
        match fact.as_str() {
            "type" => line.push_str(if entry.is_dir { "type=dir;" } else { "type=file;" }),
            "size" => line.push_str(&format!("size={};", entry.size)),
            "modify" => {
                if let Some(t) = entry.modified {
                    line.push_str(&format!("modify={};", t.format("%Y%m%d%H%M%S")));
                }
            }
            _ => {}
        }
    }
    format!("{} {}", line, name)
}

/// Sends prepared lines over the data connection.
struct ListingTransfer {
    lines: Vec<String>,
    encoding: &'static Encoding,
    complete: Response,
}

#[async_trait]
impl DataTransfer for ListingTransfer {
    async fn transfer(
        self: Box<Self>,
        connection: &mut DataConnection,
        cancel: &CancellationToken,
    ) -> Result<Response, FtpError> {
        for line in &self.lines {
            if cancel.is_cancelled() {
                return Err(FtpError::Cancelled);
            }
            let (bytes, _, _) = self.encoding.encode(line);
            let written = async {
                connection.write_all(&bytes).await?;
                connection.write_all(CRLF.as_bytes()).await
            };
            if written.await.is_err() {
                return Err(FtpError::Cancelled);
            }
        }
        connection.flush().await.map_err(|_| FtpError::Cancelled)?;
        Ok(self.complete)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Format {
    Long,
    Names,
    Facts,
}

/// Drops `ls` style flags such as `-la` some clients send.
fn path_argument(arg: &str) -> &str {
    let mut rest = arg.trim();
    while rest.starts_with('-') {
        rest = rest.split_once(' ').map(|(_, r)| r.trim_start()).unwrap_or("");
    }
    rest
}

async fn send_listing(cx: &CommandContext, format: Format) -> CommandResult {
    let ctx = &cx.connection;
    let arg = path_argument(cx.argument());
    let (fs, target, encoding) = {
        let session = ctx.session.lock();
        let encoding = match format {
            Format::Names => session.nlst_encoding.unwrap_or(session.encoding),
            _ => session.encoding,
        };
        (session.file_system.clone(), resolve(&session.path, arg)?, encoding)
    };

    let entry = fs.metadata(&target).await?;
    let single_file = !entry.is_dir;
    if single_file && format == Format::Facts {
        return cx.reply(reply::FILE_UNAVAILABLE, "Not a directory.");
    }
    let entries = if single_file { vec![entry] } else { fs.list(&target).await? };

    let facts = active_facts(ctx);
    let lines = entries
        .iter()
        .map(|e| match format {
            Format::Long => unix_line(e),
            Format::Names if single_file => arg.to_string(),
            Format::Names => e.name.clone(),
            Format::Facts => mlst_line(e, &facts, &e.name),
        })
        .collect();

    let transfer = ListingTransfer {
        lines,
        encoding,
        complete: Response::new(reply::CLOSING_DATA, ctx.t("Transfer complete.")),
    };
    start_transfer(cx, Some(display_path(&target)), Box::new(transfer)).await
}

pub struct List;

#[async_trait]
impl CommandHandler for List {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        send_listing(cx, Format::Long).await
    }
}

pub struct Nlst;

#[async_trait]
impl CommandHandler for Nlst {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        send_listing(cx, Format::Names).await
    }
}

pub struct Mlsd;

#[async_trait]
impl CommandHandler for Mlsd {
    fn abortable(&self) -> bool {
        true
    }

    async fn process(&self, cx: &CommandContext) -> CommandResult {
        send_listing(cx, Format::Facts).await
    }
}

pub struct Mlst;

#[async_trait]
impl CommandHandler for Mlst {
    async fn process(&self, cx: &CommandContext) -> CommandResult {
        let ctx = &cx.connection;
        let (fs, target) = {
            let session = ctx.session.lock();
            (session.file_system.clone(), resolve(&session.path, cx.argument().trim())?)
        };
        let entry = fs.metadata(&target).await?;
        let path = display_path(&target);
        let lines = vec![
            format!("Listing {}", path),
            mlst_line(&entry, &active_facts(ctx), &path),
            ctx.t("End"),
        ];
        Ok(Some(Response::multiline(reply::FILE_ACTION_OK, lines)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file(name: &str, size: u64) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            is_dir: false,
            size,
            modified: Some(Utc.with_ymd_and_hms(2020, 3, 4, 5, 6, 7).unwrap()),
        }
    }

    #[test]
    fn flags_are_stripped() {
        assert_eq!(path_argument("-la /pub"), "/pub");
        assert_eq!(path_argument("-l"), "");
        assert_eq!(path_argument("docs"), "docs");
    }

    #[test]
    fn unix_line_for_old_file() {
        assert_eq!(unix_line(&file("a.txt", 5)), "-rw-r--r-- 1 ftp ftp            5 Mar  4  2020 a.txt");
    }

    #[test]
    fn fact_lines_follow_selection() {
        let all: Vec<String> = KNOWN_FACTS.iter().map(|f| f.to_string()).collect();
        assert_eq!(mlst_line(&file("a", 5), &all, "a"), "type=file;size=5;modify=20200304050607; a");
        assert_eq!(mlst_line(&file("a", 5), &["size".to_string()], "a"), "size=5; a");
        assert_eq!(feat_facts(&["size".to_string()]), "type;size*;modify;");
    }
}
