//! JSONL transfer log, one record per finished transfer

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::stats::{StatisticsCollector, TransferInfo, TransferStatus};

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub connection_id: String,
    pub user: Option<String>,
    pub command: String,
    pub path: Option<String>,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
}

/// Appends one JSON object per line; the file is reopened for every record
/// so it can be rotated underneath a running server.
pub struct TransferLog {
    path: PathBuf,
    write: parking_lot::Mutex<()>,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        Ok(Self { path, write: parking_lot::Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &TransferLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let _serialized = self.write.lock();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("append to {}", self.path.display()))
    }

    /// All records written so far.
    pub fn entries(&self) -> Result<Vec<TransferLogEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open {}", self.path.display())),
        };
        serde_json::Deserializer::from_reader(BufReader::new(file))
            .into_iter::<TransferLogEntry>()
            .collect::<Result<Vec<_>, _>>()
            .context("parse transfer log")
    }
}

impl StatisticsCollector for TransferLog {
    fn transfer_stopped(&self, transfer: &TransferInfo, status: TransferStatus, bytes: u64) {
        let entry = TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            connection_id: transfer.connection_id.clone(),
            user: transfer.user.clone(),
            command: transfer.command.clone(),
            path: transfer.path.clone(),
            status,
            bytes_transferred: bytes,
        };
        if let Err(e) = self.append(&entry) {
            warn!("transfer log write failed: {:#}", e);
        }
    }
}
