//! Statistics observers for connections, commands and transfers

use std::sync::atomic::{AtomicU64, Ordering};

use crate::command::Command;
use crate::login::Principal;

/// Everything an observer learns about one data transfer.
#[derive(Clone, Debug)]
pub struct TransferInfo {
    pub id: u64,
    pub connection_id: String,
    pub user: Option<String>,
    pub command: String,
    pub path: Option<String>,
}

/// How a transfer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransferStatus {
    Completed,
    Interrupted,
    Failed,
}

/// Observer notified by the connection engine. All methods default to no-ops.
pub trait StatisticsCollector: Send + Sync {
    fn connection_opened(&self, _connection_id: &str) {}
    fn connection_closed(&self, _connection_id: &str) {}
    fn command_received(&self, _connection_id: &str, _command: &Command) {}
    fn user_changed(&self, _connection_id: &str, _user: Option<&Principal>) {}
    fn transfer_started(&self, _transfer: &TransferInfo) {}
    fn transfer_stopped(&self, _transfer: &TransferInfo, _status: TransferStatus, _bytes: u64) {}
}

/// Server-wide counters, shared by every connection.
#[derive(Debug, Default)]
pub struct ServerStatistics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_transfers: AtomicU64,
    active_transfers: AtomicU64,
    transferred_bytes: AtomicU64,
    commands: AtomicU64,
}

/// Point-in-time copy of [`ServerStatistics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_transfers: u64,
    pub active_transfers: u64,
    pub transferred_bytes: u64,
    pub commands: u64,
}

impl ServerStatistics {
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_transfers: self.total_transfers.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            transferred_bytes: self.transferred_bytes.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl StatisticsCollector for ServerStatistics {
    fn connection_opened(&self, _connection_id: &str) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, _connection_id: &str) {
        decrement(&self.active_connections);
    }

    fn command_received(&self, _connection_id: &str, _command: &Command) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    fn transfer_started(&self, _transfer: &TransferInfo) {
        self.total_transfers.fetch_add(1, Ordering::Relaxed);
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
    }

    fn transfer_stopped(&self, _transfer: &TransferInfo, _status: TransferStatus, bytes: u64) {
        decrement(&self.active_transfers);
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> TransferInfo {
        TransferInfo {
            id: 1,
            connection_id: "FTP-test".into(),
            user: None,
            command: "RETR".into(),
            path: Some("a.txt".into()),
        }
    }

    #[test]
    fn counters_follow_notifications() {
        let stats = ServerStatistics::default();
        stats.connection_opened("a");
        stats.connection_opened("b");
        stats.connection_closed("a");
        stats.transfer_started(&transfer());
        stats.transfer_stopped(&transfer(), TransferStatus::Completed, 42);
        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_transfers, 1);
        assert_eq!(snap.active_transfers, 0);
        assert_eq!(snap.transferred_bytes, 42);
    }

    #[test]
    fn active_counts_never_underflow() {
        let stats = ServerStatistics::default();
        stats.connection_closed("x");
        assert_eq!(stats.active_connections(), 0);
    }
}
