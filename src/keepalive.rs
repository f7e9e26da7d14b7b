//! Connection liveness based on command and transfer activity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks the last time a connection did something useful.
///
/// A running data transfer keeps the connection alive no matter how long
/// the control channel stays quiet.
#[derive(Debug)]
pub struct ActivityKeepAlive {
    timeout: Option<Duration>,
    last_activity: Mutex<Instant>,
    active_transfers: AtomicUsize,
}

impl ActivityKeepAlive {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout, last_activity: Mutex::new(Instant::now()), active_transfers: AtomicUsize::new(0) }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn transfer_started(&self) {
        self.active_transfers.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn transfer_stopped(&self) {
        let _ = self
            .active_transfers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        self.touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_alive(&self) -> bool {
        let Some(timeout) = self.timeout else {
            return true;
        };
        if self.active_transfers.load(Ordering::SeqCst) > 0 {
            return true;
        }
        self.idle_for() <= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_timeout_always_alive() {
        let k = ActivityKeepAlive::new(None);
        assert!(k.is_alive());
    }

    #[test]
    fn idle_connection_expires() {
        let k = ActivityKeepAlive::new(Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!k.is_alive());
        k.touch();
        assert!(k.is_alive());
    }

    #[test]
    fn running_transfer_keeps_connection_alive() {
        let k = ActivityKeepAlive::new(Some(Duration::from_millis(10)));
        k.transfer_started();
        std::thread::sleep(Duration::from_millis(30));
        assert!(k.is_alive());
        k.transfer_stopped();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!k.is_alive());
    }
}
