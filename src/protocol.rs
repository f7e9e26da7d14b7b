//! Shared protocol constants for the FTP control and data channels

// Line terminator on the control connection
pub const CRLF: &str = "\r\n";

// Maximum accumulated command line (64KB) - prevents DoS via memory exhaustion
// Longer lines are truncated and still dispatched so the client gets a reply
pub const MAX_COMMAND_LINE: usize = 64 * 1024;

// Capacity of the inbound command queue and the outbound server command queue
pub const COMMAND_QUEUE_CAPACITY: usize = 5;
pub const SERVER_COMMAND_QUEUE_CAPACITY: usize = 5;

// Capacity of the accept channel all listeners fan into
pub const ACCEPT_QUEUE_CAPACITY: usize = 5;

// Size of the in-process pipe buffers (socket pipe and connection pipe)
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

// Chunk size used when streaming files over a data connection
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

// Reply codes used by the engine itself. Handlers may use any other code.
pub mod reply {
    pub const OPENING_DATA: u16 = 150;
    pub const OK: u16 = 200;
    pub const SYSTEM_STATUS: u16 = 211;
    pub const FILE_STATUS: u16 = 213;
    pub const SYSTEM_TYPE: u16 = 215;
    pub const READY: u16 = 220;
    pub const CLOSING_CONTROL: u16 = 221;
    pub const NO_TRANSFER_IN_PROGRESS: u16 = 225;
    pub const CLOSING_DATA: u16 = 226;
    pub const PASSIVE_MODE: u16 = 227;
    pub const EXTENDED_PASSIVE_MODE: u16 = 229;
    pub const LOGGED_IN: u16 = 230;
    pub const SECURITY_EXCHANGE_OK: u16 = 234;
    /// Also the "keep the data connection open" sentinel, see [`crate::data::run_transfer`].
    pub const FILE_ACTION_OK: u16 = 250;
    pub const PATH_CREATED: u16 = 257;
    pub const NEED_PASSWORD: u16 = 331;
    pub const PENDING_FURTHER_INFO: u16 = 350;
    pub const SERVICE_NOT_AVAILABLE: u16 = 421;
    pub const CANT_OPEN_DATA: u16 = 425;
    pub const TRANSFER_ABORTED: u16 = 426;
    pub const LOCAL_ERROR: u16 = 451;
    pub const SYNTAX_ERROR: u16 = 500;
    pub const PARAMETER_ERROR: u16 = 501;
    pub const NOT_IMPLEMENTED: u16 = 502;
    pub const BAD_SEQUENCE: u16 = 503;
    pub const PARAMETER_NOT_IMPLEMENTED: u16 = 504;
    pub const NOT_LOGGED_IN: u16 = 530;
    pub const PROT_LEVEL_NOT_SUPPORTED: u16 = 536;
    pub const FILE_UNAVAILABLE: u16 = 550;
}

// Centralized timeout constants for consistent behavior across the connection tasks
pub mod timeouts {
    use std::time::Duration;

    // Establishing an active or passive data connection
    pub const DATA_CONNECTION_SECS: u64 = 10;

    // TLS handshake on the control or a data connection
    pub const TLS_HANDSHAKE_SECS: u64 = 10;

    // Default interval between inactivity sweeps
    pub const INACTIVITY_CHECK_SECS: u64 = 10;

    pub fn data_connection() -> Duration {
        Duration::from_secs(DATA_CONNECTION_SECS)
    }

    pub fn tls_handshake() -> Duration {
        Duration::from_secs(TLS_HANDSHAKE_SECS)
    }
}
