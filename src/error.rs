//! Command failures and their FTP reply codes

use std::io;

use crate::protocol::reply;
use crate::response::Response;

/// Errors raised while executing a command or a data transfer.
///
/// Every variant maps onto a reply code; the dispatcher turns the error into
/// a response instead of letting it reach the connection loops.
#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    #[error("{0}")]
    Validation(String),

    #[error("Connection closed; transfer aborted.")]
    Cancelled,

    #[error("{message}")]
    FileSystem { code: u16, message: String },

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FtpError {
    pub fn file_system(code: u16, message: impl Into<String>) -> Self {
        FtpError::FileSystem { code, message: message.into() }
    }

    pub fn code(&self) -> u16 {
        match self {
            FtpError::Validation(_) => reply::CANT_OPEN_DATA,
            FtpError::Cancelled => reply::TRANSFER_ABORTED,
            FtpError::FileSystem { code, .. } => *code,
            FtpError::Unsupported(_) => reply::NOT_IMPLEMENTED,
            FtpError::Other(_) => reply::PARAMETER_ERROR,
        }
    }

    pub fn to_response(&self) -> Response {
        Response::new(self.code(), self.to_string())
    }
}

impl From<io::Error> for FtpError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AlreadyExists => reply::FILE_UNAVAILABLE,
            _ => reply::LOCAL_ERROR,
        };
        FtpError::FileSystem { code, message: e.to_string() }
    }
}
