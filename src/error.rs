use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Server error {0}")]
    Server(ServerError),

    #[error("Connection busy: previous query was not drained")]
    ConnectionBusy,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl Error {
    /// SQLSTATE code when the server rejected the request.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(&err.code),
            _ => None,
        }
    }
}

/// Fields of an ErrorResponse (or NoticeResponse) message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "; detail: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; hint: {}", hint)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
