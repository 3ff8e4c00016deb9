use std::time::Duration;

use thiserror::Error;

use crate::protocol::Exception;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{context}: unexpected packet: {packet}")]
    UnexpectedPacket { context: &'static str, packet: u64 },

    #[error("Column has empty name")]
    EmptyColumnName,

    #[error("Column={0} has empty type")]
    EmptyColumnType(String),

    #[error("Unsupported column type: {0}")]
    UnsupportedColumnType(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Exception chain is deeper than {0} levels")]
    ExceptionTooDeep(usize),

    // Server-side failure; the stream is still in sync.
    #[error(transparent)]
    Server(#[from] Exception),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("Connection pool is closed")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the connection that produced this error must be discarded
    /// instead of going back to the pool.
    pub fn is_bad_conn(&self) -> bool {
        !matches!(
            self,
            Error::Server(_) | Error::Config(_) | Error::InvalidBlock(_)
        )
    }

    /// The decoded server exception, if this error came from the server.
    pub fn server_exception(&self) -> Option<&Exception> {
        match self {
            Error::Server(exc) => Some(exc),
            _ => None,
        }
    }

    pub(crate) fn unexpected(context: &'static str, packet: u64) -> Self {
        Error::UnexpectedPacket { context, packet }
    }
}
