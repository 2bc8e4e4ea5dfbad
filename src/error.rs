use crate::{dialog::DialogId, transaction::key::TransactionKey};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed message: {0}")]
    ParseError(String),

    #[error("transaction timeout: {0}")]
    TimeoutError(TransactionKey),

    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("invalid state: {0}")]
    InvalidStateError(String),

    #[error("peer rejected request: {0} {1}")]
    PeerError(u16, String),

    #[error("request canceled")]
    CanceledError,

    #[error("transaction error: {0}: {1}")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0}: {1}")]
    DialogError(String, DialogId),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("format error: {0}")]
    FormatError(#[from] std::fmt::Error),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
