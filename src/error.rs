use thiserror::Error;

use crate::types::CipherSuite;

/// Errors surfaced through the public [`Engine`](crate::Engine) API.
///
/// Protocol failures are not reported here. They end the connection with an
/// alert and show up as [`Output::Failed`](crate::Output::Failed).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection is not established")]
    NotConnected,

    #[error("Resource busy, retry later")]
    Busy,

    #[error("Buffer full")]
    BufferFull,

    #[error("Transmit confirmation queue full")]
    TxConfirmationFull,

    #[error("Invalid connection handle")]
    InvalidHandle,

    #[error("No free connection slot")]
    NoFreeSlot,

    #[error("Unsupported cipher suite {0:?}")]
    UnsupportedCipherSuite(CipherSuite),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failure of a crypto service job.
///
/// A negative verification result is not an error, see
/// [`JobOutput::Rejected`](crate::JobOutput::Rejected).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Unknown job")]
    UnknownJob,

    #[error("Unknown key reference {0}")]
    UnknownKey(u32),

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("No key exchange in progress")]
    NoKeyExchange,

    #[error("Injected failure")]
    Injected,

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Failure reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport refused data")]
    Refused,

    #[error("Transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}
