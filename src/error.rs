use thiserror::Error;

/// The transport could not be opened. Retried with backoff; only surfaced
/// after several consecutive failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection attempt timed out")]
    Timeout,

    #[error("no relay accepted the connection")]
    NoRelays,

    #[error("transport refused connection: {0}")]
    Refused(String),
}

/// A single outbound message failed. Surfaced as that message's `Failed`
/// delivery state and nothing more.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("no acknowledgment before the timeout")]
    AckTimeout,

    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Fetching missed messages after a reconnect failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resync failed: {0}")]
pub struct DesyncError(pub String);

/// Failures of the session handle itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("session is closed")]
    Closed,

    #[error("no failed message with that nonce")]
    NotResendable,
}
