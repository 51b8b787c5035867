use signal_store::StoreError;
use thiserror::Error;

/// Everything that can go wrong while negotiating a session.
///
/// None of these crash the process: the session surfaces them through its
/// status/error fields and, where a poll loop is involved, transitions to
/// `NegotiationFailed`. There is no automatic retry; a failed negotiation
/// requires a fresh session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Local capture is unavailable; creating or joining is disabled until
    /// the caller resolves it.
    #[error("local media unavailable: {0}")]
    MediaAccess(String),

    /// Join referenced a session id with no published offer.
    #[error("no session published under id {0}")]
    SessionNotFound(String),

    /// Malformed or out-of-order description/candidate application.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// A poll loop exhausted its bound without observing the awaited value.
    #[error("timed out waiting for {0}")]
    NegotiationTimeout(&'static str),

    /// The underlying peer transport failed.
    #[error("peer transport error: {0}")]
    Transport(String),

    /// An operation was invoked in a lifecycle state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}
