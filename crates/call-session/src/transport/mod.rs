//! Seam between the negotiation core and the peer transport.
//!
//! The controller and session layers only ever see [`PeerTransport`]; the
//! real implementation lives in [`webrtc`], tests use [`mock`].

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::SessionError;
use crate::message::{CandidateBlob, SessionDescriptionBlob};

pub mod mock;
pub mod webrtc;

/// Connection lifecycle reported by the underlying transport. Only a
/// transition to `Connected` here makes a session authoritatively
/// connected; exchanged descriptions alone never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Capability set consumed from the peer transport.
///
/// The handle is exclusively owned by one `ConnectionController`; nothing
/// else may close or mutate it. Transport-level failures after
/// establishment are observed through the state watch, not returned from
/// these calls.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptionBlob, SessionError>;

    async fn create_answer(&self) -> Result<SessionDescriptionBlob, SessionError>;

    async fn set_local_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError>;

    async fn add_remote_candidate(&self, candidate: CandidateBlob) -> Result<(), SessionError>;

    /// Stream of locally discovered candidates. Takeable exactly once;
    /// gathering starts as soon as the transport is created.
    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<CandidateBlob>>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<(), SessionError>;
}
