//! 1:1 peer session negotiation over an asynchronous key-value signaling
//! channel.
//!
//! The channel only has to provide `put`/`get`/`delete` on string keys
//! (see the `signal-store` crate); everything timing-related — offer and
//! answer exchange, trickled candidate batches, bounded polling — lives
//! here. [`Session::create`] starts a session as the initiator,
//! [`Session::join`] joins one by id, and [`Session::hang_up`] tears it
//! down from any state.

pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use config::{IceConfig, IceServerConfig};
pub use controller::ConnectionController;
pub use error::SessionError;
pub use message::{CandidateBlob, SdpKind, SessionDescriptionBlob, SessionRole, SignalingMessage};
pub use session::{generate_session_id, Session, SessionState};
pub use transport::{ConnectionState, PeerTransport};
