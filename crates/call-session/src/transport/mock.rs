//! Scripted transport for exercising the negotiation core without a real
//! peer connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{ConnectionState, PeerTransport};
use crate::error::SessionError;
use crate::message::{CandidateBlob, SdpKind, SessionDescriptionBlob};

pub struct MockPeerTransport {
    calls: AtomicUsize,
    closes: AtomicUsize,
    local_description: Mutex<Option<SessionDescriptionBlob>>,
    remote_description: Mutex<Option<SessionDescriptionBlob>>,
    applied_candidates: Mutex<Vec<CandidateBlob>>,
    candidate_tx: mpsc::UnboundedSender<CandidateBlob>,
    candidate_rx: Mutex<Option<mpsc::UnboundedReceiver<CandidateBlob>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MockPeerTransport {
    pub fn new() -> Arc<Self> {
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            candidate_tx,
            candidate_rx: Mutex::new(Some(candidate_rx)),
            state_tx: Arc::new(state_tx),
            state_rx,
        })
    }

    /// Simulate the transport discovering a local candidate.
    pub fn discover_local_candidate(&self, candidate: CandidateBlob) {
        let _ = self.candidate_tx.send(candidate);
    }

    /// Drive the reported connection state from a test.
    pub fn set_connection_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescriptionBlob> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescriptionBlob> {
        self.remote_description.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<CandidateBlob> {
        self.applied_candidates.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescriptionBlob, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescriptionBlob {
            kind: SdpKind::Offer,
            sdp: "v=0 mock offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescriptionBlob, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescriptionBlob {
            kind: SdpKind::Answer,
            sdp: "v=0 mock answer".into(),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if description.sdp.is_empty() {
            return Err(SessionError::Negotiation(
                "empty session description".into(),
            ));
        }
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateBlob) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if candidate.candidate.is_empty() {
            return Err(SessionError::Negotiation("empty candidate".into()));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<CandidateBlob>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.candidate_rx.lock().take()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState::Closed);
        Ok(())
    }
}
