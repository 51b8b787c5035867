//! Connection controller: owns one peer transport and mediates every
//! description and candidate application on it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::message::{CandidateBlob, SdpKind, SessionDescriptionBlob};
use crate::transport::{ConnectionState, PeerTransport};

#[derive(Default)]
struct NegotiationState {
    local_set: bool,
    remote_set: bool,
    /// Candidates received before the remote description; applied in the
    /// order produced once it lands.
    pending_inbound: Vec<CandidateBlob>,
    /// Already-applied candidates, so replayed polling is harmless.
    applied: HashSet<CandidateBlob>,
    closed: bool,
}

/// Exactly one controller exists per session per local role. All
/// description/candidate mutations serialize behind one async mutex so no
/// two of them interleave, whatever order the runtime fires callbacks in.
pub struct ConnectionController {
    transport: Arc<dyn PeerTransport>,
    state: AsyncMutex<NegotiationState>,
    outbound: Mutex<Vec<CandidateBlob>>,
    outbound_changed: Notify,
    gather_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionController {
    /// Wrap an already-created transport (its candidate gathering is
    /// presumed running) and start draining discovered candidates into the
    /// outbound list.
    pub fn new(transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let controller = Arc::new(Self {
            transport,
            state: AsyncMutex::new(NegotiationState::default()),
            outbound: Mutex::new(Vec::new()),
            outbound_changed: Notify::new(),
            gather_task: Mutex::new(None),
        });

        if let Some(mut candidates) = controller.transport.take_local_candidates() {
            let weak = Arc::downgrade(&controller);
            let handle = tokio::spawn(async move {
                while let Some(candidate) = candidates.recv().await {
                    let Some(controller) = weak.upgrade() else { break };
                    trace!(
                        target: "negotiation",
                        candidate = %candidate.candidate,
                        "local candidate discovered"
                    );
                    controller.outbound.lock().push(candidate);
                    controller.outbound_changed.notify_one();
                }
            });
            *controller.gather_task.lock() = Some(handle);
        }

        controller
    }

    /// Generate the offer and apply it as the local description. Valid
    /// only before any local description is set.
    pub async fn produce_offer(&self) -> Result<SessionDescriptionBlob, SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::InvalidState("controller closed"));
        }
        if state.local_set {
            return Err(SessionError::InvalidState("local description already set"));
        }
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        state.local_set = true;
        Ok(offer)
    }

    /// Joiner path: apply the remote offer, generate the answer, apply it
    /// locally. Buffered inbound candidates are flushed once the remote
    /// description is in place.
    pub async fn produce_answer(
        &self,
        remote_offer: SessionDescriptionBlob,
    ) -> Result<SessionDescriptionBlob, SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::InvalidState("controller closed"));
        }
        if state.remote_set {
            return Err(SessionError::InvalidState("remote description already set"));
        }
        if state.local_set {
            return Err(SessionError::InvalidState("local description already set"));
        }
        if remote_offer.kind != SdpKind::Offer {
            return Err(SessionError::Negotiation(
                "expected an offer description".into(),
            ));
        }
        self.transport.set_remote_description(remote_offer).await?;
        state.remote_set = true;
        self.flush_pending(&mut state).await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        state.local_set = true;
        Ok(answer)
    }

    /// Initiator path: apply the remote answer. Valid only with a local
    /// offer in place and no remote description yet.
    pub async fn apply_remote_answer(
        &self,
        answer: SessionDescriptionBlob,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::InvalidState("controller closed"));
        }
        if !state.local_set {
            return Err(SessionError::InvalidState("no local offer to answer"));
        }
        if state.remote_set {
            return Err(SessionError::InvalidState("remote description already set"));
        }
        if answer.kind != SdpKind::Answer {
            return Err(SessionError::Negotiation(
                "expected an answer description".into(),
            ));
        }
        self.transport.set_remote_description(answer).await?;
        state.remote_set = true;
        self.flush_pending(&mut state).await
    }

    /// Apply a batch of remote candidates in received order. Before the
    /// remote description is set they are buffered, never dropped;
    /// afterwards duplicates from replayed polling are skipped.
    pub async fn apply_remote_candidates(
        &self,
        candidates: Vec<CandidateBlob>,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            // Late batches after hang-up are dropped, not errors.
            return Ok(());
        }
        if !state.remote_set {
            for candidate in candidates {
                if !state.pending_inbound.contains(&candidate) {
                    state.pending_inbound.push(candidate);
                }
            }
            debug!(
                target: "negotiation",
                buffered = state.pending_inbound.len(),
                "buffered candidates ahead of remote description"
            );
            return Ok(());
        }
        for candidate in candidates {
            if state.applied.contains(&candidate) {
                trace!(target: "negotiation", "skipping duplicate candidate");
                continue;
            }
            self.transport.add_remote_candidate(candidate.clone()).await?;
            state.applied.insert(candidate);
        }
        Ok(())
    }

    /// Snapshot of every candidate discovered so far, oldest first. The
    /// full list is what gets republished to the channel.
    pub fn outbound_candidates(&self) -> Vec<CandidateBlob> {
        self.outbound.lock().clone()
    }

    /// Resolves when a new local candidate lands in the outbound list.
    pub fn outbound_changed(&self) -> Notified<'_> {
        self.outbound_changed.notified()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.connection_state()
    }

    /// Release the transport. Safe to call from any state and any number
    /// of times; the transport itself is closed exactly once and media
    /// tracks it owns are released with it.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if let Some(task) = self.gather_task.lock().take() {
            task.abort();
        }
        if let Err(err) = self.transport.close().await {
            warn!(target: "negotiation", error = %err, "transport close reported an error");
        }
    }

    async fn flush_pending(&self, state: &mut NegotiationState) -> Result<(), SessionError> {
        for candidate in std::mem::take(&mut state.pending_inbound) {
            if state.applied.contains(&candidate) {
                continue;
            }
            self.transport.add_remote_candidate(candidate.clone()).await?;
            state.applied.insert(candidate);
        }
        Ok(())
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(task) = self.gather_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockPeerTransport;

    fn offer() -> SessionDescriptionBlob {
        SessionDescriptionBlob {
            kind: SdpKind::Offer,
            sdp: "v=0 remote offer".into(),
        }
    }

    fn answer() -> SessionDescriptionBlob {
        SessionDescriptionBlob {
            kind: SdpKind::Answer,
            sdp: "v=0 remote answer".into(),
        }
    }

    fn candidate(tag: &str) -> CandidateBlob {
        CandidateBlob {
            candidate: format!("candidate:{tag} 1 udp 2130706431 192.0.2.1 54400 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn produce_offer_twice_is_an_invalid_state() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller.produce_offer().await.unwrap();
        let err = controller.produce_offer().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn apply_remote_answer_requires_a_local_offer() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        let err = controller.apply_remote_answer(answer()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn apply_remote_answer_twice_is_an_invalid_state() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller.produce_offer().await.unwrap();
        controller.apply_remote_answer(answer()).await.unwrap();
        let err = controller.apply_remote_answer(answer()).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn rejects_descriptions_of_the_wrong_kind() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller.produce_offer().await.unwrap();
        let err = controller.apply_remote_answer(offer()).await.unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        // A rejected payload must not consume the remote-description slot.
        controller.apply_remote_answer(answer()).await.unwrap();
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_and_flushed_in_order() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller
            .apply_remote_candidates(vec![candidate("a"), candidate("b")])
            .await
            .unwrap();
        controller
            .apply_remote_candidates(vec![candidate("c")])
            .await
            .unwrap();
        assert!(transport.applied_candidates().is_empty());

        controller.produce_answer(offer()).await.unwrap();

        let applied = transport.applied_candidates();
        assert_eq!(
            applied,
            vec![candidate("a"), candidate("b"), candidate("c")]
        );
    }

    #[tokio::test]
    async fn duplicate_candidates_are_applied_once() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller.produce_answer(offer()).await.unwrap();
        controller
            .apply_remote_candidates(vec![candidate("a")])
            .await
            .unwrap();
        controller
            .apply_remote_candidates(vec![candidate("a"), candidate("b")])
            .await
            .unwrap();

        assert_eq!(
            transport.applied_candidates(),
            vec![candidate("a"), candidate("b")]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_the_transport_once() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        controller.close().await;
        controller.close().await;
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn discovered_candidates_accumulate_in_production_order() {
        let transport = MockPeerTransport::new();
        let controller = ConnectionController::new(transport.clone());

        let notified = controller.outbound_changed();
        transport.discover_local_candidate(candidate("x"));
        notified.await;
        transport.discover_local_candidate(candidate("y"));
        controller.outbound_changed().await;

        assert_eq!(
            controller.outbound_candidates(),
            vec![candidate("x"), candidate("y")]
        );
    }
}
