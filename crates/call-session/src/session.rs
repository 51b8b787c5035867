//! Session lifecycle and the signaling exchange protocol.
//!
//! One `Session` per negotiation attempt per peer. All coordination with
//! the remote side goes through the injected [`SignalStore`]; the two
//! controllers never talk directly. Every poll loop is a task handle owned
//! by the session and aborted on completion, teardown, or timeout.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use signal_store::SignalStore;

use crate::controller::ConnectionController;
use crate::error::SessionError;
use crate::message::{self, SessionDescriptionBlob, SessionRole, SignalingMessage};
use crate::transport::{ConnectionState, PeerTransport};

/// Fixed cadence for every signaling poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long an initiator waits for an answer before giving up.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(300);
/// How long either side keeps polling the remote candidate key.
pub const CANDIDATE_EXCHANGE_WINDOW: Duration = Duration::from_secs(30);

const SESSION_ID_LEN: usize = 5;
const SESSION_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Lifecycle of one negotiation attempt. No transition reverses;
/// re-negotiation means a new session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LocalOfferCreated,
    RemoteOfferObserved,
    LocalAnswerCreated,
    NegotiationInFlight,
    Connected,
    NegotiationFailed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::NegotiationFailed | SessionState::Closed)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (NegotiationFailed, _) => false,
            (_, NegotiationFailed) => true,
            (Idle, LocalOfferCreated) | (Idle, RemoteOfferObserved) => true,
            (RemoteOfferObserved, LocalAnswerCreated) => true,
            (LocalOfferCreated, NegotiationInFlight) => true,
            (LocalAnswerCreated, NegotiationInFlight) => true,
            (NegotiationInFlight, Connected) => true,
            _ => false,
        }
    }
}

/// Generate a session id: short, human-shareable, collision-tolerant.
/// Not a security token.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SESSION_ID_CHARSET.len());
            SESSION_ID_CHARSET[idx] as char
        })
        .collect()
}

pub struct Session {
    id: String,
    role: SessionRole,
    created_at: u64,
    store: Arc<dyn SignalStore>,
    controller: Arc<ConnectionController>,
    state_tx: watch::Sender<SessionState>,
    error: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Initiator entry point: generate an id, publish the offer, and start
    /// polling for the answer. Returns as soon as the offer is visible in
    /// the store.
    pub async fn create(
        store: Arc<dyn SignalStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, SessionError> {
        Self::create_with_id(store, transport, generate_session_id()).await
    }

    pub(crate) async fn create_with_id(
        store: Arc<dyn SignalStore>,
        transport: Arc<dyn PeerTransport>,
        id: String,
    ) -> Result<Arc<Self>, SessionError> {
        let controller = ConnectionController::new(transport);
        let session = Arc::new(Session::with_parts(
            id,
            SessionRole::Initiator,
            store,
            controller,
        ));

        let offer = session.controller.produce_offer().await?;
        session.transition(SessionState::LocalOfferCreated);
        session
            .publish(SignalingMessage::Offer {
                session_id: session.id.clone(),
                description: offer,
            })
            .await?;
        session.transition(SessionState::NegotiationInFlight);
        info!(target: "session", session = %session.id, "session created, offer published");

        session.spawn_candidate_republisher();
        session.spawn_answer_poll();
        session.spawn_state_monitor();
        Ok(session)
    }

    /// Joiner entry point: a single offer read, no polling. Joining is an
    /// explicit user action against a session that should already exist,
    /// so an absent offer fails immediately with `SessionNotFound` and no
    /// controller is constructed.
    pub async fn join(
        store: Arc<dyn SignalStore>,
        transport: Arc<dyn PeerTransport>,
        session_id: &str,
    ) -> Result<Arc<Self>, SessionError> {
        let raw = store.get(&message::offer_key(session_id)).await?;
        let Some(raw) = raw else {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        };
        let message = SignalingMessage::decode(&raw)?;
        check_session_id(&message, session_id)?;
        let offer = match message {
            SignalingMessage::Offer { description, .. } => description,
            _ => {
                return Err(SessionError::Negotiation(
                    "unexpected message kind on offer key".into(),
                ))
            }
        };

        let controller = ConnectionController::new(transport);
        let session = Arc::new(Session::with_parts(
            session_id.to_string(),
            SessionRole::Joiner,
            store,
            controller,
        ));

        if let Err(err) = session.finish_join(offer).await {
            session.record_error(err.to_string());
            session.controller.close().await;
            return Err(err);
        }
        info!(target: "session", session = %session.id, "joined session, answer published");

        session.spawn_candidate_republisher();
        session.spawn_remote_candidate_poll();
        session.spawn_state_monitor();
        Ok(session)
    }

    fn with_parts(
        id: String,
        role: SessionRole,
        store: Arc<dyn SignalStore>,
        controller: Arc<ConnectionController>,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Session {
            id,
            role,
            created_at,
            store,
            controller,
            state_tx,
            error: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn finish_join(&self, offer: SessionDescriptionBlob) -> Result<(), SessionError> {
        self.transition(SessionState::RemoteOfferObserved);
        let answer = self.controller.produce_answer(offer).await?;
        self.transition(SessionState::LocalAnswerCreated);

        // The initiator may have published candidates before we arrived.
        let initiator_key = message::candidates_key(&self.id, SessionRole::Initiator);
        match self.store.get(&initiator_key).await {
            Ok(Some(raw)) => {
                let candidates = decode_candidates(&raw, &self.id)?;
                self.controller.apply_remote_candidates(candidates).await?;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "session", session = %self.id, error = %err, "candidate read failed at join");
            }
        }

        self.publish(SignalingMessage::Answer {
            session_id: self.id.clone(),
            description: answer,
        })
        .await?;
        self.transition(SessionState::NegotiationInFlight);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Last surfaced error, if any. Errors are recorded, never thrown at
    /// the user.
    pub fn last_error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Human-readable status line for the current state.
    pub fn status(&self) -> String {
        let state = self.state();
        if state == SessionState::NegotiationFailed {
            if let Some(error) = self.last_error() {
                return error;
            }
        }
        match (self.role, state) {
            (SessionRole::Initiator, SessionState::NegotiationInFlight) => {
                "Waiting for peer to join..."
            }
            (SessionRole::Joiner, SessionState::NegotiationInFlight) => "Connecting to peer...",
            (_, SessionState::Idle) => "Starting...",
            (_, SessionState::LocalOfferCreated) => "Session created",
            (_, SessionState::RemoteOfferObserved) => "Joining session...",
            (_, SessionState::LocalAnswerCreated) => "Answer published",
            (_, SessionState::Connected) => "Connected!",
            (_, SessionState::NegotiationFailed) => "No answer received. Try again.",
            (_, SessionState::Closed) => "Call ended",
        }
        .to_string()
    }

    /// Explicit hang-up: terminal from any state, never raises. Cancels
    /// every poll loop, closes the controller, and clears this session's
    /// keys from the channel.
    pub async fn hang_up(&self) {
        if self.transition(SessionState::Closed) {
            info!(target: "session", session = %self.id, "hanging up");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.controller.close().await;
        for key in message::session_keys(&self.id) {
            if let Err(err) = self.store.delete(&key).await {
                warn!(
                    target: "session",
                    session = %self.id,
                    %key,
                    error = %err,
                    "failed to clear signaling key"
                );
            }
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut moved = false;
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(
                    target: "session",
                    session = %self.id,
                    from = ?*state,
                    to = ?next,
                    "state transition"
                );
                *state = next;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    fn record_error(&self, reason: impl Into<String>) {
        *self.error.lock() = Some(reason.into());
    }

    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: "session", session = %self.id, %reason, "negotiation failed");
        self.record_error(reason);
        self.transition(SessionState::NegotiationFailed);
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), SessionError> {
        let key = message.channel_key(self.role);
        let value = message.encode()?;
        trace!(target: "session", session = %self.id, %key, "publishing signaling message");
        self.store.put(&key, &value).await?;
        Ok(())
    }

    /// Initiator: poll the answer key until it appears or the bound
    /// elapses. On success the joiner's candidate poll takes over; on
    /// expiry the session fails and no further channel reads happen.
    fn spawn_answer_poll(self: &Arc<Self>) {
        // Every spawned task holds the session weakly: the last user handle
        // going away runs `Drop`, which aborts whatever is still parked.
        let weak = Arc::downgrade(self);
        let key = message::answer_key(&self.id);
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + ANSWER_TIMEOUT;
            let mut ticker = interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { return };
                if Instant::now() >= deadline {
                    session.fail(
                        SessionError::NegotiationTimeout("an answer from a joining peer")
                            .to_string(),
                    );
                    return;
                }
                if session.state() != SessionState::NegotiationInFlight {
                    return;
                }
                match session.store.get(&key).await {
                    Ok(Some(raw)) => {
                        match decode_answer(&raw, &session.id) {
                            Ok(answer) => {
                                match session.controller.apply_remote_answer(answer).await {
                                    Ok(()) => {
                                        info!(
                                            target: "session",
                                            session = %session.id,
                                            "answer observed and applied"
                                        );
                                        session.spawn_remote_candidate_poll();
                                    }
                                    Err(err) => session.fail(err.to_string()),
                                }
                            }
                            Err(err) => session.fail(err.to_string()),
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // The channel is unreliable by contract; a failed
                        // read is retried on the next tick.
                        warn!(
                            target: "session",
                            session = %session.id,
                            error = %err,
                            "answer poll read failed"
                        );
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Poll the remote side's candidate key for a bounded window, applying
    /// batches (idempotently) and clearing consumed entries.
    fn spawn_remote_candidate_poll(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let key = message::candidates_key(&self.id, self.role.remote());
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + CANDIDATE_EXCHANGE_WINDOW;
            let mut ticker = interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { return };
                if Instant::now() >= deadline {
                    debug!(
                        target: "session",
                        session = %session.id,
                        "candidate exchange window closed"
                    );
                    return;
                }
                if session.state().is_terminal() {
                    return;
                }
                match session.store.get(&key).await {
                    Ok(Some(raw)) => match decode_candidates(&raw, &session.id) {
                        Ok(candidates) => {
                            if let Err(err) =
                                session.controller.apply_remote_candidates(candidates).await
                            {
                                session.fail(err.to_string());
                                return;
                            }
                            if let Err(err) = session.store.delete(&key).await {
                                warn!(
                                    target: "session",
                                    session = %session.id,
                                    error = %err,
                                    "failed to clear consumed candidates"
                                );
                            }
                        }
                        Err(err) => {
                            session.fail(err.to_string());
                            return;
                        }
                    },
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target: "session",
                            session = %session.id,
                            error = %err,
                            "candidate poll read failed"
                        );
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Republish the full accumulated local candidate list on every
    /// discovery. Full list, not deltas: the channel's read-modify-write
    /// races can drop a single write, and the next republication repairs
    /// it.
    fn spawn_candidate_republisher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let controller = Arc::clone(&self.controller);
        let handle = tokio::spawn(async move {
            loop {
                controller.outbound_changed().await;
                let Some(session) = weak.upgrade() else { return };
                if session.state().is_terminal() {
                    return;
                }
                let candidates = controller.outbound_candidates();
                if candidates.is_empty() {
                    continue;
                }
                let count = candidates.len();
                let batch = SignalingMessage::CandidateBatch {
                    session_id: session.id.clone(),
                    candidates,
                };
                match session.publish(batch).await {
                    Ok(()) => {
                        trace!(
                            target: "session",
                            session = %session.id,
                            count,
                            "republished local candidate list"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "session",
                            session = %session.id,
                            error = %err,
                            "candidate republication failed"
                        );
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Mirror the transport's connection state into the session lifecycle.
    /// `Connected` only ever comes from here.
    fn spawn_state_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut states = self.controller.connection_state();
        let handle = tokio::spawn(async move {
            loop {
                {
                    let Some(session) = weak.upgrade() else { return };
                    let state = *states.borrow_and_update();
                    match state {
                        ConnectionState::Connected => {
                            session.transition(SessionState::Connected);
                        }
                        ConnectionState::Failed => {
                            session.fail("peer transport failed");
                        }
                        ConnectionState::Disconnected => {
                            session.record_error("peer connection interrupted".to_string());
                        }
                        _ => {}
                    }
                    if session.state() == SessionState::Closed {
                        return;
                    }
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn decode_answer(raw: &str, session_id: &str) -> Result<SessionDescriptionBlob, SessionError> {
    let message = SignalingMessage::decode(raw)?;
    check_session_id(&message, session_id)?;
    match message {
        SignalingMessage::Answer { description, .. } => Ok(description),
        _ => Err(SessionError::Negotiation(
            "unexpected message kind on answer key".into(),
        )),
    }
}

fn decode_candidates(
    raw: &str,
    session_id: &str,
) -> Result<Vec<crate::message::CandidateBlob>, SessionError> {
    let message = SignalingMessage::decode(raw)?;
    check_session_id(&message, session_id)?;
    match message {
        SignalingMessage::CandidateBatch { candidates, .. } => Ok(candidates),
        _ => Err(SessionError::Negotiation(
            "unexpected message kind on candidate key".into(),
        )),
    }
}

/// A payload carrying some other session's id means the key space got
/// crossed; reject it rather than negotiate against the wrong peer.
fn check_session_id(message: &SignalingMessage, expected: &str) -> Result<(), SessionError> {
    if message.session_id() != expected {
        return Err(SessionError::Negotiation(format!(
            "session id mismatch: expected {expected}, got {}",
            message.session_id()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{answer_key, candidates_key, offer_key, CandidateBlob, SdpKind};
    use crate::transport::mock::MockPeerTransport;
    use async_trait::async_trait;
    use signal_store::{MemoryStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: MemoryStore,
        gets: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                gets: AtomicUsize::new(0),
            })
        }

        fn get_count(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SignalStore for CountingStore {
        async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn candidate(tag: &str) -> CandidateBlob {
        CandidateBlob {
            candidate: format!("candidate:{tag} 1 udp 2130706431 192.0.2.1 54400 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    /// Poll a condition under the paused clock; sleeps auto-advance time.
    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn session_ids_are_short_lowercase_alphanumeric() {
        for _ in 0..32 {
            let id = generate_session_id();
            assert_eq!(id.len(), 5);
            assert!(id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        use SessionState::*;
        assert!(!NegotiationFailed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(NegotiationInFlight));
        assert!(!Closed.can_transition_to(NegotiationFailed));
        assert!(NegotiationFailed.can_transition_to(Closed));
        assert!(!Connected.can_transition_to(NegotiationInFlight));
        assert!(NegotiationInFlight.can_transition_to(Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_and_joiner_reach_connected_end_to_end() {
        let memory = MemoryStore::new();
        let store: Arc<dyn SignalStore> = Arc::new(memory.clone());

        let initiator_transport = MockPeerTransport::new();
        let initiator = Session::create(store.clone(), initiator_transport.clone())
            .await
            .unwrap();
        assert_eq!(initiator.state(), SessionState::NegotiationInFlight);
        assert!(memory
            .get(&offer_key(initiator.id()))
            .await
            .unwrap()
            .is_some());

        let joiner_transport = MockPeerTransport::new();
        let joiner = Session::join(store.clone(), joiner_transport.clone(), initiator.id())
            .await
            .unwrap();
        assert_eq!(joiner.state(), SessionState::NegotiationInFlight);
        assert!(memory
            .get(&answer_key(initiator.id()))
            .await
            .unwrap()
            .is_some());

        // The initiator's poll picks the answer up within a tick.
        wait_until("initiator to apply the answer", || {
            initiator_transport.remote_description().is_some()
        })
        .await;

        // Candidates flow both ways through the store.
        initiator_transport.discover_local_candidate(candidate("init"));
        wait_until("joiner to apply the initiator candidate", || {
            joiner_transport.applied_candidates().contains(&candidate("init"))
        })
        .await;

        joiner_transport.discover_local_candidate(candidate("join"));
        wait_until("initiator to apply the joiner candidate", || {
            initiator_transport
                .applied_candidates()
                .contains(&candidate("join"))
        })
        .await;

        // Descriptions and candidates alone never make a session
        // Connected; only the transport's own report does.
        assert_eq!(initiator.state(), SessionState::NegotiationInFlight);
        assert_eq!(joiner.state(), SessionState::NegotiationInFlight);

        initiator_transport.set_connection_state(ConnectionState::Connected);
        joiner_transport.set_connection_state(ConnectionState::Connected);
        wait_until("both sessions to connect", || {
            initiator.state() == SessionState::Connected
                && joiner.state() == SessionState::Connected
        })
        .await;

        assert_eq!(initiator.status(), "Connected!");
        assert_eq!(joiner.status(), "Connected!");
    }

    #[tokio::test(start_paused = true)]
    async fn joining_an_unknown_id_creates_no_controller() {
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let transport = MockPeerTransport::new();

        let err = Session::join(store, transport.clone(), "nope1")
            .await
            .err()
            .expect("joining an unknown id must fail");
        assert!(matches!(err, SessionError::SessionNotFound(_)));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(transport.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_applies_candidates_published_before_it_arrived() {
        let memory = MemoryStore::new();
        let store: Arc<dyn SignalStore> = Arc::new(memory.clone());

        let offer = SignalingMessage::Offer {
            session_id: "abcde".into(),
            description: SessionDescriptionBlob {
                kind: SdpKind::Offer,
                sdp: "v=0 preexisting offer".into(),
            },
        };
        memory
            .put(&offer_key("abcde"), &offer.encode().unwrap())
            .await
            .unwrap();
        let batch = SignalingMessage::CandidateBatch {
            session_id: "abcde".into(),
            candidates: vec![candidate("early")],
        };
        memory
            .put(
                &candidates_key("abcde", SessionRole::Initiator),
                &batch.encode().unwrap(),
            )
            .await
            .unwrap();

        let transport = MockPeerTransport::new();
        let joiner = Session::join(store, transport.clone(), "abcde").await.unwrap();

        assert_eq!(joiner.role(), SessionRole::Joiner);
        assert_eq!(transport.applied_candidates(), vec![candidate("early")]);
        assert_eq!(
            transport.local_description().unwrap().kind,
            SdpKind::Answer
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answer_poll_timeout_fails_the_session_and_stops_reads() {
        let store = CountingStore::new();
        let transport = MockPeerTransport::new();
        let session = Session::create(store.clone(), transport).await.unwrap();

        tokio::time::sleep(ANSWER_TIMEOUT + Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionState::NegotiationFailed);
        assert!(session.last_error().is_some());

        let reads = store.get_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.get_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_releases_a_failed_session() {
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let transport = MockPeerTransport::new();
        let session = Session::create(store, transport).await.unwrap();

        tokio::time::sleep(ANSWER_TIMEOUT + Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionState::NegotiationFailed);

        // The republisher and state monitor are still parked on their
        // wake-ups; they must not keep the session alive on their own.
        let weak = Arc::downgrade(&session);
        drop(session);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn answer_for_another_session_fails_the_negotiation() {
        let memory = MemoryStore::new();
        let store: Arc<dyn SignalStore> = Arc::new(memory.clone());
        let transport = MockPeerTransport::new();
        let session = Session::create(store, transport.clone()).await.unwrap();

        let stray = SignalingMessage::Answer {
            session_id: "zzzzz".into(),
            description: SessionDescriptionBlob {
                kind: SdpKind::Answer,
                sdp: "v=0 stray answer".into(),
            },
        };
        memory
            .put(&answer_key(session.id()), &stray.encode().unwrap())
            .await
            .unwrap();

        wait_until("session to fail", || {
            session.state() == SessionState::NegotiationFailed
        })
        .await;
        assert!(session.last_error().unwrap().contains("session id mismatch"));
        assert!(transport.remote_description().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_answer_payload_fails_the_negotiation() {
        let memory = MemoryStore::new();
        let store: Arc<dyn SignalStore> = Arc::new(memory.clone());
        let transport = MockPeerTransport::new();
        let session = Session::create(store, transport).await.unwrap();

        memory
            .put(&answer_key(session.id()), "{definitely not json")
            .await
            .unwrap();
        wait_until("session to fail", || {
            session.state() == SessionState::NegotiationFailed
        })
        .await;
        assert!(session.last_error().unwrap().contains("malformed"));
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_is_terminal_idempotent_and_clears_the_channel() {
        let memory = MemoryStore::new();
        let store: Arc<dyn SignalStore> = Arc::new(memory.clone());
        let transport = MockPeerTransport::new();
        let session = Session::create(store, transport.clone()).await.unwrap();

        session.hang_up().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.status(), "Call ended");
        assert!(memory.get(&offer_key(session.id())).await.unwrap().is_none());

        // Second hang-up is a no-op; the transport closed exactly once.
        session.hang_up().await;
        assert_eq!(transport.close_count(), 1);

        // Closed is sticky even if the transport later reports connected.
        transport.set_connection_state(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_surfaces_as_negotiation_failed() {
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let transport = MockPeerTransport::new();
        let session = Session::create(store, transport.clone()).await.unwrap();

        transport.set_connection_state(ConnectionState::Failed);
        wait_until("session to fail", || {
            session.state() == SessionState::NegotiationFailed
        })
        .await;
        assert!(session.last_error().unwrap().contains("transport"));
    }
}
