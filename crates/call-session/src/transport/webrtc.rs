//! Peer transport backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{ConnectionState, PeerTransport};
use crate::config::IceConfig;
use crate::error::SessionError;
use crate::message::{CandidateBlob, SdpKind, SessionDescriptionBlob, SessionRole};

const CONTROL_CHANNEL_LABEL: &str = "cove-control";

/// One peer connection. Candidate gathering starts at construction; local
/// media tracks handed in here are owned by the connection and released
/// when it closes.
pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    local_candidates: Mutex<Option<mpsc::UnboundedReceiver<CandidateBlob>>>,
    remote_tracks: Mutex<Option<mpsc::UnboundedReceiver<Arc<TrackRemote>>>>,
    // Held so a track-less session still negotiates one section for ICE.
    _control_channel: Option<Arc<RTCDataChannel>>,
}

impl WebRtcTransport {
    pub async fn connect(
        config: &IceConfig,
        role: SessionRole,
        local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<Arc<Self>, SessionError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(transport_err)?,
        );

        let has_tracks = !local_tracks.is_empty();
        for track in local_tracks {
            peer.add_track(track).await.map_err(transport_err)?;
        }

        let control_channel = if !has_tracks && role == SessionRole::Initiator {
            let channel = peer
                .create_data_channel(CONTROL_CHANNEL_LABEL, None)
                .await
                .map_err(transport_err)?;
            Some(channel)
        } else {
            None
        };

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(CandidateBlob {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        });
                    }
                    Err(err) => {
                        warn!(target: "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let (track_tx, track_rx) = mpsc::unbounded_channel();
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                Box::pin(async move {
                    debug!(target: "webrtc", track_id = %track.id(), "remote track arrived");
                    let _ = tx.send(track);
                })
            },
        ));

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = Arc::clone(&state_tx);
            Box::pin(async move {
                debug!(target: "webrtc", ?state, "peer connection state changed");
                let _ = tx.send(map_connection_state(state));
            })
        }));

        Ok(Arc::new(Self {
            peer,
            state_rx,
            local_candidates: Mutex::new(Some(candidate_rx)),
            remote_tracks: Mutex::new(Some(track_rx)),
            _control_channel: control_channel,
        }))
    }

    /// Stream of remote media tracks. Takeable exactly once; rendering is
    /// the caller's business.
    pub fn take_remote_tracks(&self) -> Option<mpsc::UnboundedReceiver<Arc<TrackRemote>>> {
        self.remote_tracks.lock().take()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescriptionBlob, SessionError> {
        let offer = self.peer.create_offer(None).await.map_err(transport_err)?;
        Ok(SessionDescriptionBlob {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescriptionBlob, SessionError> {
        let answer = self.peer.create_answer(None).await.map_err(transport_err)?;
        Ok(SessionDescriptionBlob {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError> {
        let description = to_rtc_description(&description)?;
        self.peer
            .set_local_description(description)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescriptionBlob,
    ) -> Result<(), SessionError> {
        let description = to_rtc_description(&description)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(negotiation_err)
    }

    async fn add_remote_candidate(&self, candidate: CandidateBlob) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_err)
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<CandidateBlob>> {
        self.local_candidates.lock().take()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.peer.close().await.map_err(transport_err)
    }
}

fn build_api() -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(transport_err)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(transport_err)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(
    description: &SessionDescriptionBlob,
) -> Result<RTCSessionDescription, SessionError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|err| SessionError::Negotiation(format!("malformed session description: {err}")))
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn transport_err(err: impl std::fmt::Display) -> SessionError {
    SessionError::Transport(err.to_string())
}

fn negotiation_err(err: impl std::fmt::Display) -> SessionError {
    SessionError::Negotiation(err.to_string())
}
