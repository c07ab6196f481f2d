//! In-process media transport
//!
//! [`LoopbackMediaTransport`] produces links whose offer/answer state machine
//! behaves like a browser peer connection but carries no media. Descriptions
//! list the attached track kinds as `m=` lines, so the remote side reports one
//! `TrackAdded` per kind once negotiation completes. Used by tests and by the
//! CLI when the native backend is disabled.

use crate::media::LocalTrack;
use crate::peer::{
    LinkHandle, MediaTransport, NegotiationError, TransportEvent, TransportEventSender,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{ConnectionState, MediaKind, SignalingState, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct LinkState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<LocalTrack>,
    remote_candidates: Vec<IceCandidate>,
    connected: bool,
    offers_created: usize,
}

/// One loopback link
pub struct LoopbackLink {
    local: UserId,
    remote: UserId,
    state: Mutex<LinkState>,
    events: TransportEventSender,
    next_port: AtomicU16,
}

impl LoopbackLink {
    fn new(local: UserId, remote: UserId, events: TransportEventSender) -> Self {
        Self {
            local,
            remote,
            state: Mutex::new(LinkState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                tracks: Vec::new(),
                remote_candidates: Vec::new(),
                connected: false,
                offers_created: 0,
            }),
            events,
            next_port: AtomicU16::new(50000),
        }
    }

    /// Remote user of this link
    #[must_use]
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    /// Tracks attached so far
    #[must_use]
    pub fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    /// Remote candidates applied so far
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// Offers created on this link
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Whether both descriptions were applied
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Ask the owner to renegotiate, as a platform link does after track changes
    pub fn request_renegotiation(&self) {
        let _ = self.events.send(TransportEvent::OfferNeeded);
    }

    /// Simulate losing connectivity
    pub fn simulate_connection_state(&self, state: ConnectionState) {
        let _ = self
            .events
            .send(TransportEvent::ConnectionStateChanged(state));
    }

    fn describe(&self, kind: SdpKind, tracks: &[LocalTrack]) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no={} 0 0 IN IP4 127.0.0.1\r\ns=loopback {}\r\n",
            self.local, self.remote
        );
        for track in tracks {
            let media = match track.kind() {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {}\r\n",
                media,
                track.stream_id(),
                track.id()
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn gather_candidate(&self) {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let candidate = IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let _ = self.events.send(TransportEvent::CandidateGathered(candidate));
    }

    fn complete(&self, state: &mut LinkState) {
        if state.connected {
            return;
        }
        state.connected = true;
        if let Some(remote) = &state.remote {
            for line in remote.sdp.lines() {
                let kind = if line.starts_with("m=audio") {
                    Some(MediaKind::Audio)
                } else if line.starts_with("m=video") {
                    Some(MediaKind::Video)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    let _ = self.events.send(TransportEvent::TrackAdded { kind });
                }
            }
        }
        let _ = self.events.send(TransportEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));
    }

    fn ensure_open(state: &LinkState) -> Result<(), NegotiationError> {
        if state.signaling == SignalingState::Closed {
            return Err(NegotiationError::LinkClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl LinkHandle for LoopbackLink {
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.tracks.iter().any(|t| t.id() == track.id()) {
            state.tracks.push(track.clone());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.offers_created += 1;
        Ok(self.describe(SdpKind::Offer, &state.tracks))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::NegotiationFailed(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(self.describe(SdpKind::Answer, &state.tracks))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::NegotiationFailed(format!(
                    "cannot apply local {:?} in {:?}",
                    kind, current
                )))
            }
        };
        let first = state.local.is_none();
        state.signaling = next;
        state.local = Some(desc);
        if first {
            let _ = self.events.send(TransportEvent::ConnectionStateChanged(
                ConnectionState::Connecting,
            ));
        }
        self.gather_candidate();
        if next == SignalingState::Stable {
            self.complete(&mut state);
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::NegotiationFailed(format!(
                    "cannot apply remote {:?} in {:?}",
                    kind, current
                )))
            }
        };
        state.signaling = next;
        state.remote = Some(desc);
        if next == SignalingState::Stable {
            self.complete(&mut state);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            return Err(NegotiationError::NegotiationFailed(
                "remote description not set".to_string(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.signaling = SignalingState::Closed;
            tracing::debug!(local = %self.local, remote = %self.remote, "Loopback link closed");
        }
    }
}

/// Factory for [`LoopbackLink`]s
///
/// Keeps the most recent link per remote user for inspection.
pub struct LoopbackMediaTransport {
    local: UserId,
    links: Mutex<HashMap<UserId, Arc<LoopbackLink>>>,
    created: Mutex<Vec<UserId>>,
}

impl LoopbackMediaTransport {
    /// Create a transport for `local`
    #[must_use]
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            links: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Latest link created toward `remote`
    #[must_use]
    pub fn link(&self, remote: &UserId) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(remote).cloned()
    }

    /// Remote users of every link created, in creation order
    #[must_use]
    pub fn created(&self) -> Vec<UserId> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl MediaTransport for LoopbackMediaTransport {
    async fn create_link(
        &self,
        remote: &UserId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn LinkHandle>, NegotiationError> {
        if remote.is_empty() {
            return Err(NegotiationError::InvalidRemoteUser);
        }
        let link = Arc::new(LoopbackLink::new(self.local.clone(), remote.clone(), events));
        self.links.lock().insert(remote.clone(), link.clone());
        self.created.lock().push(remote.clone());
        Ok(link)
    }
}
