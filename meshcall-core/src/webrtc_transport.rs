//! Native peer links backed by the `webrtc` crate
//!
//! Each link is an `RTCPeerConnection` whose callbacks are turned into
//! [`TransportEvent`]s. Local tracks become `TrackLocalStaticSample`s shared
//! by every link of the transport. This module only negotiates and attaches
//! them; writing encoded samples is left to the embedding application, which
//! looks the track up with [`WebRtcMediaTransport::sample_track`]. Mute flags
//! on [`LocalTrack`] are not consulted here.

use crate::media::LocalTrack;
use crate::peer::{
    LinkHandle, MediaTransport, NegotiationError, TransportEvent, TransportEventSender,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{ConnectionState, MediaKind, SignalingState, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type SampleTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

fn negotiation_error(context: &str, e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::NegotiationFailed(format!("{}: {}", context, e))
}

/// Link factory backed by `RTCPeerConnection`
pub struct WebRtcMediaTransport {
    api: API,
    config: RTCConfiguration,
    tracks: SampleTracks,
}

impl WebRtcMediaTransport {
    /// Create a transport using the given STUN/TURN URLs
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(ice_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Transport(format!("codec registration: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::Transport(format!("interceptor registration: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Sample track fed by the capture pipeline for local track `id`
    #[must_use]
    pub fn sample_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(id).cloned()
    }
}

#[async_trait]
impl MediaTransport for WebRtcMediaTransport {
    #[tracing::instrument(skip(self, events), fields(remote = %remote))]
    async fn create_link(
        &self,
        remote: &UserId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn LinkHandle>, NegotiationError> {
        if remote.is_empty() {
            return Err(NegotiationError::InvalidRemoteUser);
        }
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| NegotiationError::Transport(format!("peer connection: {}", e)))?,
        );

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                let _ = tx.send(TransportEvent::ConnectionStateChanged(state));
            })
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::CandidateGathered(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                let _ = tx.send(TransportEvent::TrackAdded { kind });
            })
        }));

        let tx = events;
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::OfferNeeded);
            })
        }));

        Ok(Arc::new(WebRtcLink {
            pc,
            tracks: self.tracks.clone(),
        }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    tracks: SampleTracks,
}

impl WebRtcLink {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| negotiation_error("invalid SDP", e))
    }

    fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
            other => Err(NegotiationError::NegotiationFailed(format!(
                "unsupported description type {:?}",
                other
            ))),
        }
    }

    fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.tracks
            .lock()
            .entry(track.id().to_string())
            .or_insert_with(|| {
                let codec = match track.kind() {
                    MediaKind::Audio => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    MediaKind::Video => RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                };
                Arc::new(TrackLocalStaticSample::new(
                    codec,
                    track.id().to_string(),
                    track.stream_id().to_string(),
                ))
            })
            .clone()
    }
}

#[async_trait]
impl LinkHandle for WebRtcLink {
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sample = self.sample_track(track);
        self.pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| negotiation_error("add_track failed", e))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error("create_offer failed", e))?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error("create_answer failed", e))?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| negotiation_error("set_local_description failed", e))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| negotiation_error("set_remote_description failed", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                ..Default::default()
            })
            .await
            .map_err(|e| negotiation_error("add_ice_candidate failed", e))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Failed to close peer connection");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_offer_contains_attached_audio() {
        let transport = WebRtcMediaTransport::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = transport.create_link(&UserId::new("bob"), tx).await.unwrap();

        let track = LocalTrack::new("mic", MediaKind::Audio, "stream");
        link.attach_track(&track).await.unwrap();
        assert!(transport.sample_track("mic").is_some());

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        link.set_local_description(offer).await.unwrap();
        assert_eq!(link.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!link.has_remote_description().await);
        link.close().await;
    }

    #[tokio::test]
    async fn test_empty_remote_rejected() {
        let transport = WebRtcMediaTransport::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.create_link(&UserId::new(""), tx).await,
            Err(NegotiationError::InvalidRemoteUser)
        ));
    }
}
