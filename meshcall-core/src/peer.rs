//! Peer link capability interface
//!
//! Abstracts the platform peer-connection API (create link, attach tracks,
//! get/set descriptions, ICE) so the negotiation logic in
//! [`crate::peer_manager`] runs over any binding. Link callbacks are
//! delivered as typed [`TransportEvent`]s on a channel instead of closures
//! mutating shared state.

use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::{ConnectionState, MediaKind, SignalingState, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-link negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// SDP or ICE operation failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Remote user id missing
    #[error("Remote user id cannot be empty")]
    InvalidRemoteUser,

    /// Underlying transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Link already closed
    #[error("Peer link closed")]
    LinkClosed,
}

/// Events published by one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link wants (re)negotiation
    OfferNeeded,
    /// A remote track arrived
    TrackAdded {
        /// Track kind
        kind: MediaKind,
    },
    /// A local ICE candidate was gathered
    CandidateGathered(IceCandidate),
    /// Connection state changed
    ConnectionStateChanged(ConnectionState),
}

/// Sender half handed to a transport when a link is created
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer link
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// Attach a local track to the link
    async fn attach_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Current negotiation state
    fn signaling_state(&self) -> SignalingState;

    /// Whether a remote description has been applied
    async fn has_remote_description(&self) -> bool;

    /// Close the link
    async fn close(&self);
}

/// Factory for peer links
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create a link to `remote`, publishing its events on `events`
    async fn create_link(
        &self,
        remote: &UserId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn LinkHandle>, NegotiationError>;
}
