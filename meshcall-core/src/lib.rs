//! Meshcall - multi-party call orchestration over a full peer mesh
//!
//! This library drives the lifecycle of audio and video calls between the
//! members of a chat. Media flows over one peer link per pair of participants;
//! call control and link negotiation travel over a signaling channel. It
//! features:
//!
//! - **Call State Machine**: ringing, acceptance, rejection, hang-up and
//!   cross-device answer handling per call
//! - **Mesh Negotiation**: deterministic offerer selection gives every pair
//!   of participants one link; a colliding offer is ignored, never rolled back
//! - **Pluggable Transports**: in-memory or WebSocket signaling, loopback or
//!   native WebRTC peer links
//! - **Rejoin Recovery**: accepted sessions are persisted and can be rejoined
//!   after a restart
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let backend = LocalCallBackend::new().with_chat("team", ["alice", "bob"]);
//!
//! let client = CallClient::builder("alice", Arc::new(relay.connect(UserId::new("alice"))))
//!     .with_backend(Arc::new(backend))
//!     .build()?;
//! let _handle = client.start();
//!
//! let call_id = client
//!     .initiate_call(ChatId::new("team"), CallType::Video, None)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Client configuration
pub mod config;

/// Signaling protocol and channel
pub mod signaling;

/// Signaling transports (in-memory relay and WebSocket)
pub mod transport;

/// WebSocket signaling relay server
pub mod relay;

/// Local capture and track management
pub mod media;

/// Peer link abstraction
pub mod peer;

/// In-process peer links
pub mod loopback;

/// Native peer links backed by the webrtc crate
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Per-call peer link management
pub mod peer_manager;

/// Call lifecycle state machine
pub mod call;

/// Session persistence and rejoin
pub mod recovery;

/// Collaborator API
pub mod backend;

/// Call client orchestration
pub mod service;

// Re-export main types at crate root
pub use backend::{AcceptCallRequest, BackendError, CallBackend, LocalCallBackend, StartCallRequest};
pub use call::{CallError, CallSessionController, ControllerContext};
pub use config::{ClientConfig, ConfigError};
pub use loopback::{LoopbackLink, LoopbackMediaTransport};
pub use media::{
    CaptureDevice, LocalStream, LocalTrack, MediaError, MediaEvent, MediaSessionManager,
    SyntheticCaptureDevice,
};
pub use peer::{LinkHandle, MediaTransport, NegotiationError, TransportEvent};
pub use peer_manager::{LinkInfo, PeerConnectionManager, PeerEvent};
pub use recovery::{
    FileSessionStore, MemorySessionStore, RecoveryCoordinator, SessionStore, StoreError,
};
pub use relay::SignalingRelay;
pub use service::{CallClient, CallClientBuilder};
pub use signaling::{
    IceCandidate, SessionDescription, SignalData, SignalingChannel, SignalingError,
    SignalingMessage, SignalingTransport,
};
pub use transport::{MemoryRelay, MemorySignalingTransport, WebSocketSignalingTransport};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::WebRtcMediaTransport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{CallBackend, LocalCallBackend};
    pub use crate::config::ClientConfig;
    pub use crate::media::{CaptureDevice, SyntheticCaptureDevice};
    pub use crate::peer::MediaTransport;
    pub use crate::service::{CallClient, CallClientBuilder};
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::transport::{MemoryRelay, WebSocketSignalingTransport};
    pub use crate::types::{
        CallEvent, CallId, CallOutcome, CallPhase, CallSession, CallType, ChatId,
        MediaConstraints, UserId,
    };
}
