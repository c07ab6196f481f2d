//! Call signaling protocol
//!
//! Carries call-lifecycle events and per-peer SDP/ICE payloads between
//! clients over an ordered, bidirectional transport.

use crate::types::{CallId, CallMetadata, CallType, ChatId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Maximum serialized signaling message size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum identifier length
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum SDP string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate string length
pub const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// No transport connection
    #[error("Signaling transport not connected")]
    NotConnected,

    /// Transport was shut down
    #[error("Signaling transport closed")]
    Closed,

    /// Message failed validation
    #[error("Invalid signaling message: {0}")]
    Invalid(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description as exchanged between browsers (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Per-peer negotiation payload of a `call:signal` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    /// Offer or answer
    Sdp {
        /// Description
        sdp: SessionDescription,
    },
    /// Trickled ICE candidate
    Ice {
        /// Candidate
        candidate: IceCandidate,
    },
}

/// `call:ringing` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingingPayload {
    /// Call identifier
    pub call_id: CallId,
    /// Chat identifier
    pub chat_id: ChatId,
    /// Caller
    pub caller_id: UserId,
    /// Callees
    pub callee_ids: BTreeSet<UserId>,
    /// Audio or video
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Display information
    #[serde(default)]
    pub metadata: CallMetadata,
}

/// `call:accepted` and `call:rejected` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    /// Call identifier
    pub call_id: CallId,
    /// Who answered or declined
    pub user_id: UserId,
    /// Sender lost its session state and is joining again
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejoin: bool,
}

/// `call:ended` and `call:missed` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    /// Call identifier
    pub call_id: CallId,
}

/// `call:signal` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Call identifier
    pub call_id: CallId,
    /// Chat identifier
    pub chat_id: ChatId,
    /// Recipient
    pub to_user_id: UserId,
    /// Sender
    pub from_user_id: UserId,
    /// SDP or ICE
    pub data: SignalData,
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    /// A call is ringing
    #[serde(rename = "call:ringing")]
    Ringing(RingingPayload),
    /// A participant answered
    #[serde(rename = "call:accepted")]
    Accepted(ParticipantPayload),
    /// A callee declined
    #[serde(rename = "call:rejected")]
    Rejected(ParticipantPayload),
    /// A participant hung up or the caller cancelled
    #[serde(rename = "call:ended")]
    Ended(CallRef),
    /// Nobody answered
    #[serde(rename = "call:missed")]
    Missed(CallRef),
    /// Peer-to-peer negotiation payload
    #[serde(rename = "call:signal")]
    Signal(SignalEnvelope),
}

impl SignalingMessage {
    /// Get the call ID
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Ringing(p) => &p.call_id,
            Self::Accepted(p) | Self::Rejected(p) => &p.call_id,
            Self::Ended(p) | Self::Missed(p) => &p.call_id,
            Self::Signal(p) => &p.call_id,
        }
    }

    /// Wire event name
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Ringing(_) => "call:ringing",
            Self::Accepted(_) => "call:accepted",
            Self::Rejected(_) => "call:rejected",
            Self::Ended(_) => "call:ended",
            Self::Missed(_) => "call:missed",
            Self::Signal(_) => "call:signal",
        }
    }

    /// Check size and content limits
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Invalid` describing the first violation
    pub fn validate(&self) -> Result<(), SignalingError> {
        check_id("callId", self.call_id().as_str())?;
        match self {
            Self::Ringing(p) => {
                check_id("chatId", p.chat_id.as_str())?;
                check_id("callerId", p.caller_id.as_str())?;
                for callee in &p.callee_ids {
                    check_id("calleeIds", callee.as_str())?;
                }
            }
            Self::Accepted(p) | Self::Rejected(p) => check_id("userId", p.user_id.as_str())?,
            Self::Ended(_) | Self::Missed(_) => {}
            Self::Signal(p) => {
                check_id("chatId", p.chat_id.as_str())?;
                check_id("toUserId", p.to_user_id.as_str())?;
                check_id("fromUserId", p.from_user_id.as_str())?;
                match &p.data {
                    SignalData::Sdp { sdp } => {
                        if sdp.sdp.trim().is_empty() {
                            return Err(SignalingError::Invalid("SDP cannot be empty".to_string()));
                        }
                        if sdp.sdp.len() > MAX_SDP_LENGTH {
                            return Err(SignalingError::Invalid(format!(
                                "SDP exceeds {} bytes",
                                MAX_SDP_LENGTH
                            )));
                        }
                    }
                    SignalData::Ice { candidate } => {
                        if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                            return Err(SignalingError::Invalid(format!(
                                "ICE candidate exceeds {} bytes",
                                MAX_CANDIDATE_LENGTH
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize to the JSON wire form, enforcing the size limit
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the message is too large
    pub fn to_wire(&self) -> Result<String, SignalingError> {
        let json = serde_json::to_string(self)?;
        if json.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::Invalid(format!(
                "message exceeds {} bytes",
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }
        Ok(json)
    }
}

fn check_id(field: &str, value: &str) -> Result<(), SignalingError> {
    if value.trim().is_empty() {
        return Err(SignalingError::Invalid(format!("{} cannot be empty", field)));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(SignalingError::Invalid(format!(
            "{} exceeds {} bytes",
            field, MAX_ID_LENGTH
        )));
    }
    Ok(())
}

/// Signaling transport trait
///
/// Implement this for your specific transport (in-process relay, WebSocket, ...).
/// Messages from one sender to one recipient must be delivered in send order.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a message to one user
    async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Receive the next message addressed to this client, with its sender
    async fn receive(&self) -> Result<(UserId, SignalingMessage), SignalingError>;

    /// Whether the transport currently has a live connection
    fn is_connected(&self) -> bool;
}

/// Validating, traced front end to a [`SignalingTransport`]
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    error_count: AtomicU32,
}

impl SignalingChannel {
    /// Create new signaling channel
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            error_count: AtomicU32::new(0),
        }
    }

    /// Whether a transport connection is available
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a signaling message to one user
    ///
    /// # Errors
    ///
    /// Returns error if the message is invalid or sending fails
    #[tracing::instrument(skip(self, message), fields(to = %to, event = message.event_name()))]
    pub async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError> {
        message.validate()?;
        if !self.transport.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        tracing::debug!("Sending signaling message");
        self.transport.send(to, message).await
    }

    /// Send the same message to several users
    ///
    /// Every recipient is attempted; returns the number of failed sends.
    pub async fn broadcast(&self, recipients: &[UserId], message: &SignalingMessage) -> usize {
        let mut failures = 0;
        for to in recipients {
            if let Err(e) = self.send(to, message.clone()).await {
                failures += 1;
                tracing::warn!(to = %to, event = message.event_name(), error = %e, "Signaling send failed");
            }
        }
        failures
    }

    /// Receive the next valid message
    ///
    /// Invalid inbound messages are logged and skipped. Transport errors
    /// back off linearly (capped) before being returned.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or is closed
    pub async fn receive(&self) -> Result<(UserId, SignalingMessage), SignalingError> {
        loop {
            let (from, message) = match self.transport.receive().await {
                Ok(received) => {
                    self.error_count.store(0, Ordering::Relaxed);
                    received
                }
                Err(SignalingError::Closed) => return Err(SignalingError::Closed),
                Err(e) => {
                    let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;

                    let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                    tracing::warn!(
                        error_count = count,
                        backoff_ms = backoff_duration.as_millis(),
                        error = %e,
                        "Error receiving message, backing off"
                    );
                    sleep(backoff_duration).await;
                    return Err(e);
                }
            };
            match message.validate() {
                Ok(()) => {
                    tracing::debug!(from = %from, event = message.event_name(), call_id = %message.call_id(), "Received signaling message");
                    return Ok((from, message));
                }
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, "Dropping invalid signaling message");
                }
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockTransport {
        connected: bool,
        sent: Mutex<Vec<(UserId, SignalingMessage)>>,
        inbound: Mutex<VecDeque<(UserId, SignalingMessage)>>,
    }

    impl MockTransport {
        fn new(connected: bool) -> Self {
            Self {
                connected,
                sent: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError> {
            self.sent.lock().unwrap().push((to.clone(), message));
            Ok(())
        }

        async fn receive(&self) -> Result<(UserId, SignalingMessage), SignalingError> {
            self.inbound
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(SignalingError::Closed)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn offer_signal(sdp: &str) -> SignalingMessage {
        SignalingMessage::Signal(SignalEnvelope {
            call_id: CallId::new("c1"),
            chat_id: ChatId::new("chat"),
            to_user_id: UserId::new("bob"),
            from_user_id: UserId::new("alice"),
            data: SignalData::Sdp {
                sdp: SessionDescription::offer(sdp),
            },
        })
    }

    #[test]
    fn test_ringing_wire_format() {
        let msg = SignalingMessage::Ringing(RingingPayload {
            call_id: CallId::new("c1"),
            chat_id: ChatId::new("chat"),
            caller_id: UserId::new("alice"),
            callee_ids: [UserId::new("bob")].into_iter().collect(),
            call_type: CallType::Video,
            metadata: CallMetadata {
                display_name: Some("Alice".to_string()),
                avatar_url: None,
            },
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "call:ringing",
                "data": {
                    "callId": "c1",
                    "chatId": "chat",
                    "callerId": "alice",
                    "calleeIds": ["bob"],
                    "type": "video",
                    "metadata": {"displayName": "Alice"}
                }
            })
        );
    }

    #[test]
    fn test_signal_wire_format() {
        let msg = SignalingMessage::Signal(SignalEnvelope {
            call_id: CallId::new("c1"),
            chat_id: ChatId::new("chat"),
            to_user_id: UserId::new("bob"),
            from_user_id: UserId::new("alice"),
            data: SignalData::Ice {
                candidate: IceCandidate {
                    candidate: "candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                },
            },
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "call:signal");
        assert_eq!(value["data"]["toUserId"], "bob");
        assert_eq!(value["data"]["data"]["type"], "ice");
        assert_eq!(value["data"]["data"]["candidate"]["sdpMLineIndex"], 0);

        let sdp = serde_json::to_value(offer_signal("v=0")).unwrap();
        assert_eq!(sdp["data"]["data"], json!({"type": "sdp", "sdp": {"type": "offer", "sdp": "v=0"}}));
    }

    #[test]
    fn test_parse_browser_ended() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"event":"call:ended","data":{"callId":"c9"}}"#).unwrap();
        assert_eq!(msg.call_id(), &CallId::new("c9"));
        assert_eq!(msg.event_name(), "call:ended");
    }

    #[test]
    fn test_validate_rejects_bad_messages() {
        assert!(offer_signal("v=0").validate().is_ok());
        assert!(matches!(
            offer_signal("   ").validate(),
            Err(SignalingError::Invalid(ref m)) if m.contains("empty")
        ));
        assert!(offer_signal(&"a".repeat(MAX_SDP_LENGTH + 1)).validate().is_err());

        let no_user = SignalingMessage::Accepted(ParticipantPayload {
            call_id: CallId::new("c1"),
            user_id: UserId::new(""),
            rejoin: false,
        });
        assert!(no_user.validate().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let channel = SignalingChannel::new(Arc::new(MockTransport::new(false)));
        let result = channel.send(&UserId::new("bob"), offer_signal("v=0")).await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test]
    async fn test_broadcast_counts_failures() {
        let transport = Arc::new(MockTransport::new(true));
        let channel = SignalingChannel::new(transport.clone());
        let msg = SignalingMessage::Ended(CallRef {
            call_id: CallId::new("c1"),
        });
        let failures = channel
            .broadcast(&[UserId::new("bob"), UserId::new("carol")], &msg)
            .await;
        assert_eq!(failures, 0);
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_receive_skips_invalid() {
        let transport = Arc::new(MockTransport::new(true));
        transport
            .inbound
            .lock()
            .unwrap()
            .push_back((UserId::new("alice"), offer_signal("")));
        transport
            .inbound
            .lock()
            .unwrap()
            .push_back((UserId::new("alice"), offer_signal("v=0")));
        let channel = SignalingChannel::new(transport);
        let (from, msg) = channel.receive().await.unwrap();
        assert_eq!(from, UserId::new("alice"));
        assert_eq!(msg, offer_signal("v=0"));
        assert!(matches!(channel.receive().await, Err(SignalingError::Closed)));
    }
}
