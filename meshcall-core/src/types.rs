//! Call types and data structures

use crate::media::MediaEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from any string-like value
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the inner string
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a call
    CallId
);

string_id!(
    /// Identifier of the chat (1:1 or group) a call belongs to
    ChatId
);

string_id!(
    /// Identifier of a user taking part in calls
    UserId
);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallType {
    /// Default media constraints for this kind of call
    #[must_use]
    pub fn default_constraints(self) -> MediaConstraints {
        match self {
            Self::Audio => MediaConstraints::audio_only(),
            Self::Video => MediaConstraints::video_call(),
        }
    }
}

/// Status of a call session as shared with other participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Waiting for callees to answer
    Ringing,
    /// At least one callee answered
    Accepted,
    /// Call finished normally or was cancelled by the caller
    Ended,
    /// Nobody answered
    Missed,
    /// Callee declined
    Rejected,
}

impl CallStatus {
    /// Ringing or accepted
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ringing | Self::Accepted)
    }

    /// Ended, missed or rejected
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

/// How a call finished from this client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Hung up or cancelled
    Ended,
    /// Never answered
    Missed,
    /// Declined
    Rejected,
    /// Another device of the local user answered
    AnsweredElsewhere,
}

impl CallOutcome {
    /// Status recorded on the session for this outcome
    #[must_use]
    pub fn status(self) -> CallStatus {
        match self {
            Self::Ended | Self::AnsweredElsewhere => CallStatus::Ended,
            Self::Missed => CallStatus::Missed,
            Self::Rejected => CallStatus::Rejected,
        }
    }
}

/// Lifecycle phase of the local call state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    Idle,
    /// This client is calling and waiting for an answer
    RingingOutgoing,
    /// Someone is calling this client
    RingingIncoming,
    /// Call is in progress
    Accepted,
    /// Call finished
    Ended(CallOutcome),
}

impl CallPhase {
    /// Either ringing state
    #[must_use]
    pub fn is_ringing(self) -> bool {
        matches!(self, Self::RingingOutgoing | Self::RingingIncoming)
    }

    /// Ringing or accepted
    #[must_use]
    pub fn is_live(self) -> bool {
        self.is_ringing() || self == Self::Accepted
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Convert to media kinds
    #[must_use]
    pub fn to_media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Display information attached to a call, opaque to the protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Name to show while ringing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar to show while ringing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Identity and lifecycle record of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Chat the call belongs to
    pub chat_id: ChatId,
    /// Audio or video
    pub call_type: CallType,
    /// Shared status
    pub status: CallStatus,
    /// Who started the call
    pub caller_id: UserId,
    /// Everyone who was rung; grows when participants are invited
    pub callee_ids: BTreeSet<UserId>,
    /// When the call was first accepted
    pub started_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,
    /// Accepted-to-ended duration
    pub duration_seconds: Option<u64>,
    /// Display information
    pub metadata: CallMetadata,
}

impl CallSession {
    /// Create a ringing session
    pub fn new(
        call_id: CallId,
        chat_id: ChatId,
        call_type: CallType,
        caller_id: UserId,
        callee_ids: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            call_id,
            chat_id,
            call_type,
            status: CallStatus::Ringing,
            caller_id,
            callee_ids: callee_ids.into_iter().collect(),
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            metadata: CallMetadata::default(),
        }
    }

    /// Attach display metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether `user` is the caller or a callee
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || self.callee_ids.contains(user)
    }

    /// Caller and callees except `local`
    #[must_use]
    pub fn others(&self, local: &UserId) -> Vec<UserId> {
        std::iter::once(&self.caller_id)
            .chain(self.callee_ids.iter())
            .filter(|u| *u != local)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Add callees, returning the ones that were new
    pub fn add_callees(&mut self, users: impl IntoIterator<Item = UserId>) -> Vec<UserId> {
        let mut added = Vec::new();
        for user in users {
            if user != self.caller_id && self.callee_ids.insert(user.clone()) {
                added.push(user);
            }
        }
        added
    }

    /// Record acceptance
    pub fn mark_accepted(&mut self) {
        self.status = CallStatus::Accepted;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record a terminal status and compute the duration
    pub fn finish(&mut self, status: CallStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|start| u64::try_from((now - start).num_seconds()).unwrap_or(0));
    }
}

/// Connection state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Link created
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
    /// Link closed
    Closed,
}

impl ConnectionState {
    /// Failed, disconnected or closed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Offer/answer negotiation state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    /// No negotiation in progress
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Link closed
    Closed,
}

/// Role of this client on one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// This side sends the offer
    Offerer,
    /// This side waits for an offer
    Answerer,
}

/// A remote user in an accepted call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Remote user
    pub user_id: UserId,
    /// Whether a remote video track arrived
    pub has_video_track: bool,
    /// Whether the remote user is currently speaking
    pub is_speaking: bool,
    /// State of the link to this user
    pub connection_state: ConnectionState,
}

impl Participant {
    /// Participant with a freshly created link
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            has_video_track: false,
            is_speaking: false,
            connection_state: ConnectionState::New,
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Outgoing call created
    CallInitiated {
        /// The new session
        session: CallSession,
    },
    /// Incoming call received
    IncomingCall {
        /// The ringing session
        session: CallSession,
    },
    /// Local ringing cue should start or stop
    Ringtone {
        /// Call identifier
        call_id: CallId,
        /// Start (`true`) or stop (`false`)
        playing: bool,
    },
    /// A participant answered
    CallAccepted {
        /// Call identifier
        call_id: CallId,
        /// Who answered
        user_id: UserId,
    },
    /// A participant declined
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Who declined
        user_id: UserId,
    },
    /// Participant link created or changed
    ParticipantUpdated {
        /// Call identifier
        call_id: CallId,
        /// Current participant snapshot
        participant: Participant,
    },
    /// Participant link removed
    ParticipantLeft {
        /// Call identifier
        call_id: CallId,
        /// Remote user
        user_id: UserId,
    },
    /// Call reached a terminal state and was cleared
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// How it ended
        outcome: CallOutcome,
    },
    /// Session-level failure shown to the user
    Failed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
    /// A call survived a restart and can be rejoined
    RejoinAvailable {
        /// The persisted session
        session: CallSession,
    },
    /// Local capture started, stopped or had a track toggled
    LocalMedia {
        /// Call identifier
        call_id: CallId,
        /// What changed
        event: MediaEvent,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            CallId::new("c1"),
            ChatId::new("chat"),
            CallType::Video,
            UserId::new("alice"),
            [UserId::new("bob"), UserId::new("carol")],
        )
    }

    #[test]
    fn test_call_id_generate() {
        let id1 = CallId::generate();
        let id2 = CallId::generate();
        assert_ne!(id1, id2);
        assert!(!id1.is_empty());
    }

    #[test]
    fn test_others_excludes_local_and_dedups() {
        let s = session();
        assert_eq!(
            s.others(&UserId::new("bob")),
            vec![UserId::new("alice"), UserId::new("carol")]
        );
        assert_eq!(s.others(&UserId::new("alice")).len(), 2);
    }

    #[test]
    fn test_add_callees_ignores_caller_and_duplicates() {
        let mut s = session();
        let added = s.add_callees([
            UserId::new("alice"),
            UserId::new("bob"),
            UserId::new("dave"),
        ]);
        assert_eq!(added, vec![UserId::new("dave")]);
        assert!(s.involves(&UserId::new("dave")));
    }

    #[test]
    fn test_duration_only_after_accept() {
        let mut missed = session();
        missed.finish(CallStatus::Missed);
        assert_eq!(missed.duration_seconds, None);
        assert!(missed.ended_at.is_some());

        let mut answered = session();
        answered.mark_accepted();
        let started = answered.started_at;
        answered.mark_accepted();
        assert_eq!(answered.started_at, started);
        answered.finish(CallStatus::Ended);
        assert_eq!(answered.duration_seconds, Some(0));
        assert!(answered.status.is_terminal());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&UserId::new("bob")).unwrap();
        assert_eq!(json, "\"bob\"");
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
    }
}
