//! Call lifecycle state machine
//!
//! One [`CallSessionController`] exists per call known to a client. It owns
//! the [`CallSession`], the remote participants, the local media and the peer
//! links of that call, and applies user actions and inbound signaling to them.
//!
//! ```text
//!                 initiate                     ringing received
//!     Idle ───────────────► RingingOutgoing    RingingIncoming ◄──── Idle
//!       │                        │                    │
//!       │ rejoin      accepted   │                    │ accept
//!       │ received    ───────────┼────────────────────┤
//!       ▼                        ▼                    ▼
//!   Accepted ◄──────────────────────────────────── Accepted
//!       │
//!       │ end / last participant left / rejected / missed
//!       ▼
//!   Ended(outcome)
//! ```
//!
//! Peer links follow the initiator rule: when the caller leaves
//! `RingingOutgoing` it offers to every participant that has accepted, and
//! afterwards every accepted participant offers to each new joiner. A client
//! that accepts never offers; it answers the offers it receives.

use crate::media::{CaptureDevice, MediaError, MediaEvent, MediaSessionManager};
use crate::peer::MediaTransport;
use crate::peer_manager::{LinkInfo, PeerConnectionManager, PeerEvent};
use crate::signaling::{
    CallRef, ParticipantPayload, RingingPayload, SignalEnvelope, SignalingChannel,
    SignalingMessage,
};
use crate::types::{
    CallEvent, CallOutcome, CallPhase, CallSession, ChatId, MediaConstraints, MediaKind,
    Participant, UserId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// No signaling connection
    #[error("Signaling unavailable")]
    SignalingUnavailable,

    /// Local capture could not be opened
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    /// Call not found
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Another call is live in the same chat
    #[error("A call is already in progress in chat {0}")]
    CallInProgress(ChatId),

    /// Nobody to ring
    #[error("No callees for chat {0}")]
    NoCallees(ChatId),

    /// Invalid state
    #[error("Invalid call state")]
    InvalidState,

    /// Collaborator API failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Session store failure
    #[error("Session store error: {0}")]
    Store(String),
}

impl From<crate::backend::BackendError> for CallError {
    fn from(err: crate::backend::BackendError) -> Self {
        CallError::Backend(err.to_string())
    }
}

impl From<crate::recovery::StoreError> for CallError {
    fn from(err: crate::recovery::StoreError) -> Self {
        CallError::Store(err.to_string())
    }
}

/// Shared dependencies handed to every controller of a client
#[derive(Clone)]
pub struct ControllerContext {
    /// Local user
    pub local_user: UserId,
    /// Outbound signaling
    pub signaling: Arc<SignalingChannel>,
    /// Peer link factory
    pub media_transport: Arc<dyn MediaTransport>,
    /// Local capture
    pub capture: Arc<dyn CaptureDevice>,
    /// Where link tasks report
    pub peer_events: mpsc::UnboundedSender<PeerEvent>,
    /// Where call events are published
    pub events: broadcast::Sender<CallEvent>,
    /// Remote ICE candidates queued per link
    pub max_pending_ice: usize,
}

/// State machine of one call
pub struct CallSessionController {
    local_user: UserId,
    session: CallSession,
    phase: CallPhase,
    constraints: MediaConstraints,
    participants: BTreeMap<UserId, Participant>,
    /// Remote users currently in the call (the caller counts from the start)
    present: BTreeSet<UserId>,
    declined: BTreeSet<UserId>,
    media: MediaSessionManager,
    media_events: broadcast::Receiver<MediaEvent>,
    peers: PeerConnectionManager,
    signaling: Arc<SignalingChannel>,
    events: broadcast::Sender<CallEvent>,
    dirty: bool,
}

impl CallSessionController {
    fn new(ctx: &ControllerContext, session: CallSession, phase: CallPhase) -> Self {
        let peers = PeerConnectionManager::new(
            session.call_id.clone(),
            session.chat_id.clone(),
            ctx.local_user.clone(),
            ctx.media_transport.clone(),
            ctx.signaling.clone(),
            ctx.peer_events.clone(),
            ctx.max_pending_ice,
        );
        let media = MediaSessionManager::new(ctx.capture.clone());
        let media_events = media.subscribe_events();
        Self {
            local_user: ctx.local_user.clone(),
            constraints: session.call_type.default_constraints(),
            session,
            phase,
            participants: BTreeMap::new(),
            present: BTreeSet::new(),
            declined: BTreeSet::new(),
            media,
            media_events,
            peers,
            signaling: ctx.signaling.clone(),
            events: ctx.events.clone(),
            dirty: false,
        }
    }

    /// Controller for a call placed by the local user
    #[must_use]
    pub fn outgoing(ctx: &ControllerContext, session: CallSession) -> Self {
        let controller = Self::new(ctx, session, CallPhase::RingingOutgoing);
        tracing::debug!(
            call_id = %controller.session.call_id,
            old_state = ?CallPhase::Idle,
            new_state = ?CallPhase::RingingOutgoing,
            "Call state transition"
        );
        controller.publish(CallEvent::CallInitiated {
            session: controller.session.clone(),
        });
        controller.publish(CallEvent::Ringtone {
            call_id: controller.session.call_id.clone(),
            playing: true,
        });
        controller
    }

    /// Controller for a call ringing the local user
    #[must_use]
    pub fn incoming(ctx: &ControllerContext, session: CallSession) -> Self {
        let mut controller = Self::new(ctx, session, CallPhase::RingingIncoming);
        controller
            .present
            .insert(controller.session.caller_id.clone());
        tracing::debug!(
            call_id = %controller.session.call_id,
            old_state = ?CallPhase::Idle,
            new_state = ?CallPhase::RingingIncoming,
            "Call state transition"
        );
        controller.publish(CallEvent::IncomingCall {
            session: controller.session.clone(),
        });
        controller.publish(CallEvent::Ringtone {
            call_id: controller.session.call_id.clone(),
            playing: true,
        });
        controller
    }

    /// Idle controller for a persisted session about to be rejoined
    #[must_use]
    pub fn recovered(ctx: &ControllerContext, session: CallSession) -> Self {
        Self::new(ctx, session, CallPhase::Idle)
    }

    /// The session record
    #[must_use]
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Whether the call reached a terminal phase
    #[must_use]
    pub fn is_ended(&self) -> bool {
        matches!(self.phase, CallPhase::Ended(_))
    }

    /// Snapshot of remote participants with a link
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    /// Number of open peer links
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.peers.link_count()
    }

    /// Snapshot of the peer links
    #[must_use]
    pub fn links(&self) -> Vec<LinkInfo> {
        self.peers.links()
    }

    /// Whether local capture is running
    #[must_use]
    pub fn has_local_media(&self) -> bool {
        self.media.is_active()
    }

    /// Whether the session changed in a way that must be persisted
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Republish local media changes as call events
    fn forward_media_events(&mut self) {
        loop {
            match self.media_events.try_recv() {
                Ok(event) => self.publish(CallEvent::LocalMedia {
                    call_id: self.session.call_id.clone(),
                    event,
                }),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Media events lagged");
                }
                Err(_) => break,
            }
        }
    }

    fn transition(&mut self, next: CallPhase) {
        let old_state = self.phase;
        self.phase = next;
        tracing::debug!(
            call_id = %self.session.call_id,
            old_state = ?old_state,
            new_state = ?next,
            "Call state transition"
        );
    }

    fn enter_accepted(&mut self) {
        self.transition(CallPhase::Accepted);
        self.session.mark_accepted();
        self.dirty = true;
    }

    fn ringing_payload(&self) -> RingingPayload {
        RingingPayload {
            call_id: self.session.call_id.clone(),
            chat_id: self.session.chat_id.clone(),
            caller_id: self.session.caller_id.clone(),
            callee_ids: self.session.callee_ids.clone(),
            call_type: self.session.call_type,
            metadata: self.session.metadata.clone(),
        }
    }

    /// `call:ringing` message announcing this call
    #[must_use]
    pub fn ringing_message(&self) -> SignalingMessage {
        SignalingMessage::Ringing(self.ringing_payload())
    }

    fn accepted_message(&self, rejoin: bool) -> SignalingMessage {
        SignalingMessage::Accepted(ParticipantPayload {
            call_id: self.session.call_id.clone(),
            user_id: self.local_user.clone(),
            rejoin,
        })
    }

    fn ended_message(&self) -> SignalingMessage {
        SignalingMessage::Ended(CallRef {
            call_id: self.session.call_id.clone(),
        })
    }

    async fn broadcast(&self, recipients: &[UserId], message: &SignalingMessage) {
        let failed = self.signaling.broadcast(recipients, message).await;
        if failed > 0 {
            tracing::warn!(
                call_id = %self.session.call_id,
                event = message.event_name(),
                failed,
                recipients = recipients.len(),
                "Some signaling sends failed"
            );
        }
    }

    async fn broadcast_to_others(&self, message: &SignalingMessage) {
        let others = self.session.others(&self.local_user);
        self.broadcast(&others, message).await;
    }

    /// Tear down links and media and record the outcome
    async fn conclude(&mut self, outcome: CallOutcome) {
        let was_ringing = self.phase.is_ringing();
        self.peers.close_all().await;
        self.participants.clear();
        self.media.release();
        self.forward_media_events();
        self.session.finish(outcome.status());
        self.transition(CallPhase::Ended(outcome));
        if was_ringing {
            self.publish(CallEvent::Ringtone {
                call_id: self.session.call_id.clone(),
                playing: false,
            });
        }
        tracing::info!(
            call_id = %self.session.call_id,
            outcome = ?outcome,
            duration_seconds = ?self.session.duration_seconds,
            "Call ended"
        );
        self.publish(CallEvent::CallEnded {
            call_id: self.session.call_id.clone(),
            outcome,
        });
    }

    async fn open_link(&mut self, remote: &UserId) {
        let tracks = self.media.tracks();
        match self.peers.connect_to(remote, &tracks).await {
            Ok(_) => self.track_participant(remote),
            Err(e) => tracing::warn!(
                call_id = %self.session.call_id,
                remote = %remote,
                error = %e,
                "Failed to create peer link"
            ),
        }
    }

    fn has_live_link(&self, remote: &UserId) -> bool {
        self.peers.has_link(remote)
            && self
                .participants
                .get(remote)
                .is_some_and(|p| !p.connection_state.is_terminal())
    }

    fn track_participant(&mut self, remote: &UserId) {
        let participant = Participant::new(remote.clone());
        self.participants
            .insert(remote.clone(), participant.clone());
        self.publish(CallEvent::ParticipantUpdated {
            call_id: self.session.call_id.clone(),
            participant,
        });
    }

    async fn drop_participant(&mut self, remote: &UserId) {
        self.peers.remove(remote).await;
        if self.participants.remove(remote).is_some() {
            self.publish(CallEvent::ParticipantLeft {
                call_id: self.session.call_id.clone(),
                user_id: remote.clone(),
            });
        }
    }

    /// Accept an incoming call
    ///
    /// Returns `false` without doing anything unless the call is ringing
    /// this client. On media failure the call keeps ringing.
    ///
    /// # Errors
    ///
    /// Returns `CallError::MediaAcquisitionFailed` if capture cannot be opened
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn accept(&mut self, constraints: MediaConstraints) -> Result<bool, CallError> {
        if self.phase != CallPhase::RingingIncoming {
            tracing::debug!(phase = ?self.phase, "Accept ignored outside incoming ringing");
            return Ok(false);
        }
        self.media.acquire(constraints).await?;
        self.forward_media_events();
        self.constraints = constraints;
        self.enter_accepted();
        self.publish(CallEvent::Ringtone {
            call_id: self.session.call_id.clone(),
            playing: false,
        });

        // Accepted participants offer to us once they see this.
        let message = self.accepted_message(false);
        self.broadcast_to_others(&message).await;
        self.publish(CallEvent::CallAccepted {
            call_id: self.session.call_id.clone(),
            user_id: self.local_user.clone(),
        });
        tracing::info!("Call accepted");
        Ok(true)
    }

    /// Decline an incoming call
    ///
    /// Returns `false` unless the call was ringing this client.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn reject(&mut self) -> bool {
        if self.phase != CallPhase::RingingIncoming {
            tracing::debug!(phase = ?self.phase, "Reject ignored outside incoming ringing");
            return false;
        }
        let message = SignalingMessage::Rejected(ParticipantPayload {
            call_id: self.session.call_id.clone(),
            user_id: self.local_user.clone(),
            rejoin: false,
        });
        self.broadcast_to_others(&message).await;
        self.conclude(CallOutcome::Rejected).await;
        true
    }

    /// Hang up, cancel an outgoing call or decline an incoming one
    ///
    /// Always transitions locally; sends are best-effort. Returns `false` if
    /// there was nothing to end.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn end(&mut self) -> bool {
        match self.phase {
            CallPhase::Idle | CallPhase::Ended(_) => false,
            CallPhase::RingingIncoming => self.reject().await,
            CallPhase::RingingOutgoing | CallPhase::Accepted => {
                let message = self.ended_message();
                self.broadcast_to_others(&message).await;
                self.conclude(CallOutcome::Ended).await;
                true
            }
        }
    }

    /// Ringing deadline passed without an answer
    pub async fn ringing_timed_out(&mut self) -> bool {
        if self.phase != CallPhase::RingingOutgoing {
            return false;
        }
        tracing::info!(call_id = %self.session.call_id, "Outgoing call unanswered");
        let message = self.ended_message();
        self.broadcast_to_others(&message).await;
        self.conclude(CallOutcome::Missed).await;
        true
    }

    /// Rejoin a persisted accepted call after a restart
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the controller is idle, or
    /// `CallError::MediaAcquisitionFailed` if capture cannot be opened
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn rejoin(&mut self, constraints: MediaConstraints) -> Result<(), CallError> {
        if self.phase != CallPhase::Idle {
            return Err(CallError::InvalidState);
        }
        self.media.acquire(constraints).await?;
        self.forward_media_events();
        self.constraints = constraints;
        self.present = self.session.others(&self.local_user).into_iter().collect();
        self.enter_accepted();

        // Same as a late join: everyone still in the call offers to us.
        let message = self.accepted_message(true);
        self.broadcast_to_others(&message).await;
        self.publish(CallEvent::CallAccepted {
            call_id: self.session.call_id.clone(),
            user_id: self.local_user.clone(),
        });
        tracing::info!("Call rejoined");
        Ok(())
    }

    /// Merge the roster of a repeated `call:ringing` (participant invited)
    pub fn on_ringing(&mut self, payload: &RingingPayload) {
        if !self.phase.is_live() {
            return;
        }
        let added = self.session.add_callees(payload.callee_ids.iter().cloned());
        if !added.is_empty() {
            tracing::debug!(call_id = %self.session.call_id, added = ?added, "Call roster grew");
            if self.phase == CallPhase::Accepted {
                self.dirty = true;
            }
        }
    }

    /// `call:accepted` naming `user`
    ///
    /// # Errors
    ///
    /// Returns `CallError::MediaAcquisitionFailed` if the caller cannot open
    /// capture when the first callee answers; the call is ended in that case
    pub async fn on_accepted(&mut self, user: &UserId) -> Result<(), CallError> {
        self.accepted_by(user, false).await
    }

    /// `call:accepted` from a participant that lost its session and rejoined
    ///
    /// Any link to `user` is replaced, since its side of it is gone.
    ///
    /// # Errors
    ///
    /// Same as [`Self::on_accepted`]
    pub async fn on_rejoined(&mut self, user: &UserId) -> Result<(), CallError> {
        self.accepted_by(user, true).await
    }

    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    async fn accepted_by(&mut self, user: &UserId, rejoin: bool) -> Result<(), CallError> {
        if user == &self.local_user {
            if self.phase == CallPhase::RingingIncoming {
                tracing::info!("Call answered on another device");
                self.conclude(CallOutcome::AnsweredElsewhere).await;
            }
            return Ok(());
        }
        if !self.phase.is_live() {
            return Ok(());
        }

        if !self.session.involves(user) {
            self.session.add_callees([user.clone()]);
            if self.phase == CallPhase::Accepted {
                self.dirty = true;
            }
        }
        self.declined.remove(user);
        self.present.insert(user.clone());
        self.publish(CallEvent::CallAccepted {
            call_id: self.session.call_id.clone(),
            user_id: user.clone(),
        });

        match self.phase {
            CallPhase::RingingOutgoing => {
                if let Err(e) = self.media.acquire(self.constraints).await {
                    tracing::warn!(error = %e, "Caller media unavailable, ending call");
                    let message = self.ended_message();
                    self.broadcast_to_others(&message).await;
                    self.conclude(CallOutcome::Ended).await;
                    self.publish(CallEvent::Failed {
                        call_id: self.session.call_id.clone(),
                        error: e.to_string(),
                    });
                    return Err(CallError::MediaAcquisitionFailed(e));
                }
                self.forward_media_events();
                self.enter_accepted();
                self.publish(CallEvent::Ringtone {
                    call_id: self.session.call_id.clone(),
                    playing: false,
                });
                let roster: Vec<UserId> = self.present.iter().cloned().collect();
                for remote in &roster {
                    self.open_link(remote).await;
                }
            }
            CallPhase::Accepted => {
                if rejoin || !self.has_live_link(user) {
                    self.open_link(user).await;
                } else {
                    tracing::debug!(user = %user, "Duplicate accept for a live link dropped");
                }
            }
            _ => {
                tracing::debug!(user = %user, "Presence recorded while ringing");
            }
        }
        Ok(())
    }

    /// `call:rejected` from `user`
    pub async fn on_rejected(&mut self, user: &UserId) {
        if !self.phase.is_live() || user == &self.local_user {
            return;
        }
        self.declined.insert(user.clone());
        self.present.remove(user);
        self.publish(CallEvent::CallRejected {
            call_id: self.session.call_id.clone(),
            user_id: user.clone(),
        });

        match self.phase {
            CallPhase::RingingOutgoing => {
                let everyone_declined = self
                    .session
                    .callee_ids
                    .iter()
                    .all(|callee| self.declined.contains(callee));
                if everyone_declined {
                    self.conclude(CallOutcome::Rejected).await;
                }
            }
            CallPhase::Accepted => self.drop_participant(user).await,
            _ => {}
        }
    }

    /// `call:ended` sent by `from`
    ///
    /// In a group call the sender leaves; the call ends locally once no
    /// remote participant remains.
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn on_ended(&mut self, from: &UserId) {
        match self.phase {
            CallPhase::Idle | CallPhase::Ended(_) => {}
            CallPhase::RingingIncoming => {
                self.present.remove(from);
                if self.present.is_empty() {
                    self.conclude(CallOutcome::Missed).await;
                }
            }
            CallPhase::RingingOutgoing => self.on_rejected(from).await,
            CallPhase::Accepted => {
                self.present.remove(from);
                self.drop_participant(from).await;
                if self.present.is_empty() {
                    // Still-ringing invitees would otherwise ring forever.
                    let rest: Vec<UserId> = self
                        .session
                        .others(&self.local_user)
                        .into_iter()
                        .filter(|u| u != from)
                        .collect();
                    let message = self.ended_message();
                    self.broadcast(&rest, &message).await;
                    self.conclude(CallOutcome::Ended).await;
                }
            }
        }
    }

    /// `call:missed` for this call
    pub async fn on_missed(&mut self) {
        if self.phase.is_ringing() {
            self.conclude(CallOutcome::Missed).await;
        }
    }

    /// `call:signal` from `from`
    pub async fn on_signal(&mut self, from: &UserId, envelope: SignalEnvelope) {
        if self.phase != CallPhase::Accepted {
            tracing::debug!(call_id = %self.session.call_id, phase = ?self.phase, "Peer signal dropped, call not accepted");
            return;
        }
        if envelope.to_user_id != self.local_user || &envelope.from_user_id != from {
            tracing::warn!(
                call_id = %self.session.call_id,
                from = %from,
                to = %envelope.to_user_id,
                "Misaddressed peer signal dropped"
            );
            return;
        }
        let tracks = self.media.tracks();
        match self.peers.handle_signal(from, envelope.data, &tracks).await {
            Ok(Some(_)) => {
                self.present.insert(from.clone());
                self.track_participant(from);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                call_id = %self.session.call_id,
                from = %from,
                error = %e,
                "Failed to answer peer offer"
            ),
        }
    }

    /// Apply a report from a link task
    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        let (user, link_id) = event.link();
        let user = user.clone();
        if !self.peers.is_current(&user, link_id) {
            tracing::trace!(user = %user, link_id, "Event from replaced link ignored");
            return;
        }
        match event {
            PeerEvent::StateChanged { state, .. } => {
                if state.is_terminal() {
                    tracing::info!(call_id = %self.session.call_id, user = %user, state = ?state, "Peer link lost");
                    self.drop_participant(&user).await;
                    return;
                }
                if let Some(participant) = self.participants.get_mut(&user) {
                    participant.connection_state = state;
                    let participant = participant.clone();
                    self.publish(CallEvent::ParticipantUpdated {
                        call_id: self.session.call_id.clone(),
                        participant,
                    });
                }
            }
            PeerEvent::TrackAdded { kind, .. } => {
                if let Some(participant) = self.participants.get_mut(&user) {
                    if kind == MediaKind::Video {
                        participant.has_video_track = true;
                    }
                    let participant = participant.clone();
                    self.publish(CallEvent::ParticipantUpdated {
                        call_id: self.session.call_id.clone(),
                        participant,
                    });
                }
            }
            PeerEvent::Failed { error, .. } => {
                tracing::warn!(call_id = %self.session.call_id, user = %user, error = %error, "Peer link failed");
                self.drop_participant(&user).await;
            }
        }
    }

    /// Ring `user` into the accepted call
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` unless the call is accepted and
    /// `user` is someone else
    #[tracing::instrument(skip(self), fields(call_id = %self.session.call_id))]
    pub async fn invite_participant(&mut self, user: &UserId) -> Result<(), CallError> {
        if self.phase != CallPhase::Accepted || user == &self.local_user || user.is_empty() {
            return Err(CallError::InvalidState);
        }
        if !self.session.add_callees([user.clone()]).is_empty() {
            self.dirty = true;
        }
        self.declined.remove(user);

        // Participants learn the grown roster before the invitee can answer.
        let mut recipients: Vec<UserId> = self
            .session
            .others(&self.local_user)
            .into_iter()
            .filter(|u| u != user)
            .collect();
        recipients.push(user.clone());
        let message = self.ringing_message();
        self.broadcast(&recipients, &message).await;
        tracing::info!(invitee = %user, "Participant invited");
        Ok(())
    }

    /// Update the speaking indicator of `user`
    ///
    /// Returns `false` if `user` has no link in this call.
    pub fn update_speaking(&mut self, user: &UserId, speaking: bool) -> bool {
        let Some(participant) = self.participants.get_mut(user) else {
            return false;
        };
        if participant.is_speaking != speaking {
            participant.is_speaking = speaking;
            let participant = participant.clone();
            self.publish(CallEvent::ParticipantUpdated {
                call_id: self.session.call_id.clone(),
                participant,
            });
        }
        true
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if no local media is held
    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        self.media
            .set_audio_enabled(enabled)
            .map_err(|_| CallError::InvalidState)?;
        self.forward_media_events();
        Ok(())
    }

    /// Turn the camera on or off
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if no local media is held
    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        self.media
            .set_video_enabled(enabled)
            .map_err(|_| CallError::InvalidState)?;
        self.forward_media_events();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackMediaTransport;
    use crate::media::SyntheticCaptureDevice;
    use crate::transport::MemoryRelay;
    use crate::types::{CallId, CallStatus, CallType, ConnectionState};

    struct Harness {
        relay: MemoryRelay,
        ctx: ControllerContext,
        capture: Arc<SyntheticCaptureDevice>,
        transport: Arc<LoopbackMediaTransport>,
        events: broadcast::Receiver<CallEvent>,
        _peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness(user: &str) -> Harness {
        let relay = MemoryRelay::new();
        let signaling = Arc::new(SignalingChannel::new(Arc::new(
            relay.connect(UserId::new(user)),
        )));
        let capture = Arc::new(SyntheticCaptureDevice::new());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(100);
        let transport = Arc::new(LoopbackMediaTransport::new(UserId::new(user)));
        let ctx = ControllerContext {
            local_user: UserId::new(user),
            signaling,
            media_transport: transport.clone(),
            capture: capture.clone(),
            peer_events: peer_tx,
            events: events_tx,
            max_pending_ice: 16,
        };
        Harness {
            relay,
            ctx,
            capture,
            transport,
            events,
            _peer_events: peer_rx,
        }
    }

    fn session(caller: &str, callees: &[&str]) -> CallSession {
        CallSession::new(
            CallId::new("call-1"),
            ChatId::new("chat-1"),
            CallType::Video,
            UserId::new(caller),
            callees.iter().map(|c| UserId::new(*c)),
        )
    }

    fn sent_events(relay: &MemoryRelay) -> Vec<(String, &'static str)> {
        relay
            .history()
            .into_iter()
            .map(|m| (m.to.to_string(), m.message.event_name()))
            .collect()
    }

    #[tokio::test]
    async fn test_accept_outside_ringing_is_noop() {
        let h = harness("bob");
        let mut controller = CallSessionController::outgoing(&h.ctx, session("bob", &["alice"]));
        assert!(!controller.accept(MediaConstraints::audio_only()).await.unwrap());
        assert_eq!(controller.phase(), CallPhase::RingingOutgoing);
        assert!(!controller.reject().await);
    }

    #[tokio::test]
    async fn test_accept_broadcasts_and_creates_no_links() {
        let h = harness("bob");
        let mut controller =
            CallSessionController::incoming(&h.ctx, session("alice", &["bob", "carol"]));

        assert!(controller.accept(MediaConstraints::video_call()).await.unwrap());
        assert_eq!(controller.phase(), CallPhase::Accepted);
        assert_eq!(controller.session().status, CallStatus::Accepted);
        assert!(controller.has_local_media());
        assert_eq!(controller.link_count(), 0);
        assert!(controller.take_dirty());
        assert_eq!(
            sent_events(&h.relay),
            vec![
                ("alice".to_string(), "call:accepted"),
                ("carol".to_string(), "call:accepted"),
            ]
        );
    }

    #[tokio::test]
    async fn test_media_denied_keeps_ringing() {
        let h = harness("bob");
        h.capture.set_denial(Some(MediaError::PermissionDenied));
        let mut controller = CallSessionController::incoming(&h.ctx, session("alice", &["bob"]));

        let err = controller
            .accept(MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::MediaAcquisitionFailed(MediaError::PermissionDenied)
        ));
        assert_eq!(controller.phase(), CallPhase::RingingIncoming);
        assert!(h.relay.history().is_empty());
    }

    #[tokio::test]
    async fn test_caller_offers_on_first_accept() {
        let h = harness("alice");
        let mut controller =
            CallSessionController::outgoing(&h.ctx, session("alice", &["bob", "carol"]));

        controller.on_accepted(&UserId::new("bob")).await.unwrap();
        assert_eq!(controller.phase(), CallPhase::Accepted);
        assert_eq!(controller.link_count(), 1);
        assert!(controller.session().started_at.is_some());

        controller.on_accepted(&UserId::new("carol")).await.unwrap();
        assert_eq!(controller.link_count(), 2);
        assert_eq!(controller.participants().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_accept_keeps_live_link() {
        let h = harness("alice");
        let bob = UserId::new("bob");
        let mut controller = CallSessionController::outgoing(&h.ctx, session("alice", &["bob"]));
        controller.on_accepted(&bob).await.unwrap();
        let first = h.transport.link(&bob).unwrap();

        controller.on_accepted(&bob).await.unwrap();
        assert_eq!(h.transport.created().len(), 1);
        assert!(Arc::ptr_eq(&first, &h.transport.link(&bob).unwrap()));
        assert_eq!(controller.link_count(), 1);

        // a rejoining peer gets a fresh link
        controller.on_rejoined(&bob).await.unwrap();
        assert_eq!(h.transport.created().len(), 2);
        assert!(!Arc::ptr_eq(&first, &h.transport.link(&bob).unwrap()));
        assert_eq!(controller.link_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_media_failure_ends_call() {
        let mut h = harness("alice");
        h.capture.set_denial(Some(MediaError::DeviceBusy));
        let mut controller = CallSessionController::outgoing(&h.ctx, session("alice", &["bob"]));

        let result = controller.on_accepted(&UserId::new("bob")).await;
        assert!(matches!(result, Err(CallError::MediaAcquisitionFailed(_))));
        assert_eq!(controller.phase(), CallPhase::Ended(CallOutcome::Ended));
        assert_eq!(sent_events(&h.relay), vec![("bob".to_string(), "call:ended")]);

        let mut saw_failed = false;
        while let Ok(event) = h.events.try_recv() {
            saw_failed |= matches!(event, CallEvent::Failed { .. });
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_answered_elsewhere() {
        let h = harness("bob");
        let mut controller = CallSessionController::incoming(&h.ctx, session("alice", &["bob"]));
        controller.on_accepted(&UserId::new("bob")).await.unwrap();

        assert_eq!(
            controller.phase(),
            CallPhase::Ended(CallOutcome::AnsweredElsewhere)
        );
        assert!(h.relay.history().is_empty());
    }

    #[tokio::test]
    async fn test_all_callees_rejecting_ends_outgoing_call() {
        let h = harness("alice");
        let mut controller =
            CallSessionController::outgoing(&h.ctx, session("alice", &["bob", "carol"]));

        controller.on_rejected(&UserId::new("bob")).await;
        assert_eq!(controller.phase(), CallPhase::RingingOutgoing);
        controller.on_rejected(&UserId::new("carol")).await;
        assert_eq!(controller.phase(), CallPhase::Ended(CallOutcome::Rejected));
        assert_eq!(controller.session().status, CallStatus::Rejected);
        assert_eq!(controller.session().duration_seconds, None);
    }

    #[tokio::test]
    async fn test_caller_cancel_is_missed_for_callee() {
        let h = harness("bob");
        let mut controller = CallSessionController::incoming(&h.ctx, session("alice", &["bob"]));
        controller.on_ended(&UserId::new("alice")).await;
        assert_eq!(controller.phase(), CallPhase::Ended(CallOutcome::Missed));

        // replay is a no-op
        controller.on_ended(&UserId::new("alice")).await;
        controller.on_missed().await;
        assert_eq!(controller.phase(), CallPhase::Ended(CallOutcome::Missed));
    }

    #[tokio::test]
    async fn test_group_call_survives_one_departure() {
        let h = harness("alice");
        let mut controller =
            CallSessionController::outgoing(&h.ctx, session("alice", &["bob", "carol", "dave"]));
        controller.on_accepted(&UserId::new("bob")).await.unwrap();
        controller.on_accepted(&UserId::new("carol")).await.unwrap();
        h.relay.clear_history();

        controller.on_ended(&UserId::new("bob")).await;
        assert_eq!(controller.phase(), CallPhase::Accepted);
        assert_eq!(controller.link_count(), 1);

        controller.on_ended(&UserId::new("carol")).await;
        assert_eq!(controller.phase(), CallPhase::Ended(CallOutcome::Ended));
        assert_eq!(controller.link_count(), 0);
        assert!(!controller.has_local_media());
        // the invitee still ringing is told the call is over
        assert!(sent_events(&h.relay).contains(&("dave".to_string(), "call:ended")));
    }

    #[tokio::test]
    async fn test_signal_dropped_unless_accepted() {
        let h = harness("bob");
        let mut controller = CallSessionController::incoming(&h.ctx, session("alice", &["bob"]));
        let envelope = SignalEnvelope {
            call_id: CallId::new("call-1"),
            chat_id: ChatId::new("chat-1"),
            to_user_id: UserId::new("bob"),
            from_user_id: UserId::new("alice"),
            data: crate::signaling::SignalData::Sdp {
                sdp: crate::signaling::SessionDescription::offer("v=0\r\n"),
            },
        };
        controller.on_signal(&UserId::new("alice"), envelope).await;
        assert_eq!(controller.link_count(), 0);
    }

    #[tokio::test]
    async fn test_invite_rings_participants_then_invitee() {
        let h = harness("alice");
        let mut controller = CallSessionController::outgoing(&h.ctx, session("alice", &["bob"]));
        controller.on_accepted(&UserId::new("bob")).await.unwrap();
        controller.take_dirty();
        h.relay.clear_history();

        controller
            .invite_participant(&UserId::new("erin"))
            .await
            .unwrap();
        assert!(controller.take_dirty());
        assert!(controller.session().involves(&UserId::new("erin")));
        let ringing: Vec<_> = sent_events(&h.relay)
            .into_iter()
            .filter(|(_, event)| *event == "call:ringing")
            .collect();
        assert_eq!(
            ringing,
            vec![
                ("bob".to_string(), "call:ringing"),
                ("erin".to_string(), "call:ringing"),
            ]
        );
    }

    #[tokio::test]
    async fn test_speaking_and_stale_link_events() {
        let h = harness("alice");
        let mut controller = CallSessionController::outgoing(&h.ctx, session("alice", &["bob"]));
        controller.on_accepted(&UserId::new("bob")).await.unwrap();
        let bob = UserId::new("bob");

        assert!(controller.update_speaking(&bob, true));
        assert!(controller.participants()[0].is_speaking);
        assert!(!controller.update_speaking(&UserId::new("zed"), true));

        controller
            .on_peer_event(PeerEvent::StateChanged {
                call_id: CallId::new("call-1"),
                user_id: bob.clone(),
                link_id: 999,
                state: ConnectionState::Failed,
            })
            .await;
        assert_eq!(controller.link_count(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_requires_idle_and_media() {
        let h = harness("bob");
        let mut persisted = session("alice", &["bob"]);
        persisted.mark_accepted();

        h.capture.set_denial(Some(MediaError::PermissionDenied));
        let mut controller = CallSessionController::recovered(&h.ctx, persisted);
        assert!(controller.rejoin(MediaConstraints::audio_only()).await.is_err());
        assert_eq!(controller.phase(), CallPhase::Idle);

        h.capture.set_denial(None);
        controller.rejoin(MediaConstraints::audio_only()).await.unwrap();
        assert_eq!(controller.phase(), CallPhase::Accepted);
        assert_eq!(sent_events(&h.relay), vec![("alice".to_string(), "call:accepted")]);
        assert!(matches!(
            controller.rejoin(MediaConstraints::audio_only()).await,
            Err(CallError::InvalidState)
        ));
    }
}
