//! Call client orchestration
//!
//! [`CallClient`] is the entry point an application talks to. It keeps one
//! [`CallSessionController`] per call, routes inbound signaling and peer link
//! reports to them, persists accepted sessions and notifies the collaborator
//! backend about local decisions.

use crate::backend::{AcceptCallRequest, CallBackend, LocalCallBackend, StartCallRequest};
use crate::call::{CallError, CallSessionController, ControllerContext};
use crate::config::{ClientConfig, ConfigError};
use crate::loopback::LoopbackMediaTransport;
use crate::media::{CaptureDevice, SyntheticCaptureDevice};
use crate::peer::MediaTransport;
use crate::peer_manager::{LinkInfo, PeerEvent};
use crate::recovery::{FileSessionStore, MemorySessionStore, RecoveryCoordinator, SessionStore};
use crate::signaling::{SignalingChannel, SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallOutcome, CallPhase, CallSession, CallType, ChatId, MediaConstraints,
    Participant, UserId,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Finished call ids remembered so replayed ringing does not resurrect them
const RECENTLY_FINISHED_CAPACITY: usize = 128;

type SharedController = Arc<Mutex<CallSessionController>>;

#[derive(Default)]
struct Registry {
    calls: HashMap<CallId, SharedController>,
    chats: HashMap<ChatId, CallId>,
    finished: VecDeque<CallId>,
}

impl Registry {
    fn chat_busy(&self, chat_id: &ChatId) -> bool {
        self.chats
            .get(chat_id)
            .is_some_and(|call_id| self.calls.contains_key(call_id))
    }

    fn insert(&mut self, call_id: CallId, chat_id: ChatId, controller: SharedController) {
        self.calls.insert(call_id.clone(), controller);
        self.chats.insert(chat_id, call_id);
    }

    fn remove(&mut self, call_id: &CallId, chat_id: &ChatId) {
        self.calls.remove(call_id);
        if self.chats.get(chat_id) == Some(call_id) {
            self.chats.remove(chat_id);
        }
    }

    fn mark_finished(&mut self, call_id: &CallId) {
        if self.finished.contains(call_id) {
            return;
        }
        if self.finished.len() == RECENTLY_FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back(call_id.clone());
    }
}

struct ClientInner {
    local_user: UserId,
    config: ClientConfig,
    signaling: Arc<SignalingChannel>,
    backend: Arc<dyn CallBackend>,
    ctx: ControllerContext,
    recovery: RecoveryCoordinator,
    // Never held across an await, so it can be taken while a controller is locked.
    registry: RwLock<Registry>,
    event_sender: broadcast::Sender<CallEvent>,
    peer_events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

/// Multi-party call client for one local user
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<ClientInner>,
}

impl CallClient {
    /// Create a builder
    #[must_use]
    pub fn builder(
        local_user: impl Into<UserId>,
        transport: Arc<dyn SignalingTransport>,
    ) -> CallClientBuilder {
        CallClientBuilder::new(local_user, transport)
    }

    /// Local user
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_sender.subscribe()
    }

    fn controller(&self, call_id: &CallId) -> Option<SharedController> {
        self.inner.registry.read().calls.get(call_id).cloned()
    }

    /// Remove a finished controller or persist a changed one
    async fn settle(&self, controller: &mut CallSessionController) {
        let call_id = controller.session().call_id.clone();
        if controller.is_ended() {
            {
                let mut registry = self.inner.registry.write();
                registry.remove(&call_id, &controller.session().chat_id);
                registry.mark_finished(&call_id);
            }
            self.inner.recovery.forget(&call_id).await;
        } else if controller.take_dirty() {
            self.inner.recovery.persist(controller.session()).await;
        }
    }

    /// Ring every other member of `chat_id`, or only `target` when given
    ///
    /// Returns once the session is registered; the `call:ringing` sends run
    /// in a background task.
    ///
    /// # Errors
    ///
    /// Returns `CallError::SignalingUnavailable` without a signaling
    /// connection, `CallError::CallInProgress` if the chat already has a live
    /// call, `CallError::NoCallees` if nobody would be rung, or a backend error
    #[tracing::instrument(skip(self), fields(user = %self.inner.local_user))]
    pub async fn initiate_call(
        &self,
        chat_id: ChatId,
        call_type: CallType,
        target: Option<UserId>,
    ) -> Result<CallId, CallError> {
        if !self.inner.signaling.is_connected() {
            return Err(CallError::SignalingUnavailable);
        }
        if self.inner.registry.read().chat_busy(&chat_id) {
            return Err(CallError::CallInProgress(chat_id));
        }

        let local = &self.inner.local_user;
        let callees: Vec<UserId> = match &target {
            Some(user) if user != local && !user.is_empty() => vec![user.clone()],
            Some(_) => Vec::new(),
            None => self
                .inner
                .backend
                .chat_members(&chat_id)
                .await?
                .into_iter()
                .filter(|member| member != local)
                .collect(),
        };
        if callees.is_empty() {
            return Err(CallError::NoCallees(chat_id));
        }

        let call_id = self
            .inner
            .backend
            .prepare_and_start_call(StartCallRequest {
                chat_id: chat_id.clone(),
                call_type,
                target_user_id: target,
            })
            .await?;
        let metadata = match self.inner.backend.call_metadata(&chat_id, local).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "Call metadata unavailable");
                Default::default()
            }
        };
        let session = CallSession::new(
            call_id.clone(),
            chat_id.clone(),
            call_type,
            local.clone(),
            callees,
        )
        .with_metadata(metadata);

        let controller = {
            let mut registry = self.inner.registry.write();
            if registry.chat_busy(&chat_id) {
                return Err(CallError::CallInProgress(chat_id));
            }
            let controller = Arc::new(Mutex::new(CallSessionController::outgoing(
                &self.inner.ctx,
                session,
            )));
            registry.insert(call_id.clone(), chat_id, controller.clone());
            controller
        };

        self.spawn_ringing(controller);

        if let Some(secs) = self.inner.config.ringing_timeout_secs {
            self.spawn_ringing_timeout(call_id.clone(), Duration::from_secs(secs));
        }

        tracing::info!(call_id = %call_id, call_type = ?call_type, "Call initiated");
        Ok(call_id)
    }

    /// Ring every callee in the background; skipped if the call already ended
    fn spawn_ringing(&self, controller: Arc<Mutex<CallSessionController>>) {
        let signaling = self.inner.signaling.clone();
        let local = self.inner.local_user.clone();
        tokio::spawn(async move {
            let controller = controller.lock().await;
            if controller.phase() != CallPhase::RingingOutgoing {
                tracing::debug!(call_id = %controller.session().call_id, "Call no longer ringing, not broadcasting");
                return;
            }
            let recipients = controller.session().others(&local);
            let message = controller.ringing_message();
            let failed = signaling.broadcast(&recipients, &message).await;
            if failed > 0 {
                tracing::warn!(call_id = %controller.session().call_id, failed, "Some callees could not be rung");
            }
        });
    }

    fn spawn_ringing_timeout(&self, call_id: CallId, after: Duration) {
        let inner: Weak<ClientInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let client = CallClient { inner };
            if let Some(controller) = client.controller(&call_id) {
                let mut controller = controller.lock().await;
                if controller.ringing_timed_out().await {
                    client.settle(&mut controller).await;
                }
            }
        });
    }

    /// Answer an incoming call
    ///
    /// Unknown calls and calls that are not ringing this client are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CallError::MediaAcquisitionFailed` if capture cannot be
    /// opened; the call keeps ringing
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn accept_call(
        &self,
        call_id: &CallId,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        let Some(controller) = self.controller(call_id) else {
            tracing::debug!("Accept for unknown call ignored");
            return Ok(());
        };
        let accepted = {
            let mut controller = controller.lock().await;
            let accepted = controller.accept(constraints).await?;
            self.settle(&mut controller).await;
            accepted
        };
        if accepted {
            let request = AcceptCallRequest {
                call_id: call_id.clone(),
                audio: constraints.audio,
                video: constraints.video,
            };
            if let Err(e) = self.inner.backend.accept_and_start(request).await {
                tracing::warn!(error = %e, "Backend accept notification failed");
            }
        }
        Ok(())
    }

    /// Decline an incoming call
    ///
    /// # Errors
    ///
    /// Currently infallible; unknown calls are ignored
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn reject_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let Some(controller) = self.controller(call_id) else {
            tracing::debug!("Reject for unknown call ignored");
            return Ok(());
        };
        let rejected = {
            let mut controller = controller.lock().await;
            let rejected = controller.reject().await;
            self.settle(&mut controller).await;
            rejected
        };
        if rejected {
            if let Err(e) = self.inner.backend.reject_call_api(call_id).await {
                tracing::warn!(error = %e, "Backend reject notification failed");
            }
        }
        Ok(())
    }

    /// Hang up, cancel or decline a call
    ///
    /// Ending a rejoin-eligible session declines the rejoin.
    ///
    /// # Errors
    ///
    /// Currently infallible; unknown calls are ignored
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn end_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let Some(controller) = self.controller(call_id) else {
            if self.inner.recovery.clear(call_id).await {
                tracing::info!("Rejoin declined");
            } else {
                tracing::debug!("End for unknown call ignored");
            }
            return Ok(());
        };
        let ended = {
            let mut controller = controller.lock().await;
            let ended = controller.end().await;
            self.settle(&mut controller).await;
            ended
        };
        if ended {
            if let Err(e) = self.inner.backend.end_call_api(call_id).await {
                tracing::warn!(error = %e, "Backend end notification failed");
            }
        }
        Ok(())
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns `CallError::CallNotFound` for unknown calls or
    /// `CallError::InvalidState` when no local media is held
    pub async fn set_muted(&self, call_id: &CallId, muted: bool) -> Result<(), CallError> {
        let controller = self
            .controller(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        let mut controller = controller.lock().await;
        controller.set_audio_enabled(!muted)
    }

    /// Turn the camera on or off
    ///
    /// # Errors
    ///
    /// Returns `CallError::CallNotFound` for unknown calls or
    /// `CallError::InvalidState` when no local media is held
    pub async fn set_video_enabled(&self, call_id: &CallId, enabled: bool) -> Result<(), CallError> {
        let controller = self
            .controller(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        let mut controller = controller.lock().await;
        controller.set_video_enabled(enabled)
    }

    /// Ring `user` into an accepted call
    ///
    /// # Errors
    ///
    /// Returns `CallError::CallNotFound` for unknown calls or
    /// `CallError::InvalidState` unless the call is accepted
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn invite_participant(&self, call_id: &CallId, user: UserId) -> Result<(), CallError> {
        let controller = self
            .controller(call_id)
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        let mut controller = controller.lock().await;
        controller.invite_participant(&user).await?;
        self.settle(&mut controller).await;
        Ok(())
    }

    /// Update the speaking indicator of a participant
    pub async fn update_speaking(&self, call_id: &CallId, user: &UserId, speaking: bool) -> bool {
        match self.controller(call_id) {
            Some(controller) => controller.lock().await.update_speaking(user, speaking),
            None => false,
        }
    }

    /// Find persisted accepted sessions that can be rejoined
    ///
    /// Publishes [`CallEvent::RejoinAvailable`] for each new one.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Store` if the session store cannot be read
    #[tracing::instrument(skip(self), fields(user = %self.inner.local_user))]
    pub async fn recover(&self) -> Result<Vec<CallSession>, CallError> {
        let registry = &self.inner.registry;
        let found = self
            .inner
            .recovery
            .scan(|call_id| registry.read().calls.contains_key(call_id))
            .await?;
        for session in &found {
            let _ = self.inner.event_sender.send(CallEvent::RejoinAvailable {
                session: session.clone(),
            });
        }
        Ok(found)
    }

    /// Rejoin a call found by [`CallClient::recover`]
    ///
    /// # Errors
    ///
    /// Returns `CallError::CallNotFound` if the call is not rejoin-eligible,
    /// `CallError::SignalingUnavailable` without a connection or
    /// `CallError::MediaAcquisitionFailed`; the session stays eligible on error
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn rejoin(
        &self,
        call_id: &CallId,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        let session = self
            .inner
            .recovery
            .take(call_id)
            .await
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        if !self.inner.signaling.is_connected() {
            self.inner.recovery.restore(session).await;
            return Err(CallError::SignalingUnavailable);
        }

        let chat_id = session.chat_id.clone();
        let controller = Arc::new(Mutex::new(CallSessionController::recovered(
            &self.inner.ctx,
            session.clone(),
        )));
        // Locked before it becomes visible, so inbound signals wait for rejoin.
        let mut guard = controller.clone().lock_owned().await;
        let registered = {
            let mut registry = self.inner.registry.write();
            let busy = registry.chat_busy(&chat_id);
            if !busy {
                registry.insert(call_id.clone(), chat_id.clone(), controller);
            }
            !busy
        };
        if !registered {
            self.inner.recovery.restore(session).await;
            return Err(CallError::CallInProgress(chat_id));
        }

        match guard.rejoin(constraints).await {
            Ok(()) => {
                self.settle(&mut guard).await;
                drop(guard);
                let request = AcceptCallRequest {
                    call_id: call_id.clone(),
                    audio: constraints.audio,
                    video: constraints.video,
                };
                if let Err(e) = self.inner.backend.accept_and_start(request).await {
                    tracing::warn!(error = %e, "Backend accept notification failed");
                }
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.inner.registry.write().remove(call_id, &chat_id);
                self.inner.recovery.restore(session).await;
                Err(e)
            }
        }
    }

    /// Decline a rejoin; nothing is sent to the other participants
    pub async fn decline_rejoin(&self, call_id: &CallId) -> bool {
        self.inner.recovery.clear(call_id).await
    }

    /// Sessions currently eligible for rejoin
    pub async fn rejoin_eligible(&self) -> Vec<CallSession> {
        self.inner.recovery.eligible().await
    }

    /// Ids of every live call
    #[must_use]
    pub fn active_calls(&self) -> Vec<CallId> {
        let mut calls: Vec<_> = self.inner.registry.read().calls.keys().cloned().collect();
        calls.sort();
        calls
    }

    /// Snapshot of a live call's session
    pub async fn session(&self, call_id: &CallId) -> Option<CallSession> {
        let controller = self.controller(call_id)?;
        let controller = controller.lock().await;
        Some(controller.session().clone())
    }

    /// Phase of a live call
    pub async fn phase(&self, call_id: &CallId) -> Option<CallPhase> {
        let controller = self.controller(call_id)?;
        let phase = controller.lock().await.phase();
        Some(phase)
    }

    /// Remote participants of a live call
    pub async fn participants(&self, call_id: &CallId) -> Vec<Participant> {
        match self.controller(call_id) {
            Some(controller) => controller.lock().await.participants(),
            None => Vec::new(),
        }
    }

    /// Number of peer links of a live call
    pub async fn link_count(&self, call_id: &CallId) -> usize {
        match self.controller(call_id) {
            Some(controller) => controller.lock().await.link_count(),
            None => 0,
        }
    }

    /// Peer links of a live call
    pub async fn links(&self, call_id: &CallId) -> Vec<LinkInfo> {
        match self.controller(call_id) {
            Some(controller) => controller.lock().await.links(),
            None => Vec::new(),
        }
    }

    /// Whether local capture is running for a live call
    pub async fn has_local_media(&self, call_id: &CallId) -> bool {
        match self.controller(call_id) {
            Some(controller) => controller.lock().await.has_local_media(),
            None => false,
        }
    }

    /// Process inbound signaling and peer link reports until signaling closes
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidState` if the client is already running
    #[tracing::instrument(skip(self), fields(user = %self.inner.local_user))]
    pub async fn run(&self) -> Result<(), CallError> {
        let mut peer_events = self
            .inner
            .peer_events
            .lock()
            .take()
            .ok_or(CallError::InvalidState)?;
        tracing::info!("Call client running");

        loop {
            tokio::select! {
                received = self.inner.signaling.receive() => match received {
                    Ok((from, message)) => self.handle_message(from, message).await,
                    Err(SignalingError::Closed) => {
                        tracing::info!("Signaling closed, call client stopping");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "Signaling receive failed"),
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
            }
        }

        *self.inner.peer_events.lock() = Some(peer_events);
        Ok(())
    }

    /// Spawn [`CallClient::run`] on the current runtime
    #[must_use]
    pub fn start(&self) -> JoinHandle<Result<(), CallError>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        let Some(controller) = self.controller(event.call_id()) else {
            return;
        };
        let mut controller = controller.lock().await;
        controller.on_peer_event(event).await;
        self.settle(&mut controller).await;
    }

    /// Apply one inbound signaling message
    #[tracing::instrument(skip(self, message), fields(event = message.event_name(), call_id = %message.call_id()))]
    pub async fn handle_message(&self, from: UserId, message: SignalingMessage) {
        let call_id = message.call_id().clone();
        let Some(controller) = self.controller(&call_id) else {
            self.handle_unknown_call(from, message).await;
            return;
        };

        let mut controller = controller.lock().await;
        match message {
            SignalingMessage::Ringing(payload) => controller.on_ringing(&payload),
            SignalingMessage::Accepted(payload) => {
                let result = if payload.rejoin {
                    controller.on_rejoined(&payload.user_id).await
                } else {
                    controller.on_accepted(&payload.user_id).await
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Call failed on accept");
                }
            }
            SignalingMessage::Rejected(payload) => controller.on_rejected(&payload.user_id).await,
            SignalingMessage::Ended(_) => controller.on_ended(&from).await,
            SignalingMessage::Missed(_) => controller.on_missed().await,
            SignalingMessage::Signal(envelope) => controller.on_signal(&from, envelope).await,
        }
        self.settle(&mut controller).await;
    }

    async fn handle_unknown_call(&self, from: UserId, message: SignalingMessage) {
        match message {
            SignalingMessage::Ringing(payload) => {
                let local = &self.inner.local_user;
                if !payload.callee_ids.contains(local) || &payload.caller_id == local {
                    tracing::debug!(from = %from, "Ringing not addressed to this user");
                    return;
                }
                if self.inner.recovery.is_eligible(&payload.call_id).await {
                    tracing::debug!("Ringing for a rejoin-eligible call ignored");
                    return;
                }
                let mut registry = self.inner.registry.write();
                if registry.finished.contains(&payload.call_id) {
                    tracing::debug!("Ringing for a finished call ignored");
                    return;
                }
                if registry.chat_busy(&payload.chat_id) {
                    tracing::info!(chat_id = %payload.chat_id, "Busy, incoming call dropped");
                    return;
                }
                let session = CallSession::new(
                    payload.call_id.clone(),
                    payload.chat_id.clone(),
                    payload.call_type,
                    payload.caller_id,
                    payload.callee_ids,
                )
                .with_metadata(payload.metadata);
                let controller = CallSessionController::incoming(&self.inner.ctx, session);
                registry.insert(
                    payload.call_id,
                    payload.chat_id,
                    Arc::new(Mutex::new(controller)),
                );
                tracing::info!(caller = %from, "Incoming call");
            }
            SignalingMessage::Ended(reference) => {
                if self.inner.recovery.clear(&reference.call_id).await {
                    tracing::info!("Rejoin-eligible call ended remotely");
                    let _ = self.inner.event_sender.send(CallEvent::CallEnded {
                        call_id: reference.call_id,
                        outcome: CallOutcome::Ended,
                    });
                }
            }
            other => {
                tracing::debug!(from = %from, event = other.event_name(), "Message for unknown call dropped");
            }
        }
    }
}

/// Builder for [`CallClient`]
pub struct CallClientBuilder {
    local_user: UserId,
    transport: Arc<dyn SignalingTransport>,
    config: ClientConfig,
    backend: Option<Arc<dyn CallBackend>>,
    media_transport: Option<Arc<dyn MediaTransport>>,
    capture: Option<Arc<dyn CaptureDevice>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl CallClientBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local_user: impl Into<UserId>, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            local_user: local_user.into(),
            transport,
            config: ClientConfig::default(),
            backend: None,
            media_transport: None,
            capture: None,
            store: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a collaborator backend (default: [`LocalCallBackend`] with no chats)
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn CallBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a peer link factory (default: [`LoopbackMediaTransport`])
    #[must_use]
    pub fn with_media_transport(mut self, transport: Arc<dyn MediaTransport>) -> Self {
        self.media_transport = Some(transport);
        self
    }

    /// Use a capture device (default: [`SyntheticCaptureDevice`])
    #[must_use]
    pub fn with_capture_device(mut self, capture: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Use a session store (default: file store if configured, else memory)
    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the client
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the user id is empty
    pub fn build(self) -> Result<CallClient, ConfigError> {
        self.config.validate()?;
        if self.local_user.is_empty() {
            return Err(ConfigError::Invalid("local user id is empty".to_string()));
        }

        let store = match (self.store, &self.config.session_store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileSessionStore::new(path.clone())) as Arc<dyn SessionStore>,
            (None, None) => Arc::new(MemorySessionStore::new()),
        };
        let media_transport = self.media_transport.unwrap_or_else(|| {
            Arc::new(LoopbackMediaTransport::new(self.local_user.clone()))
        });
        let capture = self
            .capture
            .unwrap_or_else(|| Arc::new(SyntheticCaptureDevice::new()));
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(LocalCallBackend::new()));

        let signaling = Arc::new(SignalingChannel::new(self.transport));
        let (event_sender, _) = broadcast::channel(self.config.event_channel_capacity);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let ctx = ControllerContext {
            local_user: self.local_user.clone(),
            signaling: signaling.clone(),
            media_transport,
            capture,
            peer_events: peer_tx,
            events: event_sender.clone(),
            max_pending_ice: self.config.max_pending_ice_candidates,
        };

        tracing::debug!(user = %self.local_user, "Call client built");
        Ok(CallClient {
            inner: Arc::new(ClientInner {
                local_user: self.local_user,
                config: self.config,
                signaling,
                backend,
                ctx,
                recovery: RecoveryCoordinator::new(store),
                registry: RwLock::new(Registry::default()),
                event_sender,
                peer_events: parking_lot::Mutex::new(Some(peer_rx)),
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::{CallRef, RingingPayload};
    use crate::transport::MemoryRelay;

    fn client(relay: &MemoryRelay, user: &str) -> CallClient {
        let backend = LocalCallBackend::new().with_chat("team", ["alice", "bob", "carol"]);
        CallClient::builder(user, Arc::new(relay.connect(UserId::new(user))))
            .with_backend(Arc::new(backend))
            .build()
            .unwrap()
    }

    fn ringing(call: &str, callees: &[&str]) -> SignalingMessage {
        SignalingMessage::Ringing(RingingPayload {
            call_id: CallId::new(call),
            chat_id: ChatId::new("team"),
            caller_id: UserId::new("alice"),
            callee_ids: callees.iter().map(|c| UserId::new(*c)).collect(),
            call_type: CallType::Audio,
            metadata: Default::default(),
        })
    }

    #[test]
    fn test_builder_rejects_empty_user() {
        let relay = MemoryRelay::new();
        let result = CallClient::builder("", Arc::new(relay.connect(UserId::new("")))).build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_initiate_rings_chat_members() {
        let relay = MemoryRelay::new();
        let alice = client(&relay, "alice");

        let call_id = alice
            .initiate_call(ChatId::new("team"), CallType::Audio, None)
            .await
            .unwrap();
        assert_eq!(alice.active_calls(), vec![call_id.clone()]);
        assert_eq!(alice.phase(&call_id).await, Some(CallPhase::RingingOutgoing));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let rung: Vec<_> = relay.history().into_iter().map(|m| m.to.to_string()).collect();
        assert_eq!(rung, vec!["bob".to_string(), "carol".to_string()]);

        assert!(matches!(
            alice.initiate_call(ChatId::new("team"), CallType::Audio, None).await,
            Err(CallError::CallInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_initiate_returns_before_ringing_is_sent() {
        let relay = MemoryRelay::new();
        let alice = client(&relay, "alice");

        let call_id = alice
            .initiate_call(ChatId::new("team"), CallType::Audio, None)
            .await
            .unwrap();
        alice.end_call(&call_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let history = relay.history();
        assert!(!history.is_empty());
        assert!(history
            .iter()
            .all(|m| matches!(m.message, SignalingMessage::Ended(_))));
    }

    #[tokio::test]
    async fn test_initiate_without_callees() {
        let relay = MemoryRelay::new();
        let alice = client(&relay, "alice");
        let result = alice
            .initiate_call(ChatId::new("team"), CallType::Audio, Some(UserId::new("alice")))
            .await;
        assert!(matches!(result, Err(CallError::NoCallees(_))));
        assert!(alice.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_ringing_creates_controller_once() {
        let relay = MemoryRelay::new();
        let bob = client(&relay, "bob");
        let mut events = bob.subscribe_events();

        bob.handle_message(UserId::new("alice"), ringing("c1", &["bob"])).await;
        bob.handle_message(UserId::new("alice"), ringing("c1", &["bob"])).await;
        assert_eq!(bob.active_calls(), vec![CallId::new("c1")]);
        assert!(matches!(events.try_recv().unwrap(), CallEvent::IncomingCall { .. }));

        // busy in this chat
        bob.handle_message(UserId::new("alice"), ringing("c2", &["bob"])).await;
        assert_eq!(bob.active_calls().len(), 1);

        // not addressed to bob
        bob.handle_message(UserId::new("alice"), ringing("c3", &["carol"])).await;
        assert_eq!(bob.active_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_call_not_resurrected() {
        let relay = MemoryRelay::new();
        let bob = client(&relay, "bob");

        bob.handle_message(UserId::new("alice"), ringing("c1", &["bob"])).await;
        bob.reject_call(&CallId::new("c1")).await.unwrap();
        assert!(bob.active_calls().is_empty());

        bob.handle_message(UserId::new("alice"), ringing("c1", &["bob"])).await;
        bob.handle_message(
            UserId::new("alice"),
            SignalingMessage::Ended(CallRef {
                call_id: CallId::new("c1"),
            }),
        )
        .await;
        assert!(bob.active_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_call_operations_are_noops() {
        let relay = MemoryRelay::new();
        let bob = client(&relay, "bob");
        let unknown = CallId::new("nope");

        bob.accept_call(&unknown, MediaConstraints::audio_only()).await.unwrap();
        bob.reject_call(&unknown).await.unwrap();
        bob.end_call(&unknown).await.unwrap();
        assert!(matches!(
            bob.set_muted(&unknown, true).await,
            Err(CallError::CallNotFound(_))
        ));
        assert!(relay.history().is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let relay = MemoryRelay::new();
        let bob = client(&relay, "bob");
        let handle = bob.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(bob.run().await, Err(CallError::InvalidState)));
        relay.disconnect(&UserId::new("bob"));
        assert!(handle.await.unwrap().is_ok());
    }
}
