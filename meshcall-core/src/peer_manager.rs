//! Mesh peer-link management
//!
//! One [`PeerConnectionManager`] per call keeps exactly one link per remote
//! participant. Every link is driven by its own task consuming a FIFO queue
//! of commands (make offer, remote SDP, remote ICE) merged with the link's
//! transport events, so operations on one link never interleave while links
//! progress independently of each other.
//!
//! # Negotiation rules
//!
//! - Offers are only created in `stable`; a later attempt is dropped.
//! - A remote offer is only applied in `stable`, a remote answer only in
//!   `have-local-offer`; anything else is ignored without touching the link.
//! - An offer that collides with a local offer still waiting for its answer
//!   is ignored on both sides; the initiator rule keeps that from happening
//!   in a well-behaved mesh.
//! - Remote ICE candidates that arrive before a remote description are
//!   queued (bounded) and flushed once it is applied.
//! - Any negotiation error closes that single link.

use crate::media::LocalTrack;
use crate::peer::{LinkHandle, MediaTransport, NegotiationError, TransportEvent};
use crate::signaling::{
    IceCandidate, SdpKind, SessionDescription, SignalData, SignalEnvelope, SignalingChannel,
    SignalingMessage,
};
use crate::types::{
    CallId, ChatId, ConnectionState, MediaKind, NegotiationRole, SignalingState, UserId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events reported by link tasks to the owner of the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Connection state of a link changed
    StateChanged {
        /// Call the link belongs to
        call_id: CallId,
        /// Remote user
        user_id: UserId,
        /// Link generation
        link_id: u64,
        /// New state
        state: ConnectionState,
    },
    /// A remote track arrived on a link
    TrackAdded {
        /// Call the link belongs to
        call_id: CallId,
        /// Remote user
        user_id: UserId,
        /// Link generation
        link_id: u64,
        /// Track kind
        kind: MediaKind,
    },
    /// A link failed and was closed
    Failed {
        /// Call the link belongs to
        call_id: CallId,
        /// Remote user
        user_id: UserId,
        /// Link generation
        link_id: u64,
        /// Cause
        error: NegotiationError,
    },
}

impl PeerEvent {
    /// Call the event belongs to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::StateChanged { call_id, .. }
            | Self::TrackAdded { call_id, .. }
            | Self::Failed { call_id, .. } => call_id,
        }
    }

    /// Remote user and link generation
    #[must_use]
    pub fn link(&self) -> (&UserId, u64) {
        match self {
            Self::StateChanged {
                user_id, link_id, ..
            }
            | Self::TrackAdded {
                user_id, link_id, ..
            }
            | Self::Failed {
                user_id, link_id, ..
            } => (user_id, *link_id),
        }
    }
}

/// Summary of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Remote user
    pub remote_user_id: UserId,
    /// Local role
    pub role: NegotiationRole,
    /// Current negotiation state
    pub signaling_state: SignalingState,
}

#[derive(Debug)]
enum LinkCommand {
    MakeOffer,
    RemoteSdp(SessionDescription),
    RemoteIce(IceCandidate),
}

struct PeerLink {
    link_id: u64,
    role: NegotiationRole,
    commands: mpsc::UnboundedSender<LinkCommand>,
    handle: Arc<dyn LinkHandle>,
    task: JoinHandle<()>,
}

/// Peer link manager for one call
pub struct PeerConnectionManager {
    call_id: CallId,
    chat_id: ChatId,
    local_user: UserId,
    transport: Arc<dyn MediaTransport>,
    signaling: Arc<SignalingChannel>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    max_pending_ice: usize,
    links: HashMap<UserId, PeerLink>,
    next_link_id: u64,
}

impl PeerConnectionManager {
    /// Create a manager for `call_id`
    #[must_use]
    pub fn new(
        call_id: CallId,
        chat_id: ChatId,
        local_user: UserId,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<SignalingChannel>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        max_pending_ice: usize,
    ) -> Self {
        Self {
            call_id,
            chat_id,
            local_user,
            transport,
            signaling,
            peer_events,
            max_pending_ice,
            links: HashMap::new(),
            next_link_id: 0,
        }
    }

    /// Create an offerer link to `remote` and send the initial offer
    ///
    /// An existing link to `remote` is replaced.
    ///
    /// # Errors
    ///
    /// Returns error if `remote` is invalid or the link cannot be created
    #[tracing::instrument(skip(self, tracks), fields(call_id = %self.call_id, remote = %remote))]
    pub async fn connect_to(
        &mut self,
        remote: &UserId,
        tracks: &[LocalTrack],
    ) -> Result<u64, NegotiationError> {
        let link_id = self.open(remote, NegotiationRole::Offerer, tracks).await?;
        if let Some(link) = self.links.get(remote) {
            let _ = link.commands.send(LinkCommand::MakeOffer);
        }
        tracing::info!(link_id, "Offerer link created");
        Ok(link_id)
    }

    /// Route a `call:signal` payload from `from` to its link
    ///
    /// An offer from a user without a link creates an answerer link. Answers
    /// and candidates for unknown links are dropped. Returns the id of a link
    /// created by this call, if any.
    ///
    /// # Errors
    ///
    /// Returns error if an answerer link cannot be created
    pub async fn handle_signal(
        &mut self,
        from: &UserId,
        data: SignalData,
        tracks: &[LocalTrack],
    ) -> Result<Option<u64>, NegotiationError> {
        let (command, is_offer) = match data {
            SignalData::Sdp { sdp } => {
                let is_offer = sdp.kind == SdpKind::Offer;
                (LinkCommand::RemoteSdp(sdp), is_offer)
            }
            SignalData::Ice { candidate } => (LinkCommand::RemoteIce(candidate), false),
        };

        let mut created = None;
        if !self.links.contains_key(from) {
            if !is_offer {
                tracing::debug!(call_id = %self.call_id, from = %from, "Signal for unknown link dropped");
                return Ok(None);
            }
            created = Some(self.open(from, NegotiationRole::Answerer, tracks).await?);
            tracing::info!(call_id = %self.call_id, remote = %from, "Answerer link created");
        }
        if let Some(link) = self.links.get(from) {
            let _ = link.commands.send(command);
        }
        Ok(created)
    }

    /// Remove and close the link to `remote`
    pub async fn remove(&mut self, remote: &UserId) -> bool {
        match self.links.remove(remote) {
            Some(link) => {
                link.task.abort();
                link.handle.close().await;
                tracing::debug!(call_id = %self.call_id, remote = %remote, "Peer link removed");
                true
            }
            None => false,
        }
    }

    /// Close every link without waiting for in-flight negotiation
    pub async fn close_all(&mut self) {
        let links: Vec<_> = self.links.drain().collect();
        for (_, link) in &links {
            link.task.abort();
        }
        for (_, link) in links {
            link.handle.close().await;
        }
    }

    /// Whether `link_id` is the live link to `remote`
    #[must_use]
    pub fn is_current(&self, remote: &UserId, link_id: u64) -> bool {
        self.links
            .get(remote)
            .is_some_and(|link| link.link_id == link_id)
    }

    /// Whether a link to `remote` exists
    #[must_use]
    pub fn has_link(&self, remote: &UserId) -> bool {
        self.links.contains_key(remote)
    }

    /// Number of open links
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Snapshot of every link
    #[must_use]
    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<_> = self
            .links
            .iter()
            .map(|(user, link)| LinkInfo {
                remote_user_id: user.clone(),
                role: link.role,
                signaling_state: link.handle.signaling_state(),
            })
            .collect();
        links.sort_by(|a, b| a.remote_user_id.cmp(&b.remote_user_id));
        links
    }

    async fn open(
        &mut self,
        remote: &UserId,
        role: NegotiationRole,
        tracks: &[LocalTrack],
    ) -> Result<u64, NegotiationError> {
        if remote.is_empty() || remote == &self.local_user {
            return Err(NegotiationError::InvalidRemoteUser);
        }
        if self.remove(remote).await {
            tracing::info!(call_id = %self.call_id, remote = %remote, "Replacing existing peer link");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = self.transport.create_link(remote, events_tx).await?;
        for track in tracks {
            if let Err(e) = handle.attach_track(track).await {
                handle.close().await;
                return Err(e);
            }
        }

        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let worker = LinkWorker {
            call_id: self.call_id.clone(),
            chat_id: self.chat_id.clone(),
            local_user: self.local_user.clone(),
            remote: remote.clone(),
            link_id,
            role,
            handle: handle.clone(),
            signaling: self.signaling.clone(),
            peer_events: self.peer_events.clone(),
            max_pending_ice: self.max_pending_ice,
            pending_ice: VecDeque::new(),
            offered: false,
        };
        let task = tokio::spawn(worker.run(commands_rx, events_rx));

        self.links.insert(
            remote.clone(),
            PeerLink {
                link_id,
                role,
                commands: commands_tx,
                handle,
                task,
            },
        );
        Ok(link_id)
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.task.abort();
        }
    }
}

struct LinkWorker {
    call_id: CallId,
    chat_id: ChatId,
    local_user: UserId,
    remote: UserId,
    link_id: u64,
    role: NegotiationRole,
    handle: Arc<dyn LinkHandle>,
    signaling: Arc<SignalingChannel>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    max_pending_ice: usize,
    pending_ice: VecDeque<IceCandidate>,
    offered: bool,
}

impl LinkWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let result = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            };
            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        remote = %self.remote,
                        error = %e,
                        "Peer link failed, closing"
                    );
                    self.handle.close().await;
                    let _ = self.peer_events.send(PeerEvent::Failed {
                        call_id: self.call_id.clone(),
                        user_id: self.remote.clone(),
                        link_id: self.link_id,
                        error: e,
                    });
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: LinkCommand) -> Result<bool, NegotiationError> {
        match command {
            LinkCommand::MakeOffer => self.make_offer().await?,
            LinkCommand::RemoteSdp(desc) => match desc.kind {
                SdpKind::Offer => self.apply_offer(desc).await?,
                SdpKind::Answer => self.apply_answer(desc).await?,
            },
            LinkCommand::RemoteIce(candidate) => self.apply_candidate(candidate).await?,
        }
        Ok(true)
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<bool, NegotiationError> {
        match event {
            TransportEvent::OfferNeeded => {
                if self.role == NegotiationRole::Offerer && self.offered {
                    self.make_offer().await?;
                } else {
                    tracing::debug!(remote = %self.remote, role = ?self.role, "Renegotiation request ignored");
                }
            }
            TransportEvent::CandidateGathered(candidate) => {
                self.send(SignalData::Ice { candidate }).await;
            }
            TransportEvent::TrackAdded { kind } => {
                let _ = self.peer_events.send(PeerEvent::TrackAdded {
                    call_id: self.call_id.clone(),
                    user_id: self.remote.clone(),
                    link_id: self.link_id,
                    kind,
                });
            }
            TransportEvent::ConnectionStateChanged(state) => {
                tracing::debug!(
                    call_id = %self.call_id,
                    remote = %self.remote,
                    state = ?state,
                    "Peer connection state changed"
                );
                let _ = self.peer_events.send(PeerEvent::StateChanged {
                    call_id: self.call_id.clone(),
                    user_id: self.remote.clone(),
                    link_id: self.link_id,
                    state,
                });
                if state.is_terminal() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn make_offer(&mut self) -> Result<(), NegotiationError> {
        let state = self.handle.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(remote = %self.remote, state = ?state, "Offer skipped, link not stable");
            return Ok(());
        }
        let offer = self.handle.create_offer().await?;
        self.handle.set_local_description(offer.clone()).await?;
        self.offered = true;
        self.send(SignalData::Sdp { sdp: offer }).await;
        Ok(())
    }

    async fn apply_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let state = self.handle.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(remote = %self.remote, state = ?state, "Remote offer ignored, link not stable");
            return Ok(());
        }
        self.handle.set_remote_description(offer).await?;
        self.flush_candidates().await?;
        let answer = self.handle.create_answer().await?;
        self.handle.set_local_description(answer.clone()).await?;
        self.send(SignalData::Sdp { sdp: answer }).await;
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let state = self.handle.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::debug!(remote = %self.remote, state = ?state, "Remote answer ignored, no local offer");
            return Ok(());
        }
        self.handle.set_remote_description(answer).await?;
        self.flush_candidates().await
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.handle.has_remote_description().await {
            return self.handle.add_ice_candidate(candidate).await;
        }
        if self.pending_ice.len() >= self.max_pending_ice {
            tracing::warn!(
                remote = %self.remote,
                limit = self.max_pending_ice,
                "Pending ICE queue full, candidate dropped"
            );
            return Ok(());
        }
        self.pending_ice.push_back(candidate);
        tracing::trace!(remote = %self.remote, queued = self.pending_ice.len(), "ICE candidate queued");
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        if !self.pending_ice.is_empty() {
            tracing::debug!(remote = %self.remote, count = self.pending_ice.len(), "Flushing queued ICE candidates");
        }
        while let Some(candidate) = self.pending_ice.pop_front() {
            self.handle.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send(&self, data: SignalData) {
        let message = SignalingMessage::Signal(SignalEnvelope {
            call_id: self.call_id.clone(),
            chat_id: self.chat_id.clone(),
            to_user_id: self.remote.clone(),
            from_user_id: self.local_user.clone(),
            data,
        });
        if let Err(e) = self.signaling.send(&self.remote, message).await {
            tracing::warn!(call_id = %self.call_id, remote = %self.remote, error = %e, "Failed to send peer signal");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackMediaTransport;
    use crate::transport::MemoryRelay;
    use std::time::Duration;

    struct Fixture {
        manager: PeerConnectionManager,
        transport: Arc<LoopbackMediaTransport>,
        relay: MemoryRelay,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn fixture(max_pending_ice: usize) -> Fixture {
        let relay = MemoryRelay::new();
        let signaling = Arc::new(SignalingChannel::new(Arc::new(
            relay.connect(UserId::new("alice")),
        )));
        let transport = Arc::new(LoopbackMediaTransport::new(UserId::new("alice")));
        let (tx, events) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(
            CallId::new("call-1"),
            ChatId::new("chat-1"),
            UserId::new("alice"),
            transport.clone(),
            signaling,
            tx,
            max_pending_ice,
        );
        Fixture {
            manager,
            transport,
            relay,
            events,
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.1 {} typ host", n, 4000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn offers_sent(relay: &MemoryRelay) -> usize {
        relay
            .history()
            .iter()
            .filter(|m| {
                matches!(&m.message, SignalingMessage::Signal(env)
                    if matches!(&env.data, SignalData::Sdp { sdp } if sdp.kind == SdpKind::Offer))
            })
            .count()
    }

    #[tokio::test]
    async fn test_connect_to_sends_one_offer() {
        let mut f = fixture(8);
        f.manager.connect_to(&UserId::new("bob"), &[]).await.unwrap();
        settle().await;

        assert_eq!(f.manager.link_count(), 1);
        assert_eq!(offers_sent(&f.relay), 1);
        let links = f.manager.links();
        assert_eq!(links[0].role, NegotiationRole::Offerer);
        assert_eq!(links[0].signaling_state, SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_rejects_self_and_empty_remote() {
        let mut f = fixture(8);
        assert_eq!(
            f.manager.connect_to(&UserId::new("alice"), &[]).await,
            Err(NegotiationError::InvalidRemoteUser)
        );
        assert_eq!(
            f.manager.connect_to(&UserId::new(""), &[]).await,
            Err(NegotiationError::InvalidRemoteUser)
        );
        assert_eq!(f.manager.link_count(), 0);
    }

    fn colliding_offer() -> SignalData {
        SignalData::Sdp {
            sdp: SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\n"),
        }
    }

    fn answers_sent(relay: &MemoryRelay) -> usize {
        relay
            .history()
            .iter()
            .filter(|m| {
                matches!(&m.message, SignalingMessage::Signal(env)
                    if matches!(&env.data, SignalData::Sdp { sdp } if sdp.kind == SdpKind::Answer))
            })
            .count()
    }

    #[tokio::test]
    async fn test_colliding_offer_from_greater_id_is_ignored() {
        let mut f = fixture(8);
        let bob = UserId::new("bob");
        let first = f.manager.connect_to(&bob, &[]).await.unwrap();
        settle().await;
        f.relay.clear_history();

        let created = f
            .manager
            .handle_signal(&bob, colliding_offer(), &[])
            .await
            .unwrap();
        settle().await;

        assert!(created.is_none());
        assert!(f.manager.is_current(&bob, first));
        let link = f.transport.link(&bob).unwrap();
        assert_eq!(link.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!link.has_remote_description().await);
        assert_eq!(answers_sent(&f.relay), 0);
    }

    #[tokio::test]
    async fn test_colliding_offer_from_smaller_id_is_ignored() {
        let mut f = fixture(8);
        let aaron = UserId::new("aaron");
        let first = f.manager.connect_to(&aaron, &[]).await.unwrap();
        settle().await;
        f.relay.clear_history();

        let created = f
            .manager
            .handle_signal(&aaron, colliding_offer(), &[])
            .await
            .unwrap();
        settle().await;

        assert!(created.is_none());
        assert!(f.manager.is_current(&aaron, first));
        let links = f.manager.links();
        assert_eq!(links[0].role, NegotiationRole::Offerer);
        assert_eq!(links[0].signaling_state, SignalingState::HaveLocalOffer);
        assert_eq!(answers_sent(&f.relay), 0);
        assert_eq!(offers_sent(&f.relay), 0);
    }

    #[tokio::test]
    async fn test_ice_before_answer_is_queued_then_flushed() {
        let mut f = fixture(8);
        let bob = UserId::new("bob");
        f.manager.connect_to(&bob, &[]).await.unwrap();
        settle().await;

        for n in 0..3 {
            f.manager
                .handle_signal(&bob, SignalData::Ice { candidate: candidate(n) }, &[])
                .await
                .unwrap();
        }
        settle().await;
        let link = f.transport.link(&bob).unwrap();
        assert!(link.remote_candidates().is_empty());

        let answer = SignalData::Sdp {
            sdp: SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0\r\n"),
        };
        f.manager.handle_signal(&bob, answer, &[]).await.unwrap();
        settle().await;

        assert_eq!(link.remote_candidates(), vec![candidate(0), candidate(1), candidate(2)]);
        assert_eq!(link.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_pending_ice_is_bounded() {
        let mut f = fixture(2);
        let bob = UserId::new("bob");
        f.manager.connect_to(&bob, &[]).await.unwrap();
        for n in 0..5 {
            f.manager
                .handle_signal(&bob, SignalData::Ice { candidate: candidate(n) }, &[])
                .await
                .unwrap();
        }
        let answer = SignalData::Sdp {
            sdp: SessionDescription::answer("v=0\r\n"),
        };
        f.manager.handle_signal(&bob, answer, &[]).await.unwrap();
        settle().await;

        let link = f.transport.link(&bob).unwrap();
        assert_eq!(link.remote_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_offer_from_unknown_user_creates_answerer() {
        let mut f = fixture(8);
        let carol = UserId::new("carol");
        let offer = SignalData::Sdp {
            sdp: SessionDescription::offer("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 0\r\n"),
        };
        let created = f.manager.handle_signal(&carol, offer, &[]).await.unwrap();
        assert!(created.is_some());
        settle().await;

        let links = f.manager.links();
        assert_eq!(links[0].role, NegotiationRole::Answerer);
        assert_eq!(links[0].signaling_state, SignalingState::Stable);
        assert_eq!(offers_sent(&f.relay), 0);

        let mut saw_video = false;
        while let Ok(event) = f.events.try_recv() {
            if let PeerEvent::TrackAdded { kind, .. } = event {
                saw_video |= kind == MediaKind::Video;
            }
        }
        assert!(saw_video);
    }

    #[tokio::test]
    async fn test_ice_for_unknown_link_is_dropped() {
        let mut f = fixture(8);
        let created = f
            .manager
            .handle_signal(&UserId::new("dave"), SignalData::Ice { candidate: candidate(1) }, &[])
            .await
            .unwrap();
        assert!(created.is_none());
        assert_eq!(f.manager.link_count(), 0);
    }

    #[tokio::test]
    async fn test_replacing_link_changes_generation() {
        let mut f = fixture(8);
        let bob = UserId::new("bob");
        let first = f.manager.connect_to(&bob, &[]).await.unwrap();
        let second = f.manager.connect_to(&bob, &[]).await.unwrap();

        assert_ne!(first, second);
        assert!(!f.manager.is_current(&bob, first));
        assert!(f.manager.is_current(&bob, second));
        assert_eq!(f.manager.link_count(), 1);
    }

    #[tokio::test]
    async fn test_renegotiation_only_for_offerer_after_first_offer() {
        let mut f = fixture(8);
        let bob = UserId::new("bob");
        f.manager.connect_to(&bob, &[]).await.unwrap();
        settle().await;
        let answer = SignalData::Sdp {
            sdp: SessionDescription::answer("v=0\r\n"),
        };
        f.manager.handle_signal(&bob, answer, &[]).await.unwrap();
        settle().await;

        f.transport.link(&bob).unwrap().request_renegotiation();
        settle().await;
        assert_eq!(offers_sent(&f.relay), 2);

        let carol = UserId::new("carol");
        let offer = SignalData::Sdp {
            sdp: SessionDescription::offer("v=0\r\n"),
        };
        f.manager.handle_signal(&carol, offer, &[]).await.unwrap();
        settle().await;
        f.transport.link(&carol).unwrap().request_renegotiation();
        settle().await;
        assert_eq!(offers_sent(&f.relay), 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut f = fixture(8);
        let bob = UserId::new("bob");
        f.manager.connect_to(&bob, &[]).await.unwrap();
        f.manager.connect_to(&UserId::new("carol"), &[]).await.unwrap();
        f.manager.close_all().await;

        assert_eq!(f.manager.link_count(), 0);
        assert_eq!(
            f.transport.link(&bob).unwrap().signaling_state(),
            SignalingState::Closed
        );
    }
}
