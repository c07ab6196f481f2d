//! Signaling transport implementations
//!
//! - [`MemoryRelay`] routes messages between clients living in one process
//!   (tests, demos, embedding several clients behind one server task).
//! - [`WebSocketSignalingTransport`] talks to a relay over a persistent socket.

use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::types::UserId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

type Inbound = (UserId, SignalingMessage);

/// A message routed through a [`MemoryRelay`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Sender
    pub from: UserId,
    /// Recipient
    pub to: UserId,
    /// Payload
    pub message: SignalingMessage,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<UserId, mpsc::UnboundedSender<Inbound>>,
    history: Vec<RoutedMessage>,
}

/// In-process signaling relay
///
/// Each registered user gets one FIFO queue, so messages from a given sender
/// reach a given recipient in send order. Messages for users that are not
/// registered are dropped, like a server would for offline clients.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` and return its transport
    ///
    /// Registering a user again replaces the previous connection, whose
    /// receiver then reports [`SignalingError::Closed`].
    #[must_use]
    pub fn connect(&self, user: UserId) -> MemorySignalingTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().clients.insert(user.clone(), tx);
        tracing::debug!(user = %user, "Client registered with memory relay");
        MemorySignalingTransport {
            user,
            relay: self.clone(),
            inbound: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        }
    }

    /// Unregister `user`
    pub fn disconnect(&self, user: &UserId) {
        self.state.lock().clients.remove(user);
    }

    /// Every message routed so far
    #[must_use]
    pub fn history(&self) -> Vec<RoutedMessage> {
        self.state.lock().history.clone()
    }

    /// Forget the routing history
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    fn route(&self, from: &UserId, to: &UserId, message: SignalingMessage) {
        let mut state = self.state.lock();
        state.history.push(RoutedMessage {
            from: from.clone(),
            to: to.clone(),
            message: message.clone(),
        });
        let delivered = state
            .clients
            .get(to)
            .is_some_and(|tx| tx.send((from.clone(), message)).is_ok());
        if !delivered {
            tracing::trace!(to = %to, "Recipient offline, message dropped");
        }
    }
}

/// One client's end of a [`MemoryRelay`]
pub struct MemorySignalingTransport {
    user: UserId,
    relay: MemoryRelay,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    connected: AtomicBool,
}

impl MemorySignalingTransport {
    /// Local user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.relay.route(&self.user, to, message);
        Ok(())
    }

    async fn receive(&self) -> Result<(UserId, SignalingMessage), SignalingError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Frame sent by a client to the WebSocket relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    /// First frame on a connection
    Register {
        /// User owning this socket
        register: UserId,
    },
    /// Forward `message` to `to`
    Forward {
        /// Recipient
        to: UserId,
        /// Payload
        message: SignalingMessage,
    },
}

/// Frame delivered by the WebSocket relay to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Original sender
    pub from: UserId,
    /// Payload
    pub message: SignalingMessage,
}

/// Signaling over a persistent WebSocket to a relay server
///
/// One socket per client, so per-pair ordering is whatever the relay
/// preserves (the bundled relay forwards in arrival order).
pub struct WebSocketSignalingTransport {
    user: UserId,
    outbound: mpsc::UnboundedSender<String>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketSignalingTransport {
    /// Connect to `url` and register as `user`
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be opened or registration fails
    #[tracing::instrument(skip_all, fields(url = %url, user = %user))]
    pub async fn connect(url: &str, user: UserId) -> Result<Self, SignalingError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalingError::TransportError(format!("connect failed: {}", e)))?;
        let (mut sink, mut stream) = socket.split();

        let register = serde_json::to_string(&ClientFrame::Register {
            register: user.clone(),
        })?;
        sink.send(Message::Text(register.into()))
            .await
            .map_err(|e| SignalingError::TransportError(format!("register failed: {}", e)))?;

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
            let _ = sink.close().await;
        });

        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<RelayFrame>(text.as_str()) {
                            Ok(frame) => {
                                if inbound_tx.send((frame.from, frame.message)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Undecodable relay frame"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            tracing::info!("Signaling socket closed");
        });

        tracing::info!("Signaling socket connected");
        Ok(Self {
            user,
            outbound: outbound_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            connected,
            tasks: vec![writer, reader],
        })
    }

    /// Local user
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

impl Drop for WebSocketSignalingTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignalingTransport {
    async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        // Enforces the size limit on the payload before framing.
        message.to_wire()?;
        let frame = serde_json::to_string(&ClientFrame::Forward {
            to: to.clone(),
            message,
        })?;
        self.outbound
            .send(frame)
            .map_err(|_| SignalingError::Closed)
    }

    async fn receive(&self) -> Result<(UserId, SignalingMessage), SignalingError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::CallRef;
    use crate::types::CallId;

    fn ended(id: &str) -> SignalingMessage {
        SignalingMessage::Ended(CallRef {
            call_id: CallId::new(id),
        })
    }

    #[tokio::test]
    async fn test_memory_relay_preserves_order() {
        let relay = MemoryRelay::new();
        let alice = relay.connect(UserId::new("alice"));
        let bob = relay.connect(UserId::new("bob"));

        for i in 0..5 {
            alice
                .send(&UserId::new("bob"), ended(&format!("c{}", i)))
                .await
                .unwrap();
        }
        for i in 0..5 {
            let (from, msg) = bob.receive().await.unwrap();
            assert_eq!(from, UserId::new("alice"));
            assert_eq!(msg.call_id(), &CallId::new(format!("c{}", i)));
        }
        assert_eq!(relay.history().len(), 5);
    }

    #[tokio::test]
    async fn test_memory_relay_drops_for_offline_users() {
        let relay = MemoryRelay::new();
        let alice = relay.connect(UserId::new("alice"));
        alice.send(&UserId::new("nobody"), ended("c1")).await.unwrap();
        assert_eq!(relay.history().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_receiver() {
        let relay = MemoryRelay::new();
        let first = relay.connect(UserId::new("bob"));
        let _second = relay.connect(UserId::new("bob"));
        assert!(matches!(first.receive().await, Err(SignalingError::Closed)));
    }

    #[tokio::test]
    async fn test_disconnected_transport_refuses_send() {
        let relay = MemoryRelay::new();
        let alice = relay.connect(UserId::new("alice"));
        alice.set_connected(false);
        assert!(matches!(
            alice.send(&UserId::new("bob"), ended("c1")).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[test]
    fn test_client_frames() {
        let register: ClientFrame = serde_json::from_str(r#"{"register":"alice"}"#).unwrap();
        assert_eq!(
            register,
            ClientFrame::Register {
                register: UserId::new("alice")
            }
        );
        let forward = serde_json::to_value(ClientFrame::Forward {
            to: UserId::new("bob"),
            message: ended("c1"),
        })
        .unwrap();
        assert_eq!(forward["to"], "bob");
        assert_eq!(forward["message"]["event"], "call:ended");
    }
}
