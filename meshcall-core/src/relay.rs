//! WebSocket signaling relay
//!
//! Minimal server counterpart of [`WebSocketSignalingTransport`]: each client
//! registers its user id with the first frame, then every
//! [`ClientFrame::Forward`] is delivered to the named user as a
//! [`RelayFrame`]. Frames for users that are not connected are dropped.
//!
//! [`WebSocketSignalingTransport`]: crate::transport::WebSocketSignalingTransport

use crate::signaling::SignalingError;
use crate::transport::{ClientFrame, RelayFrame};
use crate::types::UserId;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Routes signaling frames between connected users
#[derive(Clone, Default)]
pub struct SignalingRelay {
    clients: Arc<RwLock<HashMap<UserId, mpsc::UnboundedSender<String>>>>,
}

impl SignalingRelay {
    /// Create a relay with no clients
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Users currently registered
    #[must_use]
    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.clients.read().keys().cloned().collect();
        users.sort();
        users
    }

    /// Accept connections from `listener` until it fails
    ///
    /// # Errors
    ///
    /// Returns error if accepting a connection fails
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SignalingError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Signaling relay listening");
        }
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SignalingError::TransportError(format!("accept failed: {}", e)))?;
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream).await {
                    tracing::warn!(peer_addr = %addr, error = %e, "Relay connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), SignalingError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| SignalingError::TransportError(format!("handshake failed: {}", e)))?;
        let (mut sink, mut source) = ws_stream.split();

        let user = match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str())? {
                ClientFrame::Register { register } if !register.is_empty() => register,
                _ => {
                    return Err(SignalingError::Invalid(
                        "first frame must register a user".to_string(),
                    ))
                }
            },
            _ => return Err(SignalingError::Closed),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if self
            .clients
            .write()
            .insert(user.clone(), tx.clone())
            .is_some()
        {
            tracing::info!(user = %user, "Client re-registered, previous socket replaced");
        } else {
            tracing::info!(user = %user, "Client registered");
        }

        let forward = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.route(&user, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(user = %user, error = %e, "Relay read failed");
                    break;
                }
            }
        }

        {
            let mut clients = self.clients.write();
            if clients.get(&user).is_some_and(|current| current.same_channel(&tx)) {
                clients.remove(&user);
            }
        }
        forward.abort();
        tracing::info!(user = %user, "Client disconnected");
        Ok(())
    }

    fn route(&self, from: &UserId, text: &str) {
        let (to, message) = match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Forward { to, message }) => (to, message),
            Ok(ClientFrame::Register { .. }) => {
                tracing::debug!(user = %from, "Duplicate register frame ignored");
                return;
            }
            Err(e) => {
                tracing::warn!(user = %from, error = %e, "Undecodable client frame");
                return;
            }
        };
        if let Err(e) = message.validate() {
            tracing::warn!(user = %from, error = %e, "Invalid message not relayed");
            return;
        }
        let frame = match serde_json::to_string(&RelayFrame {
            from: from.clone(),
            message,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode relay frame");
                return;
            }
        };
        let delivered = self
            .clients
            .read()
            .get(&to)
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            tracing::trace!(from = %from, to = %to, "Recipient offline, frame dropped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::{CallRef, SignalingMessage, SignalingTransport};
    use crate::transport::WebSocketSignalingTransport;
    use crate::types::CallId;
    use std::time::Duration;

    async fn wait_for_users(relay: &SignalingRelay, count: usize) {
        for _ in 0..100 {
            if relay.connected_users().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_between_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let relay = SignalingRelay::new();
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let alice = WebSocketSignalingTransport::connect(&url, UserId::new("alice"))
            .await
            .unwrap();
        let bob = WebSocketSignalingTransport::connect(&url, UserId::new("bob"))
            .await
            .unwrap();
        wait_for_users(&relay, 2).await;
        assert_eq!(
            relay.connected_users(),
            vec![UserId::new("alice"), UserId::new("bob")]
        );

        let message = SignalingMessage::Ended(CallRef {
            call_id: CallId::new("c1"),
        });
        alice.send(&UserId::new("bob"), message.clone()).await.unwrap();

        let (from, received) = tokio::time::timeout(Duration::from_secs(5), bob.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, UserId::new("alice"));
        assert_eq!(received, message);

        drop(bob);
        wait_for_users(&relay, 1).await;
        assert_eq!(relay.connected_users(), vec![UserId::new("alice")]);
    }
}
