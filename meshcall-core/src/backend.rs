//! Collaborator API used by the call client
//!
//! Chat membership, call bookkeeping and display metadata live outside the
//! core. The client only needs the narrow [`CallBackend`] surface; its
//! answers never change protocol state.

use crate::types::{CallId, CallMetadata, CallType, ChatId, UserId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Chat is not known to the backend
    #[error("Unknown chat: {0}")]
    UnknownChat(String),

    /// Request refused or failed
    #[error("Backend request failed: {0}")]
    Request(String),
}

/// Request to register a new call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    /// Chat to call in
    pub chat_id: ChatId,
    /// Audio or video
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Single callee for 1:1 or targeted group calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
}

/// Notification that the local user joined a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptCallRequest {
    /// Call joined
    pub call_id: CallId,
    /// Audio enabled
    pub audio: bool,
    /// Video enabled
    pub video: bool,
}

/// Call bookkeeping and chat membership service
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Register a call and obtain its identifier
    async fn prepare_and_start_call(
        &self,
        request: StartCallRequest,
    ) -> Result<CallId, BackendError>;

    /// Record that the local user joined
    async fn accept_and_start(&self, request: AcceptCallRequest) -> Result<(), BackendError>;

    /// Record that the local user declined
    async fn reject_call_api(&self, call_id: &CallId) -> Result<(), BackendError>;

    /// Record that the local user left
    async fn end_call_api(&self, call_id: &CallId) -> Result<(), BackendError>;

    /// Members of a chat, including the local user
    async fn chat_members(&self, chat_id: &ChatId) -> Result<Vec<UserId>, BackendError>;

    /// Display information for a call placed by `caller`
    async fn call_metadata(
        &self,
        chat_id: &ChatId,
        caller: &UserId,
    ) -> Result<CallMetadata, BackendError>;
}

/// In-process backend with a static membership table
///
/// Call ids are generated locally and bookkeeping calls only log.
#[derive(Default)]
pub struct LocalCallBackend {
    chats: RwLock<HashMap<ChatId, Vec<UserId>>>,
    names: RwLock<HashMap<UserId, String>>,
}

impl LocalCallBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the members of a chat
    #[must_use]
    pub fn with_chat(
        self,
        chat_id: impl Into<ChatId>,
        members: impl IntoIterator<Item = impl Into<UserId>>,
    ) -> Self {
        self.set_chat(chat_id, members);
        self
    }

    /// Define or replace the members of a chat
    pub fn set_chat(
        &self,
        chat_id: impl Into<ChatId>,
        members: impl IntoIterator<Item = impl Into<UserId>>,
    ) {
        self.chats
            .write()
            .insert(chat_id.into(), members.into_iter().map(Into::into).collect());
    }

    /// Set the display name shown for `user`'s calls
    pub fn set_display_name(&self, user: impl Into<UserId>, name: impl Into<String>) {
        self.names.write().insert(user.into(), name.into());
    }
}

#[async_trait]
impl CallBackend for LocalCallBackend {
    async fn prepare_and_start_call(
        &self,
        request: StartCallRequest,
    ) -> Result<CallId, BackendError> {
        if !self.chats.read().contains_key(&request.chat_id) {
            return Err(BackendError::UnknownChat(request.chat_id.to_string()));
        }
        let call_id = CallId::generate();
        tracing::debug!(call_id = %call_id, chat_id = %request.chat_id, "Call registered");
        Ok(call_id)
    }

    async fn accept_and_start(&self, request: AcceptCallRequest) -> Result<(), BackendError> {
        tracing::debug!(call_id = %request.call_id, audio = request.audio, video = request.video, "Call join recorded");
        Ok(())
    }

    async fn reject_call_api(&self, call_id: &CallId) -> Result<(), BackendError> {
        tracing::debug!(call_id = %call_id, "Call decline recorded");
        Ok(())
    }

    async fn end_call_api(&self, call_id: &CallId) -> Result<(), BackendError> {
        tracing::debug!(call_id = %call_id, "Call end recorded");
        Ok(())
    }

    async fn chat_members(&self, chat_id: &ChatId) -> Result<Vec<UserId>, BackendError> {
        self.chats
            .read()
            .get(chat_id)
            .cloned()
            .ok_or_else(|| BackendError::UnknownChat(chat_id.to_string()))
    }

    async fn call_metadata(
        &self,
        _chat_id: &ChatId,
        caller: &UserId,
    ) -> Result<CallMetadata, BackendError> {
        Ok(CallMetadata {
            display_name: self.names.read().get(caller).cloned(),
            avatar_url: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_and_metadata() {
        let backend = LocalCallBackend::new().with_chat("team", ["alice", "bob", "carol"]);
        backend.set_display_name("alice", "Alice");

        let members = backend.chat_members(&ChatId::new("team")).await.unwrap();
        assert_eq!(members.len(), 3);

        let metadata = backend
            .call_metadata(&ChatId::new("team"), &UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(metadata.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_unknown_chat() {
        let backend = LocalCallBackend::new();
        let request = StartCallRequest {
            chat_id: ChatId::new("nope"),
            call_type: CallType::Audio,
            target_user_id: None,
        };
        assert_eq!(
            backend.prepare_and_start_call(request).await,
            Err(BackendError::UnknownChat("nope".to_string()))
        );
    }
}
