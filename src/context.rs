//! Conversation-context boundary.
//!
//! The dispatch core consumes recent conversation messages to make backend
//! calls and cache keys context-aware; it never owns or persists conversation
//! state. The owning store lives behind [`ContextProvider`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One conversation message in the role/content shape the chat-completion
/// APIs expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// `"user"`, `"assistant"` or `"system"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ContextMessage {
    /// A user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    /// An assistant-role message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Supplies the recent conversation for a user, capped at the store's
/// configured maximum.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Ordered messages, oldest first.
    async fn context_for(&self, user_id: u64) -> Vec<ContextMessage>;
}

/// Provider that always returns an empty context.
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn context_for(&self, _user_id: u64) -> Vec<ContextMessage> {
        Vec::new()
    }
}

/// Minimal in-memory conversation store.
///
/// Suitable for single-process deployments and tests; a real deployment
/// plugs its conversation persistence in behind [`ContextProvider`] instead.
pub struct MemoryContextStore {
    max_messages: usize,
    conversations: DashMap<u64, VecDeque<ContextMessage>>,
}

impl MemoryContextStore {
    /// Create a store keeping at most `max_messages` per user.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            conversations: DashMap::new(),
        }
    }

    /// Append a message to a user's conversation, dropping the oldest when
    /// over the cap.
    pub fn push(&self, user_id: u64, message: ContextMessage) {
        let mut entry = self.conversations.entry(user_id).or_default();
        entry.push_back(message);
        while entry.len() > self.max_messages {
            entry.pop_front();
        }
    }

    /// Forget a user's conversation.
    pub fn clear(&self, user_id: u64) {
        self.conversations.remove(&user_id);
    }
}

#[async_trait]
impl ContextProvider for MemoryContextStore {
    async fn context_for(&self, user_id: u64) -> Vec<ContextMessage> {
        self.conversations
            .get(&user_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_user_has_empty_context() {
        let store = MemoryContextStore::new(10);
        assert!(store.context_for(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_push_preserves_order() {
        let store = MemoryContextStore::new(10);
        store.push(1, ContextMessage::user("first"));
        store.push(1, ContextMessage::assistant("second"));

        let ctx = store.context_for(1).await;
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].content, "first");
        assert_eq!(ctx[1].content, "second");
    }

    #[tokio::test]
    async fn test_cap_drops_oldest() {
        let store = MemoryContextStore::new(3);
        for i in 0..5 {
            store.push(1, ContextMessage::user(format!("m{i}")));
        }

        let ctx = store.context_for(1).await;
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0].content, "m2");
        assert_eq!(ctx[2].content, "m4");
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let store = MemoryContextStore::new(10);
        store.push(1, ContextMessage::user("mine"));
        assert!(store.context_for(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_forgets_conversation() {
        let store = MemoryContextStore::new(10);
        store.push(1, ContextMessage::user("hello"));
        store.clear(1);
        assert!(store.context_for(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_context_provider_is_empty() {
        assert!(NoContext.context_for(42).await.is_empty());
    }
}
