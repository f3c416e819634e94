//! The conversation a session works against.

use super::tokens::estimate_message_tokens;
use crate::{Message, MessageRole, Metadata};
use serde::{Deserialize, Serialize};

/// Ordered conversation messages bounded by a token budget.
///
/// Message order is conversational order and is never rearranged. The token
/// count is recomputed from the messages on every call to
/// [`estimated_tokens`](Self::estimated_tokens), so it can never go stale
/// across a mutation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationContext {
    messages: Vec<Message>,
    max_tokens: usize,
    #[serde(default)]
    metadata: Metadata,
}

impl ConversationContext {
    /// Create an empty context with the given token budget.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            metadata: Metadata::new(),
        }
    }

    /// Create a context pre-populated with messages.
    pub fn with_messages(max_tokens: usize, messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens,
            metadata: Metadata::new(),
        }
    }

    /// Build a new context with the same budget and metadata but different
    /// messages. Compaction uses this to leave the original untouched.
    pub fn derive(&self, messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: self.max_tokens,
            metadata: self.metadata.clone(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Estimated tokens across all messages.
    pub fn estimated_tokens(&self) -> usize {
        estimate_message_tokens(&self.messages)
    }

    /// Messages with the system role, in order.
    pub fn system_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == MessageRole::System)
    }

    /// Count of messages with the given role.
    pub fn count_role(&self, role: MessageRole) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == MessageRole::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_follow_mutation() {
        let mut ctx = ConversationContext::new(1000);
        assert_eq!(ctx.estimated_tokens(), 0);
        ctx.push(Message::user("a".repeat(40)));
        assert_eq!(ctx.estimated_tokens(), 10);
        ctx.push(Message::assistant("b".repeat(40)));
        assert_eq!(ctx.estimated_tokens(), 20);
    }

    #[test]
    fn derive_keeps_budget_and_metadata() {
        let mut ctx = ConversationContext::with_messages(
            500,
            vec![Message::system("sys"), Message::user("hi")],
        );
        ctx.metadata_mut().insert("session".into(), "abc".into());

        let derived = ctx.derive(vec![Message::system("sys")]);
        assert_eq!(derived.max_tokens(), 500);
        assert_eq!(derived.metadata().get("session").unwrap(), "abc");
        assert_eq!(derived.len(), 1);
        // Original untouched.
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn role_queries() {
        let ctx = ConversationContext::with_messages(
            500,
            vec![
                Message::system("a"),
                Message::user("first"),
                Message::assistant("b"),
                Message::user("second"),
            ],
        );
        assert_eq!(ctx.system_messages().count(), 1);
        assert_eq!(ctx.count_role(MessageRole::User), 2);
        assert_eq!(ctx.last_user_message().unwrap().content, "second");
    }
}
