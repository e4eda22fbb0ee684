use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use hiwar_core::ids::ConnectionId;
use hiwar_core::messages::ChatMessage;

/// Exchanges kept per connection; the oldest is evicted beyond this.
pub const HISTORY_CAP: usize = 10;
/// Exchanges replayed into each prompt.
pub const CONTEXT_EXCHANGES: usize = 5;

pub const SYSTEM_PROMPT: &str = "أنت مساعد ذكي يتحدث العربية. كن مفيداً، دقيقاً، وودوداً في إجاباتك. استخدم لغة عربية فصيحة وسهلة الفهم.";

/// One user message and the assistant reply it produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            created_at: Utc::now(),
        }
    }

    /// Creation time as ISO-8601.
    pub fn timestamp(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Per-connection bounded conversation history.
///
/// Each key is only ever driven by its own connection, so rings are never
/// contended; the map is concurrent so the store can be shared across tasks.
#[derive(Default)]
pub struct ConversationStore {
    rings: DashMap<ConnectionId, VecDeque<Exchange>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the prompt for `new_message`: system instruction, the most recent
    /// exchanges oldest first, then the new user message.
    pub fn context(&self, user: &ConnectionId, new_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2 + CONTEXT_EXCHANGES * 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));

        if let Some(ring) = self.rings.get(user) {
            let skip = ring.len().saturating_sub(CONTEXT_EXCHANGES);
            for exchange in ring.iter().skip(skip) {
                messages.push(ChatMessage::user(exchange.user.clone()));
                messages.push(ChatMessage::assistant(exchange.assistant.clone()));
            }
        }

        messages.push(ChatMessage::user(new_message));
        messages
    }

    pub fn append(&self, user: &ConnectionId, user_message: &str, bot_response: &str) {
        let mut ring = self.rings.entry(user.clone()).or_default();
        ring.push_back(Exchange::new(user_message, bot_response));
        while ring.len() > HISTORY_CAP {
            ring.pop_front();
        }
    }

    /// Stored exchanges for `user`, oldest first.
    pub fn exchanges(&self, user: &ConnectionId) -> Vec<Exchange> {
        self.rings
            .get(user)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, user: &ConnectionId) -> usize {
        self.rings.get(user).map(|ring| ring.len()).unwrap_or(0)
    }

    /// Drop all history for `user`. Returns how many exchanges were removed.
    pub fn forget(&self, user: &ConnectionId) -> usize {
        let removed = self.rings.remove(user).map(|(_, ring)| ring.len()).unwrap_or(0);
        if removed > 0 {
            tracing::debug!(connection_id = %user, removed, "Conversation history dropped");
        }
        removed
    }

    /// Number of connections with stored history.
    pub fn user_count(&self) -> usize {
        self.rings.len()
    }
}
