use serde::Serialize;

use launchpad_shared::types::{Conversation, Message};

use crate::conversations::ConversationStore;

pub const EVENT_CONVERSATIONS_UPDATED: &str = "conversations-updated";
pub const EVENT_THREAD_UPDATED: &str = "thread-updated";
pub const EVENT_MESSAGING_ERROR: &str = "messaging-error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePayload {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: String,
    pub optimistic: bool,
}

impl From<&Message> for MessagePayload {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.to_string(),
            sender_id: m.sender_id.to_string(),
            receiver_id: m.receiver_id.to_string(),
            body: m.body.clone(),
            created_at: m.created_at.to_rfc3339(),
            optimistic: m.is_optimistic(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationPayload {
    pub counterpart_id: String,
    pub counterpart_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart_role: Option<String>,
    pub last_message: Option<MessagePayload>,
}

impl From<&Conversation> for ConversationPayload {
    fn from(c: &Conversation) -> Self {
        Self {
            counterpart_id: c.counterpart.uuid.to_string(),
            counterpart_name: c.counterpart.display_name.clone(),
            counterpart_role: c.counterpart.role.map(|r| r.as_str().to_string()),
            last_message: c.last_message.as_ref().map(MessagePayload::from),
        }
    }
}

/// Which operation an error event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    Load,
    Thread,
    Send,
    Channel,
}

/// Notification emitted by a messaging session to its UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    ConversationsUpdated(Vec<ConversationPayload>),
    ThreadUpdated {
        counterpart_id: Option<String>,
        messages: Vec<MessagePayload>,
    },
    MessagingError {
        scope: ErrorScope,
        message: String,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationsUpdated(_) => EVENT_CONVERSATIONS_UPDATED,
            Self::ThreadUpdated { .. } => EVENT_THREAD_UPDATED,
            Self::MessagingError { .. } => EVENT_MESSAGING_ERROR,
        }
    }

    pub fn conversations(store: &ConversationStore) -> Self {
        Self::ConversationsUpdated(
            store
                .conversations()
                .iter()
                .map(ConversationPayload::from)
                .collect(),
        )
    }

    pub fn thread(store: &ConversationStore) -> Self {
        Self::ThreadUpdated {
            counterpart_id: store.selected().map(|p| p.uuid.to_string()),
            messages: store
                .active_thread()
                .iter()
                .map(MessagePayload::from)
                .collect(),
        }
    }

    pub fn error(scope: ErrorScope, error: impl std::fmt::Display) -> Self {
        Self::MessagingError {
            scope,
            message: error.to_string(),
        }
    }
}
