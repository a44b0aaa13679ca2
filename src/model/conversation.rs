use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{AgentId, ContactId, LabelId};

define_id!(ConversationId);

/// Longest preview of the last message kept on the conversation record.
const PREVIEW_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Pending,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub contact_id: ContactId,
    /// Ordered, duplicate-free.
    #[serde(default)]
    pub labels: Vec<LabelId>,
    pub status: ConversationStatus,
    pub assigned_agent: Option<AgentId>,
    pub unread_count: u32,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub last_message_preview: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(contact_id: ContactId) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::generate(),
            contact_id,
            labels: Vec::new(),
            status: ConversationStatus::Pending,
            assigned_agent: None,
            unread_count: 0,
            last_activity: now,
            last_message_preview: String::new(),
            created_at: now,
        }
    }

    /// Open and pending conversations receive new inbound messages;
    /// closed ones are archived.
    pub fn is_active(&self) -> bool {
        self.status != ConversationStatus::Closed
    }

    /// Whether this conversation counts against its agent's capacity.
    pub fn holds_capacity(&self) -> bool {
        self.is_active() && self.assigned_agent.is_some()
    }

    pub fn set_preview(&mut self, body: &str) {
        self.last_message_preview = body.chars().take(PREVIEW_MAX_CHARS).collect();
    }

    pub fn has_label(&self, label: &LabelId) -> bool {
        self.labels.contains(label)
    }
}
