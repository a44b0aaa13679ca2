use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AgentId, AgentProfile, ContactId, Conversation, ConversationId, ConversationStatus,
    Credential, CredentialPayload, DeliveryStatus, LabelId, Message, MessageId, SessionFailure,
    SessionState,
};

/// Connection state reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransportState {
    /// Credential accepted; the transport is linked to `phone`.
    Connected { phone: String, credential: Credential },
    /// Connection dropped after having been established.
    Closed { reason: String },
    /// The credential exchange failed.
    Rejected { reason: String },
}

/// Everything a transport can tell the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransportEvent {
    InboundMessage {
        contact_id: String,
        body: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    ConnectionStateChanged {
        state: TransportState,
    },
    CredentialChallenge {
        payload: String,
    },
    DeliveryReceipt {
        message_id: MessageId,
        status: DeliveryStatus,
    },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InboundMessage { .. } => "inbound_message",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::CredentialChallenge { .. } => "credential_challenge",
            Self::DeliveryReceipt { .. } => "delivery_receipt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    NewMessage,
    AgentOffline,
    SystemAlert,
}

/// Domain events delivered to presentation subscribers after the
/// corresponding mutation has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    ConversationCreated {
        conversation: Conversation,
    },
    ConversationAssigned {
        conversation_id: ConversationId,
        agent_id: AgentId,
        previous: Option<AgentId>,
    },
    ConversationUnassigned {
        conversation_id: ConversationId,
        previous: AgentId,
    },
    ConversationStatusChanged {
        conversation_id: ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
    },
    ConversationLabelsChanged {
        conversation_id: ConversationId,
        labels: Vec<LabelId>,
    },
    ConversationRead {
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
    },
    MessageAppended {
        message: Message,
        unread_count: u32,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    SessionStateChanged {
        state: SessionState,
        failure: Option<SessionFailure>,
    },
    CredentialIssued {
        payload: CredentialPayload,
    },
    AgentUpdated {
        agent: AgentProfile,
    },
    AgentRemoved {
        agent_id: AgentId,
    },
    Notice {
        kind: NoticeKind,
        message: String,
        contact_id: Option<ContactId>,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversation_created",
            Self::ConversationAssigned { .. } => "conversation_assigned",
            Self::ConversationUnassigned { .. } => "conversation_unassigned",
            Self::ConversationStatusChanged { .. } => "conversation_status_changed",
            Self::ConversationLabelsChanged { .. } => "conversation_labels_changed",
            Self::ConversationRead { .. } => "conversation_read",
            Self::MessageAppended { .. } => "message_appended",
            Self::MessageStatusChanged { .. } => "message_status_changed",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::CredentialIssued { .. } => "credential_issued",
            Self::AgentUpdated { .. } => "agent_updated",
            Self::AgentRemoved { .. } => "agent_removed",
            Self::Notice { .. } => "notice",
        }
    }

    /// Conversation the event is about, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::ConversationCreated { conversation } => Some(&conversation.id),
            Self::ConversationAssigned { conversation_id, .. }
            | Self::ConversationUnassigned { conversation_id, .. }
            | Self::ConversationStatusChanged { conversation_id, .. }
            | Self::ConversationLabelsChanged { conversation_id, .. }
            | Self::ConversationRead { conversation_id, .. }
            | Self::MessageStatusChanged { conversation_id, .. } => Some(conversation_id),
            Self::MessageAppended { message, .. } => Some(&message.conversation_id),
            _ => None,
        }
    }
}

/// A domain event stamped with its position in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

#[cfg(test)]
mod tests;
