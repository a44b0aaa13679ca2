use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{AgentId, ConversationId};

define_id!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery status of a message. Ordering follows the delivery chain
/// `sent < delivered < read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Transitions only move forward; repeating the current status is not a transition.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        next > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(anyhow::anyhow!("unknown delivery status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Position in the conversation log, starting at 0.
    pub seq: u64,
    pub direction: Direction,
    /// Agent who wrote an outbound message. `None` for inbound messages
    /// and system auto-responses.
    pub author: Option<AgentId>,
    pub body: String,
    /// Arrival time, monotonic non-decreasing within a conversation.
    pub created_at: DateTime<Utc>,
    /// Timestamp reported by the transport, kept for display only.
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
}

/// Message content handed to `MessageStore::append`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub author: Option<AgentId>,
    pub body: String,
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn inbound(body: impl Into<String>, source_timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            direction: Direction::Inbound,
            author: None,
            body: body.into(),
            source_timestamp,
        }
    }

    pub fn outbound(author: Option<AgentId>, body: impl Into<String>) -> Self {
        Self {
            direction: Direction::Outbound,
            author,
            body: body.into(),
            source_timestamp: None,
        }
    }

    /// Inbound messages have already reached us; outbound ones start at `Sent`.
    pub fn initial_status(&self) -> DeliveryStatus {
        match self.direction {
            Direction::Inbound => DeliveryStatus::Delivered,
            Direction::Outbound => DeliveryStatus::Sent,
        }
    }
}

impl Message {
    pub fn is_unread_inbound(&self) -> bool {
        self.direction == Direction::Inbound && self.status != DeliveryStatus::Read
    }
}
