//! Ordered, per-conversation message logs with delivery status tracking.

mod table;

pub use table::{ConversationSlot, ConversationTable, SlotGuard, SlotHandle};

use crate::bus::{DomainEvent, EventFeed};
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{
    AgentId, Conversation, ConversationId, ConversationStatus, DeliveryStatus, Direction, Message,
    MessageId, NewMessage,
};
use crate::persistence::Persistence;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

pub struct MessageStore {
    table: Arc<ConversationTable>,
    persistence: Arc<dyn Persistence>,
    feed: Arc<EventFeed>,
}

impl MessageStore {
    pub fn new(
        table: Arc<ConversationTable>,
        persistence: Arc<dyn Persistence>,
        feed: Arc<EventFeed>,
    ) -> Self {
        Self {
            table,
            persistence,
            feed,
        }
    }

    pub fn table(&self) -> &Arc<ConversationTable> {
        &self.table
    }

    /// Append a message to a conversation's log.
    pub async fn append(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> ZapdeskResult<Message> {
        let mut slot = self.table.lock(conversation_id).await?;
        self.append_locked(&mut slot, message)
    }

    /// Append while the caller already holds the conversation's slot.
    ///
    /// The sequence number is the log position; `created_at` never goes
    /// backwards within a conversation, whatever the transport reports.
    pub(crate) fn append_locked(
        &self,
        slot: &mut ConversationSlot,
        message: NewMessage,
    ) -> ZapdeskResult<Message> {
        if slot.conversation.status == ConversationStatus::Closed {
            return Err(ZapdeskError::InvalidState(format!(
                "conversation {} is closed",
                slot.conversation.id
            )));
        }

        let now = Utc::now();
        let created_at = slot
            .log
            .last()
            .map_or(now, |last| last.created_at.max(now));
        let status = message.initial_status();
        let record = Message {
            id: MessageId::generate(),
            conversation_id: slot.conversation.id.clone(),
            seq: slot.log.len() as u64,
            direction: message.direction,
            author: message.author,
            body: message.body,
            created_at,
            source_timestamp: message.source_timestamp,
            status,
        };

        let mut conversation = slot.conversation.clone();
        if record.is_unread_inbound() {
            conversation.unread_count += 1;
        }
        conversation.last_activity = created_at;
        conversation.set_preview(&record.body);

        self.persistence
            .save_messages_with_conversation(std::slice::from_ref(&record), &conversation)
            .context("Failed to persist message")?;

        slot.log.push(record.clone());
        slot.conversation = conversation;
        self.table.index_message(&record);

        debug!(
            "message appended: conversation={} seq={} direction={:?}",
            record.conversation_id, record.seq, record.direction
        );
        self.feed.publish(DomainEvent::MessageAppended {
            message: record.clone(),
            unread_count: slot.conversation.unread_count,
        });
        Ok(record)
    }

    /// Advance a message's delivery status. Only forward moves along
    /// `sent < delivered < read` are accepted; on rejection the stored
    /// status is left as it was.
    pub async fn update_status(
        &self,
        message_id: &MessageId,
        status: DeliveryStatus,
    ) -> ZapdeskResult<Message> {
        let (conversation_id, seq) = self.table.locate_message(message_id)?;
        let mut slot = self.table.lock(&conversation_id).await?;
        let index = usize::try_from(seq).map_err(|e| ZapdeskError::Internal(e.into()))?;
        let current = slot
            .log
            .get(index)
            .ok_or_else(|| ZapdeskError::not_found("message", message_id))?;

        if !current.status.can_advance_to(status) {
            return Err(ZapdeskError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let from = current.status;
        let mut updated = current.clone();
        updated.status = status;

        let mut conversation = slot.conversation.clone();
        let clears_unread = updated.direction == Direction::Inbound && status == DeliveryStatus::Read;
        if clears_unread {
            conversation.unread_count = conversation.unread_count.saturating_sub(1);
        }

        if clears_unread {
            self.persistence
                .save_messages_with_conversation(std::slice::from_ref(&updated), &conversation)
                .context("Failed to persist message status")?;
        } else {
            self.persistence
                .save_message(&updated)
                .context("Failed to persist message status")?;
        }

        slot.log[index] = updated.clone();
        slot.conversation = conversation;

        debug!(
            "message status changed: message={} {} -> {}",
            message_id, from, status
        );
        self.feed.publish(DomainEvent::MessageStatusChanged {
            conversation_id,
            message_id: message_id.clone(),
            from,
            to: status,
        });
        Ok(updated)
    }

    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ZapdeskResult<Vec<Message>> {
        let slot = self.table.lock(conversation_id).await?;
        Ok(slot.log.clone())
    }

    pub async fn get_message(&self, message_id: &MessageId) -> ZapdeskResult<Message> {
        let (conversation_id, seq) = self.table.locate_message(message_id)?;
        let slot = self.table.lock(&conversation_id).await?;
        usize::try_from(seq)
            .ok()
            .and_then(|i| slot.log.get(i))
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("message", message_id))
    }

    /// Mark every inbound message read and reset the unread counter.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader: Option<AgentId>,
    ) -> ZapdeskResult<Conversation> {
        let mut slot = self.table.lock(conversation_id).await?;
        self.mark_read_locked(&mut slot, reader)
    }

    /// Runs entirely under the slot lock: an inbound append racing with
    /// the reset is either read here or counted after it.
    pub(crate) fn mark_read_locked(
        &self,
        slot: &mut ConversationSlot,
        reader: Option<AgentId>,
    ) -> ZapdeskResult<Conversation> {
        let changed: Vec<Message> = slot
            .log
            .iter()
            .filter(|m| m.is_unread_inbound())
            .map(|m| Message {
                status: DeliveryStatus::Read,
                ..m.clone()
            })
            .collect();

        let mut conversation = slot.conversation.clone();
        conversation.unread_count = 0;

        self.persistence
            .save_messages_with_conversation(&changed, &conversation)
            .context("Failed to persist read receipts")?;

        for message in changed {
            if let Some(entry) = usize::try_from(message.seq)
                .ok()
                .and_then(|i| slot.log.get_mut(i))
            {
                *entry = message;
            }
        }
        slot.conversation = conversation;

        self.feed.publish(DomainEvent::ConversationRead {
            conversation_id: slot.conversation.id.clone(),
            agent_id: reader,
        });
        Ok(slot.conversation.clone())
    }

    /// Load a persisted conversation and its log without emitting events.
    /// The unread counter is recomputed from the log.
    pub async fn restore(
        &self,
        mut conversation: Conversation,
        mut log: Vec<Message>,
    ) -> ZapdeskResult<()> {
        log.sort_by_key(|m| m.seq);
        for (position, message) in log.iter().enumerate() {
            if message.seq != position as u64 {
                return Err(ZapdeskError::InvalidState(format!(
                    "conversation {} has a gap in its log at seq {}",
                    conversation.id, position
                )));
            }
        }
        conversation.unread_count = log.iter().filter(|m| m.is_unread_inbound()).count() as u32;
        for message in &log {
            self.table.index_message(message);
        }
        let active = conversation.is_active();
        let contact = conversation.contact_id.clone();
        let id = conversation.id.clone();
        drop(
            self.table
                .insert_locked(ConversationSlot { conversation, log })
                .await,
        );
        if active {
            self.table.contacts().await.insert(contact, id);
        }
        Ok(())
    }
}
