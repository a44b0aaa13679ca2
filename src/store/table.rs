use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{ContactId, Conversation, ConversationId, Message, MessageId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// A conversation together with its message log.
///
/// The slot's mutex is the single ordering point for everything that
/// touches the conversation: appends, status updates, assignment, label
/// and lifecycle changes.
#[derive(Debug)]
pub struct ConversationSlot {
    pub conversation: Conversation,
    pub log: Vec<Message>,
}

pub type SlotHandle = Arc<Mutex<ConversationSlot>>;
pub type SlotGuard = OwnedMutexGuard<ConversationSlot>;

/// Shared table of live conversations.
///
/// Lock order: contact index, then a conversation slot, then the
/// assignment ledger, then directory reads. The contact index is released
/// before awaiting an existing slot.
#[derive(Default)]
pub struct ConversationTable {
    slots: RwLock<HashMap<ConversationId, SlotHandle>>,
    messages: RwLock<HashMap<MessageId, (ConversationId, u64)>>,
    /// Active (open or pending) conversation per contact.
    contacts: Mutex<HashMap<ContactId, ConversationId>>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, id: &ConversationId) -> ZapdeskResult<SlotHandle> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("conversation", id))
    }

    pub async fn lock(&self, id: &ConversationId) -> ZapdeskResult<SlotGuard> {
        Ok(self.handle(id)?.lock_owned().await)
    }

    /// Register a new slot and return it already locked, so no other task
    /// can observe the conversation before its creator is done with it.
    pub async fn insert_locked(&self, slot: ConversationSlot) -> SlotGuard {
        let id = slot.conversation.id.clone();
        let handle = Arc::new(Mutex::new(slot));
        let guard = Arc::clone(&handle).lock_owned().await;
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        guard
    }

    pub fn handles(&self) -> Vec<SlotHandle> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones of every conversation record, each read under its slot lock.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let mut out = Vec::new();
        for handle in self.handles() {
            out.push(handle.lock().await.conversation.clone());
        }
        out
    }

    pub fn index_message(&self, message: &Message) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                message.id.clone(),
                (message.conversation_id.clone(), message.seq),
            );
    }

    pub fn locate_message(&self, id: &MessageId) -> ZapdeskResult<(ConversationId, u64)> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("message", id))
    }

    pub async fn contacts(&self) -> MutexGuard<'_, HashMap<ContactId, ConversationId>> {
        self.contacts.lock().await
    }
}
