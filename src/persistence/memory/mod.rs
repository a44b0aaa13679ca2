use super::Persistence;
use crate::model::{Agent, AgentId, Conversation, ConversationId, Label, LabelId, Message, Session};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct Records {
    session: Option<Session>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, BTreeMap<u64, Message>>,
    agents: HashMap<AgentId, Agent>,
    labels: HashMap<LabelId, Label>,
}

/// Process-local persistence. Data lives as long as the value.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Records>,
    fail_writes: Mutex<bool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    fn write(&self, f: impl FnOnce(&mut Records)) -> Result<()> {
        if *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(anyhow::anyhow!("memory persistence write rejected"));
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut records);
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Records) -> T) -> T {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        f(&records)
    }
}

impl Persistence for MemoryPersistence {
    fn save_session(&self, session: &Session) -> Result<()> {
        self.write(|r| r.session = Some(session.clone()))
    }

    fn load_session(&self) -> Result<Option<Session>> {
        Ok(self.read(|r| r.session.clone()))
    }

    fn delete_session(&self) -> Result<()> {
        self.write(|r| r.session = None)
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write(|r| {
            r.conversations
                .insert(conversation.id.clone(), conversation.clone());
        })
    }

    fn load_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.read(|r| r.conversations.values().cloned().collect()))
    }

    fn save_message(&self, message: &Message) -> Result<()> {
        self.write(|r| {
            r.messages
                .entry(message.conversation_id.clone())
                .or_default()
                .insert(message.seq, message.clone());
        })
    }

    fn save_messages_with_conversation(
        &self,
        messages: &[Message],
        conversation: &Conversation,
    ) -> Result<()> {
        self.write(|r| {
            for message in messages {
                r.messages
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .insert(message.seq, message.clone());
            }
            r.conversations
                .insert(conversation.id.clone(), conversation.clone());
        })
    }

    fn load_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        Ok(self.read(|r| {
            r.messages
                .get(conversation_id)
                .map(|log| log.values().cloned().collect())
                .unwrap_or_default()
        }))
    }

    fn save_agent(&self, agent: &Agent) -> Result<()> {
        self.write(|r| {
            r.agents.insert(agent.id.clone(), agent.clone());
        })
    }

    fn load_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.read(|r| r.agents.values().cloned().collect()))
    }

    fn delete_agent(&self, agent_id: &AgentId) -> Result<()> {
        self.write(|r| {
            r.agents.remove(agent_id);
        })
    }

    fn save_label(&self, label: &Label) -> Result<()> {
        self.write(|r| {
            r.labels.insert(label.id.clone(), label.clone());
        })
    }

    fn load_labels(&self) -> Result<Vec<Label>> {
        Ok(self.read(|r| r.labels.values().cloned().collect()))
    }

    fn delete_label(&self, label_id: &LabelId) -> Result<()> {
        self.write(|r| {
            r.labels.remove(label_id);
        })
    }
}
