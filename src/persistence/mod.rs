//! Durable storage boundary.
//!
//! Writes happen while the owning conversation (or directory) lock is held
//! and before the in-memory state changes, so a failed write leaves both
//! sides untouched.

pub mod memory;
pub mod sqlite;

use crate::model::{Agent, AgentId, Conversation, ConversationId, Label, LabelId, Message, Session};
use anyhow::Result;

pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;

pub trait Persistence: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<()>;
    fn load_session(&self) -> Result<Option<Session>>;
    fn delete_session(&self) -> Result<()>;

    fn save_conversation(&self, conversation: &Conversation) -> Result<()>;
    fn load_conversations(&self) -> Result<Vec<Conversation>>;

    fn save_message(&self, message: &Message) -> Result<()>;

    /// Write messages together with their conversation record. Either
    /// everything lands or nothing does.
    fn save_messages_with_conversation(
        &self,
        messages: &[Message],
        conversation: &Conversation,
    ) -> Result<()>;

    /// Messages of one conversation in append order.
    fn load_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    fn save_agent(&self, agent: &Agent) -> Result<()>;
    fn load_agents(&self) -> Result<Vec<Agent>>;
    fn delete_agent(&self, agent_id: &AgentId) -> Result<()>;

    fn save_label(&self, label: &Label) -> Result<()>;
    fn load_labels(&self) -> Result<Vec<Label>>;
    fn delete_label(&self, label_id: &LabelId) -> Result<()>;
}
