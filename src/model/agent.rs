use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

define_id!(AgentId);

/// Console role. Each variant carries a fixed capability set that is
/// checked where a request enters the router or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Work conversations: reply, mark read, close, claim from the queue.
    HandleConversations,
    /// See every conversation, not just the queue and one's own.
    ViewAllConversations,
    /// Assign conversations to someone else.
    AssignOthers,
    ManageAgents,
    ManageLabels,
    ManageSettings,
    /// Connect or log out the messaging session.
    ManageSession,
}

const ADMIN_CAPABILITIES: &[Capability] = &[
    Capability::HandleConversations,
    Capability::ViewAllConversations,
    Capability::AssignOthers,
    Capability::ManageAgents,
    Capability::ManageLabels,
    Capability::ManageSettings,
    Capability::ManageSession,
];

const AGENT_CAPABILITIES: &[Capability] = &[Capability::HandleConversations];

impl Role {
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Admin => ADMIN_CAPABILITIES,
            Self::Agent => AGENT_CAPABILITIES,
        }
    }

    pub fn can(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub presence: Presence,
    /// Maximum number of simultaneously open conversations.
    pub capacity: u32,
    /// Argon2 PHC string.
    #[serde(default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("role", &self.role)
            .field("presence", &self.presence)
            .field("capacity", &self.capacity)
            .field("password_hash", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn is_available(&self) -> bool {
        self.presence != Presence::Offline
    }
}

/// Public view of an agent, without credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub presence: Presence,
    pub capacity: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Agent> for AgentProfile {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            email: agent.email.clone(),
            role: agent.role,
            presence: agent.presence,
            capacity: agent.capacity,
            created_at: agent.created_at,
        }
    }
}
