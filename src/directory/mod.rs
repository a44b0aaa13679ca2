//! Agent accounts and labels.
//!
//! Reads are served from in-memory maps; every write goes to persistence
//! first and only then replaces the in-memory record and publishes an
//! event, all under the map's write lock.

use crate::auth::{Principal, hash_password};
use crate::bus::{DomainEvent, EventFeed, NoticeKind};
use crate::config::{BootstrapAdminConfig, SharedSettings};
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{
    Agent, AgentId, AgentProfile, Capability, Label, LabelId, Presence, Role,
};
use crate::persistence::Persistence;
use crate::router::AssignmentLedger;
use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

const MIN_NAME_CHARS: usize = 2;
const MIN_PASSWORD_CHARS: usize = 6;
const MAX_CAPACITY: u32 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub capacity: Option<u32>,
}

fn default_role() -> Role {
    Role::Agent
}

/// Admin edit of an existing account. Absent fields stay as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub capacity: Option<u32>,
    pub password: Option<String>,
}

/// Self-service edit by the logged-in agent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub presence: Option<Presence>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLabel {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct Directory {
    agents: RwLock<HashMap<AgentId, Agent>>,
    labels: RwLock<BTreeMap<LabelId, Label>>,
    ledger: Arc<AssignmentLedger>,
    persistence: Arc<dyn Persistence>,
    feed: Arc<EventFeed>,
    settings: SharedSettings,
}

fn validate_name(name: &str) -> ZapdeskResult<String> {
    let name = name.trim();
    if name.chars().count() < MIN_NAME_CHARS {
        return Err(ZapdeskError::Validation(format!(
            "name must be at least {MIN_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

/// Loose shape check: one `@`, non-empty local part, dotted domain, no
/// whitespace. Normalized to lower case.
fn validate_email(email: &str) -> ZapdeskResult<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ZapdeskError::Validation(format!("invalid email: {email}")))
    }
}

fn validate_password(password: &str) -> ZapdeskResult<()> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(ZapdeskError::Validation(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> ZapdeskResult<u32> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(ZapdeskError::Validation(format!(
            "capacity must be between 1 and {MAX_CAPACITY}"
        )));
    }
    Ok(capacity)
}

impl Directory {
    pub fn new(
        ledger: Arc<AssignmentLedger>,
        persistence: Arc<dyn Persistence>,
        feed: Arc<EventFeed>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            labels: RwLock::new(BTreeMap::new()),
            ledger,
            persistence,
            feed,
            settings,
        }
    }

    /// Load persisted agents and labels without emitting events.
    pub fn restore(&self, agents: Vec<Agent>, labels: Vec<Label>) {
        let mut map = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        for agent in agents {
            map.insert(agent.id.clone(), agent);
        }
        let mut label_map = self.labels.write().unwrap_or_else(PoisonError::into_inner);
        for label in labels {
            label_map.insert(label.id.clone(), label);
        }
    }

    // ── agents ─────────────────────────────────────────────

    pub fn agent(&self, id: &AgentId) -> ZapdeskResult<Agent> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("agent", id))
    }

    pub fn profile(&self, id: &AgentId) -> ZapdeskResult<AgentProfile> {
        self.agent(id).map(|a| AgentProfile::from(&a))
    }

    /// All agents, ordered by id.
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        self.agents().iter().map(AgentProfile::from).collect()
    }

    pub fn find_by_email(&self, email: &str) -> Option<Agent> {
        let email = email.trim().to_lowercase();
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|a| a.email == email)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn default_capacity(&self) -> u32 {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routing
            .max_conversations_per_agent
    }

    pub fn create_agent(&self, actor: &Principal, new: NewAgent) -> ZapdeskResult<AgentProfile> {
        actor.require(Capability::ManageAgents)?;
        let name = validate_name(&new.name)?;
        let email = validate_email(&new.email)?;
        validate_password(&new.password)?;
        if new.password != new.confirm_password {
            return Err(ZapdeskError::Validation("passwords do not match".into()));
        }
        let capacity = validate_capacity(new.capacity.unwrap_or_else(|| self.default_capacity()))?;

        // Hash before taking the write lock; argon2 is slow on purpose.
        let password_hash = hash_password(&new.password)?;
        let agent = Agent {
            id: AgentId::generate(),
            name,
            email,
            role: new.role,
            presence: Presence::Offline,
            capacity,
            password_hash,
            created_at: Utc::now(),
        };

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.values().any(|a| a.email == agent.email) {
            return Err(ZapdeskError::Validation(format!(
                "email already registered: {}",
                agent.email
            )));
        }
        self.persistence
            .save_agent(&agent)
            .context("Failed to persist agent")?;
        let profile = AgentProfile::from(&agent);
        agents.insert(agent.id.clone(), agent);

        info!(
            "agent created: agent={} role={} capacity={}",
            profile.id, profile.role, profile.capacity
        );
        self.feed.publish(DomainEvent::AgentUpdated {
            agent: profile.clone(),
        });
        Ok(profile)
    }

    /// Admin edit. Lowering capacity below the current open count keeps
    /// existing assignments; it only blocks new ones.
    pub fn update_agent(
        &self,
        actor: &Principal,
        id: &AgentId,
        update: AgentUpdate,
    ) -> ZapdeskResult<AgentProfile> {
        actor.require(Capability::ManageAgents)?;
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let email = update.email.as_deref().map(validate_email).transpose()?;
        let capacity = update.capacity.map(validate_capacity).transpose()?;
        let password_hash = match update.password.as_deref() {
            Some(password) => {
                validate_password(password)?;
                Some(hash_password(password)?)
            }
            None => None,
        };
        if actor.is(id) && update.role == Some(Role::Agent) {
            return Err(ZapdeskError::InvalidState(
                "administrators cannot demote themselves".into(),
            ));
        }

        self.modify_agent(id, |agent| {
            if let Some(email) = email {
                agent.email = email;
            }
            if let Some(name) = name {
                agent.name = name;
            }
            if let Some(role) = update.role {
                agent.role = role;
            }
            if let Some(capacity) = capacity {
                agent.capacity = capacity;
            }
            if let Some(hash) = password_hash {
                agent.password_hash = hash;
            }
            Ok(())
        })
    }

    /// Self-service profile edit for the calling agent.
    pub fn update_profile(
        &self,
        actor: &Principal,
        update: ProfileUpdate,
    ) -> ZapdeskResult<AgentProfile> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let email = update.email.as_deref().map(validate_email).transpose()?;
        let mut profile = self.modify_agent(&actor.agent_id, |agent| {
            if let Some(email) = email {
                agent.email = email;
            }
            if let Some(name) = name {
                agent.name = name;
            }
            Ok(())
        })?;
        if let Some(presence) = update.presence {
            profile = self.set_presence(actor, &actor.agent_id, presence)?;
        }
        Ok(profile)
    }

    /// Change presence. Agents may set their own; changing someone
    /// else's requires `ManageAgents`. Going offline keeps the agent's
    /// conversations assigned.
    pub fn set_presence(
        &self,
        actor: &Principal,
        id: &AgentId,
        presence: Presence,
    ) -> ZapdeskResult<AgentProfile> {
        if !actor.is(id) {
            actor.require(Capability::ManageAgents)?;
        }
        let before = self.agent(id)?.presence;
        let profile = self.modify_agent(id, |agent| {
            agent.presence = presence;
            Ok(())
        })?;

        if presence == Presence::Offline && before != Presence::Offline {
            let notify = self
                .settings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .notifications
                .agent_offline;
            let open = self.ledger.open_count(id);
            if open > 0 {
                warn!(
                    "agent went offline holding conversations: agent={} open={}",
                    id, open
                );
            }
            if notify {
                self.feed.publish(DomainEvent::Notice {
                    kind: NoticeKind::AgentOffline,
                    message: format!("{} is now offline", profile.name),
                    contact_id: None,
                });
            }
        }
        Ok(profile)
    }

    /// Apply `change` to a copy of the agent, persist it, then commit.
    fn modify_agent<F>(&self, id: &AgentId, change: F) -> ZapdeskResult<AgentProfile>
    where
        F: FnOnce(&mut Agent) -> ZapdeskResult<()>,
    {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = agents
            .get(id)
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("agent", id))?;
        change(&mut updated)?;
        if agents
            .values()
            .any(|a| &a.id != id && a.email == updated.email)
        {
            return Err(ZapdeskError::Validation(format!(
                "email already registered: {}",
                updated.email
            )));
        }
        self.persistence
            .save_agent(&updated)
            .context("Failed to persist agent")?;
        let profile = AgentProfile::from(&updated);
        agents.insert(id.clone(), updated);
        self.feed.publish(DomainEvent::AgentUpdated {
            agent: profile.clone(),
        });
        Ok(profile)
    }

    /// Remove an account. Refused while the agent still holds open or
    /// pending conversations; the ledger stays locked across the check
    /// and the removal so no assignment can slip in between.
    pub fn delete_agent(&self, actor: &Principal, id: &AgentId) -> ZapdeskResult<()> {
        actor.require(Capability::ManageAgents)?;
        if actor.is(id) {
            return Err(ZapdeskError::InvalidState(
                "cannot delete your own account".into(),
            ));
        }
        let ledger = self.ledger.lock();
        let open = ledger.open_count(id);
        if open > 0 {
            return Err(ZapdeskError::InvalidState(format!(
                "agent {id} still holds {open} open conversations"
            )));
        }
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if !agents.contains_key(id) {
            return Err(ZapdeskError::not_found("agent", id));
        }
        self.persistence
            .delete_agent(id)
            .context("Failed to delete agent")?;
        agents.remove(id);
        drop(agents);
        drop(ledger);

        info!("agent deleted: agent={}", id);
        self.feed.publish(DomainEvent::AgentRemoved {
            agent_id: id.clone(),
        });
        Ok(())
    }

    /// Create the configured administrator when no accounts exist yet.
    pub fn bootstrap_admin(
        &self,
        config: &BootstrapAdminConfig,
    ) -> ZapdeskResult<Option<AgentProfile>> {
        if !self.is_empty() || !config.is_configured() {
            return Ok(None);
        }
        let name = if config.name.trim().is_empty() {
            "Administrator".to_string()
        } else {
            config.name.clone()
        };
        let profile = self.create_agent(
            &Principal::system(),
            NewAgent {
                name,
                email: config.email.clone(),
                password: config.password.clone(),
                confirm_password: config.password.clone(),
                role: Role::Admin,
                capacity: None,
            },
        )?;
        info!("bootstrap administrator created: email={}", profile.email);
        Ok(Some(profile))
    }

    // ── labels ─────────────────────────────────────────────

    /// Labels ordered by name.
    pub fn labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self
            .labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        labels.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        labels
    }

    pub fn label(&self, id: &LabelId) -> ZapdeskResult<Label> {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ZapdeskError::not_found("label", id))
    }

    pub fn has_label(&self, id: &LabelId) -> bool {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn create_label(&self, actor: &Principal, new: NewLabel) -> ZapdeskResult<Label> {
        actor.require(Capability::ManageLabels)?;
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ZapdeskError::Validation("label name is required".into()));
        }
        let color = new.color.trim();
        if color.is_empty() {
            return Err(ZapdeskError::Validation("label color is required".into()));
        }
        let label = Label {
            id: LabelId::generate(),
            name: name.to_string(),
            color: color.to_string(),
            description: new
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        };

        let mut labels = self.labels.write().unwrap_or_else(PoisonError::into_inner);
        if labels
            .values()
            .any(|l| l.name.eq_ignore_ascii_case(&label.name))
        {
            return Err(ZapdeskError::Validation(format!(
                "label already exists: {}",
                label.name
            )));
        }
        self.persistence
            .save_label(&label)
            .context("Failed to persist label")?;
        labels.insert(label.id.clone(), label.clone());
        info!("label created: label={} name={}", label.id, label.name);
        Ok(label)
    }

    /// Remove a label from the catalogue. Detaching it from conversations
    /// is the router's job (`ConversationRouter::purge_label`).
    pub fn delete_label(&self, actor: &Principal, id: &LabelId) -> ZapdeskResult<Label> {
        actor.require(Capability::ManageLabels)?;
        let mut labels = self.labels.write().unwrap_or_else(PoisonError::into_inner);
        let Some(label) = labels.get(id).cloned() else {
            return Err(ZapdeskError::not_found("label", id));
        };
        self.persistence
            .delete_label(id)
            .context("Failed to delete label")?;
        labels.remove(id);
        info!("label deleted: label={} name={}", id, label.name);
        Ok(label)
    }
}

#[cfg(test)]
mod tests;
