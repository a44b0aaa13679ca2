//! Login sessions and the explicit caller context passed to every
//! console operation.

mod password;

pub use password::{hash_password, verify_password};

use password::verify_against_dummy;

use crate::config::SharedSettings;
use crate::directory::Directory;
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::model::{AgentId, AgentProfile, Capability, Presence, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who is calling. Created at login, dropped at logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub agent_id: AgentId,
    pub role: Role,
}

const SYSTEM_AGENT_ID: &str = "system";

impl Principal {
    pub fn new(agent_id: AgentId, role: Role) -> Self {
        Self { agent_id, role }
    }

    /// Internal caller (transport pump, auto-assignment, CLI).
    pub fn system() -> Self {
        Self {
            agent_id: AgentId::from(SYSTEM_AGENT_ID),
            role: Role::Admin,
        }
    }

    pub fn is_system(&self) -> bool {
        self.agent_id.as_str() == SYSTEM_AGENT_ID
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.role.can(capability)
    }

    pub fn require(&self, capability: Capability) -> ZapdeskResult<()> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(ZapdeskError::Forbidden(format!(
                "{} lacks {:?}",
                self.agent_id, capability
            )))
        }
    }

    pub fn is(&self, agent_id: &AgentId) -> bool {
        &self.agent_id == agent_id
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginGrant {
    pub token: String,
    pub agent: AgentProfile,
    pub expires_in_secs: u64,
}

struct LoginSession {
    agent_id: AgentId,
    created_at: DateTime<Utc>,
    last_seen: Instant,
}

/// Bearer-token sessions with an idle timeout taken from the live
/// console settings.
pub struct AuthService {
    directory: Arc<Directory>,
    settings: SharedSettings,
    sessions: Mutex<HashMap<String, LoginSession>>,
}

impl AuthService {
    pub fn new(directory: Arc<Directory>, settings: SharedSettings) -> Self {
        Self {
            directory,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn idle_timeout(&self) -> Duration {
        let mins = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session_timeout_mins;
        Duration::from_secs(mins.saturating_mul(60))
    }

    pub fn login(&self, email: &str, password: &str) -> ZapdeskResult<LoginGrant> {
        let Some(agent) = self.directory.find_by_email(email) else {
            // Same hashing cost as a wrong password for a known account.
            verify_against_dummy(password);
            warn!("login rejected: unknown email");
            return Err(ZapdeskError::Auth("invalid email or password".into()));
        };
        if !verify_password(password, &agent.password_hash) {
            warn!("login rejected: bad password for agent={}", agent.id);
            return Err(ZapdeskError::Auth("invalid email or password".into()));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                LoginSession {
                    agent_id: agent.id.clone(),
                    created_at: Utc::now(),
                    last_seen: Instant::now(),
                },
            );

        let mut profile = AgentProfile::from(&agent);
        if agent.presence == Presence::Offline {
            profile = self
                .directory
                .set_presence(&Principal::system(), &agent.id, Presence::Online)?;
        }
        info!("agent logged in: agent={} role={}", agent.id, agent.role);
        Ok(LoginGrant {
            token,
            agent: profile,
            expires_in_secs: self.idle_timeout().as_secs(),
        })
    }

    /// Drop a login session. The agent goes offline once their last
    /// session ends.
    pub fn logout(&self, token: &str) -> ZapdeskResult<()> {
        let (removed, remaining) = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions.remove(token);
            let remaining = removed.as_ref().map_or(0, |s| {
                sessions.values().filter(|o| o.agent_id == s.agent_id).count()
            });
            (removed, remaining)
        };
        let Some(session) = removed else {
            return Err(ZapdeskError::Auth("unknown session".into()));
        };
        info!(
            "agent logged out: agent={} session_age={}s",
            session.agent_id,
            (Utc::now() - session.created_at).num_seconds()
        );
        if remaining == 0 && self.directory.agent(&session.agent_id).is_ok() {
            self.directory
                .set_presence(&Principal::system(), &session.agent_id, Presence::Offline)?;
        }
        Ok(())
    }

    /// Resolve a bearer token to its principal, refreshing the idle timer.
    pub fn authenticate(&self, token: &str) -> ZapdeskResult<Principal> {
        let timeout = self.idle_timeout();
        let agent_id = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(session) = sessions.get_mut(token) else {
                return Err(ZapdeskError::Auth("invalid or missing token".into()));
            };
            if session.last_seen.elapsed() > timeout {
                let expired = session.agent_id.clone();
                sessions.remove(token);
                drop(sessions);
                debug!("login session expired: agent={}", expired);
                self.release_presence([expired]);
                return Err(ZapdeskError::Auth("session expired".into()));
            }
            session.last_seen = Instant::now();
            session.agent_id.clone()
        };

        // Role changes and deletions take effect on the next request.
        match self.directory.agent(&agent_id) {
            Ok(agent) => Ok(Principal::new(agent.id, agent.role)),
            Err(_) => {
                self.revoke_agent(&agent_id);
                Err(ZapdeskError::Auth("account no longer exists".into()))
            }
        }
    }

    pub fn revoke_agent(&self, agent_id: &AgentId) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| &s.agent_id != agent_id);
        before - sessions.len()
    }

    /// Drop sessions idle past the timeout and take their agents offline
    /// once no session is left. Returns the agents that went offline.
    pub fn prune_expired(&self) -> Vec<AgentId> {
        let timeout = self.idle_timeout();
        let expired: Vec<AgentId> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let mut expired = Vec::new();
            sessions.retain(|_, s| {
                let keep = s.last_seen.elapsed() <= timeout;
                if !keep {
                    expired.push(s.agent_id.clone());
                }
                keep
            });
            expired
        };
        if !expired.is_empty() {
            debug!("expired logins pruned: count={}", expired.len());
        }
        self.release_presence(expired)
    }

    /// Mark each agent offline when none of their sessions remain, the
    /// same rule `logout` applies.
    fn release_presence(&self, agent_ids: impl IntoIterator<Item = AgentId>) -> Vec<AgentId> {
        let mut released: Vec<AgentId> = Vec::new();
        for agent_id in agent_ids {
            if released.contains(&agent_id) {
                continue;
            }
            let remaining = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|s| s.agent_id == agent_id)
                .count();
            if remaining > 0 {
                continue;
            }
            let Ok(agent) = self.directory.agent(&agent_id) else {
                continue;
            };
            if agent.presence == Presence::Offline {
                continue;
            }
            match self
                .directory
                .set_presence(&Principal::system(), &agent_id, Presence::Offline)
            {
                Ok(_) => {
                    info!("agent offline after idle logout: agent={}", agent_id);
                    released.push(agent_id);
                }
                Err(e) => warn!(
                    "failed to mark idle agent offline: agent={} error={}",
                    agent_id, e
                ),
            }
        }
        released
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
