use crate::errors::ZapdeskError;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use super::default_true;

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn default_max_conversations() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_true", rename = "autoAssignment")]
    pub auto_assignment: bool,
    /// Capacity given to new agents when none is specified.
    #[serde(
        default = "default_max_conversations",
        rename = "maxConversationsPerAgent"
    )]
    pub max_conversations_per_agent: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_assignment: true,
            max_conversations_per_agent: default_max_conversations(),
        }
    }
}

// ---------------------------------------------------------------------------
// Working hours
// ---------------------------------------------------------------------------

fn default_start() -> String {
    "08:00".to_string()
}

fn default_end() -> String {
    "18:00".to_string()
}

/// Auto-assignment only happens inside working hours. Outside them new
/// conversations wait in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHoursConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_start")]
    pub start: String,
    #[serde(default = "default_end")]
    pub end: String,
    #[serde(default, rename = "utcOffsetMinutes")]
    pub utc_offset_minutes: i32,
}

impl Default for WorkingHoursConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: default_start(),
            end: default_end(),
            utc_offset_minutes: 0,
        }
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

impl WorkingHoursConfig {
    /// Whether `at` falls inside the configured window. A window whose end
    /// is before its start spans midnight. Disabled (or unparseable) hours
    /// never gate anything.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        let (Some(start), Some(end), Some(offset)) = (
            parse_hhmm(&self.start),
            parse_hhmm(&self.end),
            self.utc_offset_minutes
                .checked_mul(60)
                .and_then(FixedOffset::east_opt),
        ) else {
            return true;
        };
        let local = at.with_timezone(&offset).time();
        if start <= end {
            local >= start && local < end
        } else {
            local >= start || local < end
        }
    }

    fn validate(&self) -> Result<(), ZapdeskError> {
        let start = parse_hhmm(&self.start).ok_or_else(|| {
            ZapdeskError::Config("workingHours.start must be HH:MM".into())
        })?;
        let end = parse_hhmm(&self.end).ok_or_else(|| {
            ZapdeskError::Config("workingHours.end must be HH:MM".into())
        })?;
        if start == end {
            return Err(ZapdeskError::Config("workingHours.start and end must differ".into()));
        }
        if self.utc_offset_minutes.unsigned_abs() > 14 * 60 {
            return Err(ZapdeskError::Config(
                "workingHours.utcOffsetMinutes must be within +/-840".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Auto response
// ---------------------------------------------------------------------------

fn default_auto_response_message() -> String {
    "Olá! Obrigado por entrar em contato. Em breve um de nossos agentes irá atendê-lo."
        .to_string()
}

fn default_auto_response_delay() -> u64 {
    30
}

/// Greeting sent to a new conversation that nobody answered within
/// `delay_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoResponseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auto_response_message")]
    pub message: String,
    #[serde(default = "default_auto_response_delay", rename = "delaySecs")]
    pub delay_secs: u64,
}

impl Default for AutoResponseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message: default_auto_response_message(),
            delay_secs: default_auto_response_delay(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true", rename = "newMessage")]
    pub new_message: bool,
    #[serde(default = "default_true", rename = "agentOffline")]
    pub agent_offline: bool,
    #[serde(default = "default_true", rename = "systemAlerts")]
    pub system_alerts: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            new_message: true,
            agent_offline: true,
            system_alerts: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime settings
// ---------------------------------------------------------------------------

pub(super) fn default_session_timeout_mins() -> u64 {
    30
}

/// Settings an administrator can change while the console runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default, rename = "workingHours")]
    pub working_hours: WorkingHoursConfig,
    #[serde(default, rename = "autoResponse")]
    pub auto_response: AutoResponseConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    /// Idle timeout for login sessions.
    #[serde(
        default = "default_session_timeout_mins",
        rename = "sessionTimeoutMins"
    )]
    pub session_timeout_mins: u64,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            working_hours: WorkingHoursConfig::default(),
            auto_response: AutoResponseConfig::default(),
            notifications: NotificationsConfig::default(),
            session_timeout_mins: default_session_timeout_mins(),
        }
    }
}

impl ConsoleSettings {
    pub fn validate(&self) -> Result<(), ZapdeskError> {
        if self.routing.max_conversations_per_agent == 0 {
            return Err(ZapdeskError::Config("routing.maxConversationsPerAgent must be > 0".into()));
        }
        if self.routing.max_conversations_per_agent > 1000 {
            return Err(ZapdeskError::Config(
                "routing.maxConversationsPerAgent is unreasonably large (> 1000)".into(),
            ));
        }
        self.working_hours.validate()?;
        if self.auto_response.enabled && self.auto_response.message.trim().is_empty() {
            return Err(ZapdeskError::Config(
                "autoResponse.message must not be empty when enabled".into(),
            ));
        }
        if self.auto_response.delay_secs > 86_400 {
            return Err(ZapdeskError::Config("autoResponse.delaySecs must be <= 86400".into()));
        }
        if self.session_timeout_mins == 0 {
            return Err(ZapdeskError::Config("sessionTimeoutMins must be > 0".into()));
        }
        Ok(())
    }
}

/// Settings shared between the router, directory, auth and console.
pub type SharedSettings = Arc<RwLock<ConsoleSettings>>;
