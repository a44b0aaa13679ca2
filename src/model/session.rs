use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ZapdeskError;

define_id!(SessionId);

/// Connection state of the messaging-transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    AwaitingCredential,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::AwaitingCredential => f.write_str("awaiting_credential"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Opaque credential blob issued by the transport once a device is linked.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(pub String);

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Credential([empty])")
        } else {
            f.write_str("Credential([REDACTED])")
        }
    }
}

/// Challenge shown to the operator during credential exchange (the QR code
/// contents for WhatsApp linked devices).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPayload {
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

impl CredentialPayload {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issued_at: Utc::now(),
        }
    }
}

/// Why the session last dropped to `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    CredentialTimeout,
    CredentialRejected { reason: String },
    ConnectionLost { attempts: u32 },
}

impl From<SessionFailure> for ZapdeskError {
    fn from(failure: SessionFailure) -> Self {
        match failure {
            SessionFailure::CredentialTimeout => ZapdeskError::CredentialTimeout,
            SessionFailure::CredentialRejected { reason } => {
                ZapdeskError::CredentialRejected { reason }
            }
            SessionFailure::ConnectionLost { attempts } => {
                ZapdeskError::ConnectionLost { attempts }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    #[serde(default)]
    pub credential: Option<Credential>,
    /// Phone identity the transport is linked to.
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub last_error: Option<SessionFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            state: SessionState::Disconnected,
            credential: None,
            phone: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: Some(self.id.clone()),
            state: self.state,
            phone: self.phone.clone(),
            last_error: self.last_error.clone(),
            has_credential: self.credential.is_some(),
            updated_at: Some(self.updated_at),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Public view of the session, without the credential blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Option<SessionId>,
    pub state: SessionState,
    pub phone: Option<String>,
    pub last_error: Option<SessionFailure>,
    pub has_credential: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Snapshot reported before the first `connect`.
    pub fn none() -> Self {
        Self {
            id: None,
            state: SessionState::Disconnected,
            phone: None,
            last_error: None,
            has_credential: false,
            updated_at: None,
        }
    }
}
