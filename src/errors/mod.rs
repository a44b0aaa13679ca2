use thiserror::Error;

use crate::model::DeliveryStatus;

/// Typed error hierarchy for zapdesk.
///
/// Use at module boundaries (session, routing, message store, gateway).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum ZapdeskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential exchange timed out")]
    CredentialTimeout,

    #[error("Credential rejected: {reason}")]
    CredentialRejected { reason: String },

    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error("Agent {agent_id} is at capacity ({capacity} open conversations)")]
    CapacityExceeded { agent_id: String, capacity: u32 },

    #[error("Agent {agent_id} is offline")]
    AgentUnavailable { agent_id: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ZapdeskError.
pub type ZapdeskResult<T> = std::result::Result<T, ZapdeskError>;

impl ZapdeskError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the caller can recover by retrying or changing its request.
    /// Only an exhausted reconnect needs an operator.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConnectionLost { .. })
    }

    /// Stable machine-readable code used in API error bodies and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::CredentialTimeout => "credential_timeout",
            Self::CredentialRejected { .. } => "credential_rejected",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AgentUnavailable { .. } => "agent_unavailable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::Auth(_) => "auth",
            Self::Internal(_) => "internal",
        }
    }
}
