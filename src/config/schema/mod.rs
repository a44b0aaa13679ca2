use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Generate a `Debug` impl that redacts secret fields.
///
/// Fields listed as `redact(field)` show `"[REDACTED]"` when non-empty or
/// `"[empty]"` when empty; plain fields are printed normally.
///
/// ```ignore
/// redact_debug!(MyConfig, enabled, redact(token), port);
/// ```
macro_rules! redact_debug {
    // Internal: emit a single .field() call
    (@field $builder:ident, $self:ident, redact($field:ident)) => {
        $builder.field(
            stringify!($field),
            &if $self.$field.is_empty() {
                "[empty]"
            } else {
                "[REDACTED]"
            },
        );
    };
    (@field $builder:ident, $self:ident, $field:ident) => {
        $builder.field(stringify!($field), &$self.$field);
    };

    // Internal: recursive TT muncher
    (@fields $builder:ident, $self:ident,) => {};
    (@fields $builder:ident, $self:ident, redact($field:ident), $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, redact($field));
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident, $field:ident, $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, $field);
        redact_debug!(@fields $builder, $self, $($rest)*);
    };

    // Entry point
    ($struct_name:ident, $($fields:tt)*) => {
        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut builder = f.debug_struct(stringify!($struct_name));
                redact_debug!(@fields builder, self, $($fields)*);
                builder.finish()
            }
        }
    };
}

mod console;

pub use console::*;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18800
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// HMAC-SHA256 secret the transport bridge signs webhook bodies with.
    /// Empty disables `/api/transport/events`.
    #[serde(default, rename = "webhookSecret")]
    pub webhook_secret: String,
}

redact_debug!(GatewayConfig, host, port, redact(webhook_secret),);

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_secret: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

fn default_credential_timeout() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay() -> u64 {
    2
}

fn default_reconnect_max_delay() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a credential exchange may stay unanswered.
    #[serde(
        default = "default_credential_timeout",
        rename = "credentialTimeoutSecs"
    )]
    pub credential_timeout_secs: u64,
    #[serde(
        default = "default_max_reconnect_attempts",
        rename = "maxReconnectAttempts"
    )]
    pub max_reconnect_attempts: u32,
    #[serde(
        default = "default_reconnect_base_delay",
        rename = "reconnectBaseDelaySecs"
    )]
    pub reconnect_base_delay_secs: u64,
    #[serde(
        default = "default_reconnect_max_delay",
        rename = "reconnectMaxDelaySecs"
    )]
    pub reconnect_max_delay_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_timeout_secs: default_credential_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_secs: default_reconnect_base_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Administrator account created when the agent directory is empty.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct BootstrapAdminConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

redact_debug!(BootstrapAdminConfig, name, email, redact(password),);

impl BootstrapAdminConfig {
    pub fn is_configured(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(
        default = "console::default_session_timeout_mins",
        rename = "sessionTimeoutMins"
    )]
    pub session_timeout_mins: u64,
    #[serde(default, rename = "bootstrapAdmin")]
    pub bootstrap_admin: BootstrapAdminConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout_mins: console::default_session_timeout_mins(),
            bootstrap_admin: BootstrapAdminConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// SQLite database file. Empty means `<zapdesk home>/zapdesk.db`.
    #[serde(default)]
    pub path: String,
}

impl StorageConfig {
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if self.path.trim().is_empty() {
            Ok(crate::utils::get_zapdesk_home()?.join("zapdesk.db"))
        } else {
            Ok(PathBuf::from(&self.path))
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Loopback,
    Bridge,
}

fn default_loopback_phone() -> String {
    "5500000000000".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default, rename = "bridgeUrl")]
    pub bridge_url: String,
    #[serde(default, rename = "bridgeToken")]
    pub bridge_token: String,
    /// Phone identity reported by the loopback transport.
    #[serde(default = "default_loopback_phone", rename = "loopbackPhone")]
    pub loopback_phone: String,
}

redact_debug!(
    TransportConfig,
    kind,
    bridge_url,
    redact(bridge_token),
    loopback_phone,
);

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            bridge_url: String::new(),
            bridge_token: String::new(),
            loopback_phone: default_loopback_phone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

fn default_inbound_rate_limit() -> usize {
    30
}

fn default_rate_window() -> f64 {
    60.0
}

fn default_inbound_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Inbound messages accepted per contact per window.
    #[serde(default = "default_inbound_rate_limit", rename = "inboundRateLimit")]
    pub inbound_rate_limit: usize,
    #[serde(default = "default_rate_window", rename = "rateWindowSecs")]
    pub rate_window_secs: f64,
    #[serde(default = "default_inbound_capacity", rename = "inboundCapacity")]
    pub inbound_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_rate_limit: default_inbound_rate_limit(),
            rate_window_secs: default_rate_window(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default, rename = "workingHours")]
    pub working_hours: WorkingHoursConfig,
    #[serde(default, rename = "autoResponse")]
    pub auto_response: AutoResponseConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

impl Config {
    /// Initial runtime settings derived from the file.
    pub fn console_settings(&self) -> ConsoleSettings {
        ConsoleSettings {
            routing: self.routing.clone(),
            working_hours: self.working_hours.clone(),
            auto_response: self.auto_response.clone(),
            notifications: self.notifications.clone(),
            session_timeout_mins: self.auth.session_timeout_mins,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), crate::errors::ZapdeskError> {
        self.validate_gateway()?;
        self.validate_session()?;
        self.validate_auth()?;
        self.validate_transport()?;
        self.validate_bus()?;
        self.console_settings().validate()?;
        Ok(())
    }

    fn validate_gateway(&self) -> Result<(), crate::errors::ZapdeskError> {
        use crate::errors::ZapdeskError;
        if self.gateway.port == 0 {
            return Err(ZapdeskError::Config("gateway.port must be > 0".into()));
        }
        if self.gateway.host.trim().is_empty() {
            return Err(ZapdeskError::Config(
                "gateway.host must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn validate_session(&self) -> Result<(), crate::errors::ZapdeskError> {
        use crate::errors::ZapdeskError;
        let s = &self.session;

        if s.credential_timeout_secs == 0 {
            return Err(ZapdeskError::Config(
                "session.credentialTimeoutSecs must be > 0".into(),
            ));
        }
        if s.reconnect_base_delay_secs == 0 {
            return Err(ZapdeskError::Config(
                "session.reconnectBaseDelaySecs must be > 0".into(),
            ));
        }
        if s.reconnect_max_delay_secs < s.reconnect_base_delay_secs {
            return Err(ZapdeskError::Config(
                "session.reconnectMaxDelaySecs must be >= reconnectBaseDelaySecs".into(),
            ));
        }
        if s.max_reconnect_attempts > 100 {
            return Err(ZapdeskError::Config(
                "session.maxReconnectAttempts is unreasonably large (> 100)".into(),
            ));
        }
        Ok(())
    }

    fn validate_auth(&self) -> Result<(), crate::errors::ZapdeskError> {
        use crate::errors::ZapdeskError;
        if self.auth.session_timeout_mins == 0 {
            return Err(ZapdeskError::Config(
                "auth.sessionTimeoutMins must be > 0".into(),
            ));
        }
        let admin = &self.auth.bootstrap_admin;
        if admin.is_configured() && admin.password.chars().count() < 6 {
            return Err(ZapdeskError::Config(
                "auth.bootstrapAdmin.password must be at least 6 characters".into(),
            ));
        }
        Ok(())
    }

    fn validate_transport(&self) -> Result<(), crate::errors::ZapdeskError> {
        use crate::errors::ZapdeskError;
        let t = &self.transport;
        if t.kind == TransportKind::Bridge {
            if t.bridge_url.trim().is_empty() {
                return Err(ZapdeskError::Config(
                    "transport.bridgeUrl is required when transport.kind is \"bridge\"".into(),
                ));
            }
            if !t.bridge_url.starts_with("http://") && !t.bridge_url.starts_with("https://") {
                return Err(ZapdeskError::Config(
                    "transport.bridgeUrl must be an http(s) URL".into(),
                ));
            }
            if self.gateway.webhook_secret.is_empty() {
                return Err(ZapdeskError::Config(
                    "gateway.webhookSecret is required when transport.kind is \"bridge\"".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_bus(&self) -> Result<(), crate::errors::ZapdeskError> {
        use crate::errors::ZapdeskError;
        let b = &self.bus;
        if b.inbound_rate_limit == 0 {
            return Err(ZapdeskError::Config(
                "bus.inboundRateLimit must be > 0".into(),
            ));
        }
        if !b.rate_window_secs.is_finite() || b.rate_window_secs <= 0.0 {
            return Err(ZapdeskError::Config(
                "bus.rateWindowSecs must be a positive finite number".into(),
            ));
        }
        if b.inbound_capacity == 0 {
            return Err(ZapdeskError::Config(
                "bus.inboundCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}
