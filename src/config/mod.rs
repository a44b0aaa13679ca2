pub mod credentials;
pub mod loader;
pub mod schema;

pub use loader::{get_config_path, load_config, save_config};
pub use schema::{
    AuthConfig, AutoResponseConfig, BootstrapAdminConfig, BusConfig, Config, ConsoleSettings,
    GatewayConfig, NotificationsConfig, RoutingConfig, SessionConfig, SharedSettings,
    StorageBackend, StorageConfig, TransportConfig, TransportKind, WorkingHoursConfig,
};
