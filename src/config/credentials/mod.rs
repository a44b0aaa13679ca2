use super::schema::Config;

macro_rules! define_credentials {
    ($( $name:literal, $env:literal => $($path:ident).+ );* $(;)?) => {
        /// (slot name, env var name) pairs.
        pub const CREDENTIAL_ENV_VARS: &[(&str, &str)] = &[$(($name, $env)),*];

        /// Whether a credential slot currently holds a value.
        pub fn is_credential_set(config: &Config, name: &str) -> Option<bool> {
            match name {
                $($name => Some(!config.$($path).+.is_empty()),)*
                _ => None,
            }
        }

        /// Apply environment variable overrides.
        ///
        /// Any `ZAPDESK_*` env var that is set and non-empty overwrites the
        /// corresponding config field, so secrets can be injected without
        /// touching the config file.
        pub fn apply_env_overrides(config: &mut Config) {
            $(
                if let Ok(val) = std::env::var($env) {
                    if !val.is_empty() {
                        config.$($path).+ = val;
                    }
                }
            )*
        }
    };
}

define_credentials! {
    "webhook-secret", "ZAPDESK_WEBHOOK_SECRET" => gateway.webhook_secret;
    "bridge-token",   "ZAPDESK_BRIDGE_TOKEN"   => transport.bridge_token;
    "admin-password", "ZAPDESK_ADMIN_PASSWORD" => auth.bootstrap_admin.password;
}
