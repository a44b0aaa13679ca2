//! Domain records shared by the session, routing and message-store layers.

/// Generates a string-backed identifier newtype.
///
/// Ids serialize as plain strings so they round-trip through JSON APIs and
/// the persistence layer unchanged.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

mod agent;
mod conversation;
mod label;
mod message;
mod session;

pub use agent::*;
pub use conversation::*;
pub use label::*;
pub use message::*;
pub use session::*;

define_id!(
    /// External contact identity (the contact's phone number / JID user part).
    ContactId
);
