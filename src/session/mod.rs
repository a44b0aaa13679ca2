//! Messaging-transport session lifecycle: connect, credential exchange,
//! reconnect and logout.

pub mod manager;

pub use manager::{SessionManager, SessionOptions};
