#![warn(clippy::pedantic)]
// Noisy doc/signature lints on the public API surface
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Counts, capacities and timestamps cross integer widths on purpose
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
// router::ConversationRouter, session::SessionManager and friends
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod bus;
pub mod cli;
pub mod config;
pub mod console;
pub mod directory;
pub mod errors;
pub mod gateway;
pub mod model;
pub mod persistence;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;
pub(crate) mod utils;

pub use console::Console;
pub use errors::{ZapdeskError, ZapdeskResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
