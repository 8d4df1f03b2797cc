//! ClassHub Central: notification feed, permission-error surfacing and chat
//! assistants.
//!
//! The binary in `main.rs` wires these modules into an HTTP server and a
//! CLI; integration tests in `tests/` drive them directly.

pub mod api;
pub mod assistant;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod session;
pub mod store;
