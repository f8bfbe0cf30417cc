//! The connection registry: `ControlConnection` plus the keyID-indexed
//! `ConnectionManager` that routes end-user requests to one.

pub mod connection;
pub mod manager;

pub use connection::{ConnectSender, ControlConnection};
pub use manager::ConnectionManager;
