//! Per-user remote-desktop session broker.
//!
//! Given a username, [`broker::SessionBroker`] finds that user's running
//! desktop container or provisions a new one, and returns the port and
//! password the remote-display gateway needs to connect.

pub mod api;
pub mod broker;
pub mod config;
pub mod container;
pub mod credential;
pub mod host;
pub mod inventory;
pub mod ports;
pub mod provision;
pub mod readiness;
pub mod seed;
