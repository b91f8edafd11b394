#![forbid(unsafe_code)]

//! Authoritative chat state and its websocket fan-out.

pub mod config;
pub mod server;
pub mod telemetry;

pub use server::connection::ConnectionSettings;
pub use server::http::{AppState, HealthState, serve};
pub use server::hub::{ChatHub, HubSettings};
