#![forbid(unsafe_code)]

pub mod connection;
pub mod handler;
pub mod http;
pub mod hub;
pub mod registry;
pub mod router;
pub mod store;
