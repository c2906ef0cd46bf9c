// Public API for integration tests and potential library usage

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod routes;
pub mod session;
pub mod state;
pub mod types;
pub mod ws;
