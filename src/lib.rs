//! Wakegate - a reverse proxy that wakes its backend on demand
//!
//! This library provides a single-backend proxy that:
//! - Spawns the backend process on the first request and streams the boot
//!   log to that request while polling the backend with linear backoff
//! - Forwards HTTP traffic once the backend answers
//! - Fans one upstream WebSocket out to every connected client socket
//! - Stops the backend after a period of inactivity, when it asks for a
//!   reload, or when it crashes

pub mod broadcast;
pub mod config;
pub mod error;
pub mod git;
pub mod health;
pub mod idle;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod startup;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
