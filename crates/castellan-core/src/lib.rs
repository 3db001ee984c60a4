//! Application state, configuration, scheduler, and shared axum extractors
//! for the Castellan certificate authority.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod extract;
pub mod scheduler;
pub mod tasks;

pub use app::{App, AppBuilder, AppState};
pub use config::Config;
pub use extract::{AcmeAuth, OptionalRequestId, RequestId};

// vim: ts=4
