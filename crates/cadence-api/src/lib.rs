//! Cadence API crate - axum REST routes and the per-account observer channel.
//!
//! REST handlers and WebSocket commands both hand work to the account's
//! serialized worker; neither touches queue state directly.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
