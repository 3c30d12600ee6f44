//! Parley server
//!
//! HTTP and WebSocket surface over the session orchestrator, the stores,
//! and the retrieval engine.

pub mod auth;
pub mod error;
pub mod http;
pub mod state;
pub mod ws;

pub use auth::{AuthUser, USER_HEADER};
pub use error::ApiError;
pub use http::create_router;
pub use state::AppState;
