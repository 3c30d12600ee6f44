//! Core types for the parley group-chat backend
//!
//! This crate provides the foundational types used across all other crates:
//! - Tenant-scoped domain entities (API profiles, personas, sessions, messages)
//! - Identifier formats (owner-embedding session ids, collection names)
//! - Streaming event frames
//! - The shared error classification

pub mod error;
pub mod events;
pub mod ids;
pub mod model;

pub use error::{Error, Result};
pub use events::ChatEvent;
pub use ids::{collection_name, validate_handle, validate_username, SessionId};
pub use model::{ApiProfile, Message, Persona, Session, SessionPatch};
