//! Session orchestration
//!
//! The per-session heart of the backend:
//! - FIFO task queue and strictly serial turn execution per session
//! - Sticky runtime bindings with idle eviction
//! - Streamed persona replies fanned out through a per-session event bus
//! - Commit-on-end persistence, per-persona failure containment,
//!   cancellation on session deletion

pub mod bus;
pub mod factory;
pub mod orchestrator;
pub mod turn;

pub use bus::EventBus;
pub use factory::{BackendFactory, ProfileBackendFactory, ResolvedChatBackend};
pub use orchestrator::{OrchestratorConfig, SessionOrchestrator};
pub use turn::{TurnRunner, TurnTask};
