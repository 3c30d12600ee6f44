//! Centralized constants
//!
//! Single source of truth for operational defaults shared across crates.
//! Tenant-specific tunables (proactivity, memory windows, turn caps) live on
//! the persona entities, not here.

/// Timeouts and eviction horizons (seconds unless noted)
pub mod timeouts {
    /// Per-LLM-call wall-clock timeout
    pub const LLM_CALL_SECS: u64 = 60;

    /// Idle eviction horizon for a session's runtime binding
    pub const SESSION_IDLE_EVICTION_SECS: u64 = 1_800;

    /// How often the eviction sweeper runs
    pub const EVICTION_SWEEP_SECS: u64 = 60;

    /// URL ingestion fetch timeout
    pub const INGEST_FETCH_SECS: u64 = 20;
}

/// Retrieval engine tuning
pub mod rag {
    /// Target chunk size in characters
    pub const CHUNK_TARGET_CHARS: usize = 500;

    /// Overlap carried between adjacent chunks, in characters
    pub const CHUNK_OVERLAP_CHARS: usize = 50;

    /// Default passages returned by a knowledge search
    pub const DEFAULT_TOP_K: usize = 4;

    /// Upper bound a tool invocation may request
    pub const MAX_TOP_K: usize = 8;

    /// Fallback vector dimension when an embedding profile carries none
    pub const DEFAULT_EMBEDDING_DIM: u32 = 1536;
}

/// Turn scheduler scoring weights
pub mod scheduler {
    /// Added when the persona is explicitly @-mentioned
    pub const MENTION_BOOST: f64 = 100.0;

    /// Per turn of silence since the persona last spoke
    pub const SILENCE_WEIGHT: f64 = 0.05;

    /// Added when someone else spoke last and the persona is talkative enough
    pub const TURN_TAKING_BOOST: f64 = 0.15;

    /// Proactivity floor for the turn-taking boost
    pub const TURN_TAKING_MIN_PROACTIVITY: f64 = 0.4;

    /// Added for a fresh user message when the persona is eager enough
    pub const FRESHNESS_BOOST: f64 = 0.2;

    /// Proactivity floor for the freshness boost
    pub const FRESHNESS_MIN_PROACTIVITY: f64 = 0.6;

    /// Half-width of the uniform noise term
    pub const NOISE_AMPLITUDE: f64 = 0.1;

    /// Subtracted while a persona is cooling down
    pub const COOLDOWN_PENALTY: f64 = 0.6;

    /// Per consecutive turn already spoken
    pub const CONSECUTIVE_PENALTY: f64 = 0.3;

    /// Turns a selected persona stays on cooldown
    pub const COOLDOWN_TURNS: u64 = 2;
}

/// Message history bounds
pub mod history {
    /// Hard cap on messages loaded for a single turn
    pub const MAX_PER_REQUEST: u32 = 128;
}

/// Event bus sizing
pub mod bus {
    /// Per-subscriber buffered events before the subscriber is dropped
    pub const PER_SUBSCRIBER_BUFFER: usize = 64;
}
