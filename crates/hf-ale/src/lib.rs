//! # Adaptive Layer Engine (ALE)
//!
//! Clock-aligned, state-driven layered music for HighFire arena matches.
//!
//! ## Architecture
//!
//! - **Clock**: one musical transport; cycle boundaries are the only points
//!   where fades and stingers may start
//! - **Signals**: discrete game-state events folded into a snapshot
//! - **Bus**: lock-free ingress with duplicate debouncing and overflow coalescing
//! - **Rules**: per-layer activation predicates evaluated on the snapshot
//! - **Layers**: five persistent loop slots (foundation, combat, intensity,
//!   finale, menu), each running `Stopped → FadingIn → Sustaining → FadingOut`
//! - **Stingers**: single-use one-shot cues, at most one instance per identity
//! - **Mixer**: sums layer and stinger renders with per-sample gain ramps
//!
//! ## Real-Time Safety
//!
//! The audio thread only talks to the rest of the world through rtrb rings
//! and `try_lock`. Source acquisition and release happen on the loader side.

pub mod bus;
pub mod clock;
pub mod director;
pub mod engine;
pub mod layers;
pub mod loader;
pub mod mixer;
pub mod profile;
pub mod rules;
pub mod signals;
pub mod source;
pub mod stinger;
pub mod transitions;

pub use bus::*;
pub use clock::*;
pub use director::*;
pub use engine::*;
pub use layers::*;
pub use loader::*;
pub use mixer::*;
pub use profile::*;
pub use rules::*;
pub use signals::*;
pub use source::*;
pub use stinger::*;
pub use transitions::*;

use thiserror::Error;

/// ALE error types
#[derive(Debug, Error)]
pub enum AleError {
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("Unknown stinger: {0}")]
    UnknownStinger(String),

    #[error("Asset '{asset}' failed to load: {reason}")]
    AssetLoad { asset: String, reason: String },

    #[error("Profile error: {0}")]
    ProfileError(String),

    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type AleResult<T> = Result<T, AleError>;

/// Number of persistent layer slots
pub const LAYER_COUNT: usize = 5;

/// Maximum configured stingers
pub const MAX_STINGERS: usize = 16;

/// Maximum interleaved channels the mixer renders
pub const MAX_CHANNELS: usize = 8;

/// Default signal ring capacity
pub const DEFAULT_SIGNAL_QUEUE_CAPACITY: usize = 256;

/// Default command ring capacity
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Default telemetry ring capacity
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 256;
