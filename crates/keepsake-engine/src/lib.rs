//! Keepsake Engine -- levels, thinkers, snapshots, save games and demos on
//! top of [`keepsake_core`].
//!
//! A [`Level`](level::Level) owns an object store full of thinkers and runs
//! them once per tick, tearing down destroyed objects at the end of every
//! tick. Whole levels can be captured into compressed in-memory snapshots,
//! banked per map, written to save files, and recorded into demos that replay
//! deterministically.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use keepsake_engine::prelude::*;
//!
//! #[derive(Default)]
//! struct Flicker {
//!     bright: bool,
//! }
//!
//! impl Persistent for Flicker {
//!     fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
//!         arc.io(&mut self.bright)
//!     }
//! }
//!
//! impl Thinker for Flicker {
//!     fn think(&mut self, _ctx: &mut ThinkContext<'_>) {
//!         self.bright = !self.bright;
//!     }
//! }
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<Flicker>("Flicker", None);
//!
//! let mut level = Level::new(Arc::new(registry), &EngineConfig::default());
//! level.register_thinker::<Flicker>();
//! let light = level.spawn_thinker(Flicker::default());
//!
//! level.run_ticks(3);
//! assert_eq!(level.tick_count(), 3);
//! assert!(level.store().get::<Flicker>(light).unwrap().bright);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod demo;
pub mod level;
pub mod savegame;
pub mod snapshot;
pub mod thinker;

/// Re-export the core crate for convenience.
pub use keepsake_core;

use keepsake_core::ArchiveError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by engine-level persistence.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The archive layer failed; the operation was aborted.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// File system access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or RNG state could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file is a container but not a save game of this version.
    #[error("not a save game of this version (signature {found:?})")]
    NotASaveGame { found: String },

    /// The file is a container but not a demo of this version.
    #[error("not a demo of this version (signature {found:?})")]
    NotADemo { found: String },

    /// The trailing consistency marker of a save game is wrong.
    #[error("bad save game: consistency marker is {found:#04x}")]
    BadConsistencyMarker { found: u8 },

    /// A demo stream holds an entry this version cannot decode.
    #[error("corrupt demo: {details}")]
    CorruptDemo { details: String },

    /// Snapshots are banked by map name, which cannot be empty.
    #[error("map name must not be empty")]
    EmptyMapName,

    /// A save game refers to a map it holds no snapshot for.
    #[error("no snapshot stored for map '{map}'")]
    MissingSnapshot { map: String },

    /// The logging subscriber could not be installed.
    #[error("could not initialize logging: {0}")]
    Logging(String),
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a global `tracing` subscriber that prints to stderr.
///
/// `filter` uses `EnvFilter` syntax (e.g. `"keepsake_core=debug,warn"`). The
/// `RUST_LOG` environment variable takes precedence when set. Fails if the
/// filter does not parse or a subscriber is already installed.
pub fn init_logging(filter: &str) -> EngineResult<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => parse_filter(filter)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| EngineError::Logging(e.to_string()))
}

fn parse_filter(filter: &str) -> EngineResult<tracing_subscriber::EnvFilter> {
    tracing_subscriber::EnvFilter::try_new(filter)
        .map_err(|e| EngineError::Logging(e.to_string()))
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use keepsake_core::prelude::*;

    pub use crate::config::EngineConfig;
    pub use crate::demo::{
        play_demo, Demo, DemoDivergence, DemoEntry, DemoRecorder, DemoResult,
    };
    pub use crate::level::{InputFrame, Level};
    pub use crate::savegame::{load_game, read_save_info, save_game, SaveGame};
    pub use crate::snapshot::SnapshotBank;
    pub use crate::thinker::{ThinkContext, Thinker, ThinkerList};
    pub use crate::{init_logging, EngineError, EngineResult};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_filter_is_a_logging_error() {
        assert!(matches!(parse_filter("=[bad"), Err(EngineError::Logging(_))));
        assert!(parse_filter("keepsake_core=debug,warn").is_ok());
    }

    #[test]
    fn second_install_fails() {
        // Another test may already have installed the subscriber.
        let _ = init_logging("warn");
        assert!(matches!(init_logging("warn"), Err(EngineError::Logging(_))));
    }
}
