//! Demo recording and deterministic playback.
//!
//! A [`Demo`] holds a snapshot of the level taken when recording started, the
//! input of every tick that had any, and state hash checkpoints taken every
//! `checkpoint_interval` ticks. Playing it back restores the snapshot, feeds
//! the recorded inputs tick by tick and compares hashes at every checkpoint.
//!
//! # Recording
//!
//! ```
//! use std::sync::Arc;
//! use keepsake_engine::prelude::*;
//!
//! let mut level = Level::new(Arc::new(TypeRegistry::new()), &EngineConfig::default());
//! let mut recorder = DemoRecorder::new(&mut level, 10).unwrap();
//! for _ in 0..30 {
//!     recorder.record(&mut level).unwrap();
//!     level.tick();
//! }
//! let demo = recorder.finish();
//!
//! let result = play_demo(&mut level, &demo).unwrap();
//! assert!(result.completed);
//! assert_eq!(result.ticks_played, 30);
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use keepsake_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::level::{InputFrame, Level};
use crate::{EngineError, EngineResult};

/// First string of every demo file.
pub const DEMO_SIGNATURE: &str = "KEEPSAKE DEMO v1";

const TAG_INPUT: u8 = 1;
const TAG_CHECKPOINT: u8 = 2;

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

/// A recorded session: starting snapshot plus inputs and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demo {
    /// Container bytes of the level snapshot taken when recording started.
    pub initial_snapshot: Vec<u8>,
    /// Level tick at which the snapshot was taken.
    pub start_tick: u64,
    /// Number of ticks recorded. Playback runs exactly this many ticks.
    pub total_ticks: u64,
    pub entries: Vec<DemoEntry>,
}

/// One entry of a [`Demo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoEntry {
    /// Input that was active during `tick`.
    Input { tick: u64, input: InputFrame },
    /// Level state hash taken before `tick` ran, after its input was set.
    Checkpoint { tick: u64, state_hash: String },
}

impl Demo {
    /// Store or load the demo through `arc`.
    ///
    /// Stream: signature, start tick, tick total, embedded snapshot
    /// container, entry count, then `tag, tick, payload` per entry.
    pub fn serialize(&mut self, arc: &mut Archive<'_>) -> EngineResult<()> {
        if arc.is_storing() {
            arc.write_str(DEMO_SIGNATURE)?;
            arc.write_u64(self.start_tick)?;
            arc.write_u64(self.total_ticks)?;
            let mut snapshot = CompressedMemFile::from_container(self.initial_snapshot.clone())?;
            snapshot.serialize(arc)?;
            let count = u32::try_from(self.entries.len()).map_err(|_| EngineError::CorruptDemo {
                details: format!("{} entries do not fit a demo", self.entries.len()),
            })?;
            arc.write_count(count)?;
            for entry in &self.entries {
                match entry {
                    DemoEntry::Input { tick, input } => {
                        arc.write_u8(TAG_INPUT)?;
                        arc.write_u64(*tick)?;
                        let mut input = *input;
                        arc.io(&mut input)?;
                    }
                    DemoEntry::Checkpoint { tick, state_hash } => {
                        arc.write_u8(TAG_CHECKPOINT)?;
                        arc.write_u64(*tick)?;
                        arc.write_str(state_hash)?;
                    }
                }
            }
            return Ok(());
        }

        let signature = arc.read_string()?;
        if signature != DEMO_SIGNATURE {
            return Err(EngineError::NotADemo { found: signature });
        }
        let start_tick = arc.read_u64()?;
        let total_ticks = arc.read_u64()?;
        let mut snapshot = CompressedMemFile::new();
        snapshot.serialize(arc)?;
        let initial_snapshot = snapshot.into_container().unwrap_or_default();

        let count = arc.read_count()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let tag = arc.read_u8()?;
            let tick = arc.read_u64()?;
            let entry = match tag {
                TAG_INPUT => {
                    let mut input = InputFrame::default();
                    arc.io(&mut input)?;
                    DemoEntry::Input { tick, input }
                }
                TAG_CHECKPOINT => DemoEntry::Checkpoint {
                    tick,
                    state_hash: arc.read_string()?,
                },
                other => {
                    return Err(EngineError::CorruptDemo {
                        details: format!("unknown entry tag {other} at tick {tick}"),
                    })
                }
            };
            entries.push(entry);
        }

        *self = Demo {
            initial_snapshot,
            start_tick,
            total_ticks,
            entries,
        };
        Ok(())
    }

    /// Write the demo to `path` as a container.
    pub fn write_to(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let mut file = CompressedFile::create(path)?;
        let registry = TypeRegistry::new();
        let mut store = ObjectStore::new();
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        Demo::serialize(&mut self.clone(), &mut arc)?;
        arc.finish()?;
        Ok(())
    }

    /// Read a demo written by [`write_to`](Self::write_to).
    pub fn read_from(path: impl AsRef<Path>) -> EngineResult<Self> {
        let mut file = CompressedFile::open(path)?;
        let registry = TypeRegistry::new();
        let mut store = ObjectStore::new();
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        let mut demo = Demo {
            initial_snapshot: Vec::new(),
            start_tick: 0,
            total_ticks: 0,
            entries: Vec::new(),
        };
        Demo::serialize(&mut demo, &mut arc)?;
        arc.finish()?;
        Ok(demo)
    }
}

// ---------------------------------------------------------------------------
// DemoResult
// ---------------------------------------------------------------------------

/// Outcome of [`play_demo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoResult {
    /// Whether every recorded tick was played without divergence.
    pub completed: bool,
    pub ticks_played: u64,
    /// The first checkpoint whose hash did not match.
    pub first_divergence: Option<DemoDivergence>,
}

/// A checkpoint that did not match during playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoDivergence {
    pub tick: u64,
    pub expected_hash: String,
    pub actual_hash: String,
}

// ---------------------------------------------------------------------------
// DemoRecorder
// ---------------------------------------------------------------------------

/// Builds a [`Demo`] while a level runs.
///
/// Call [`record`](Self::record) before every tick, then
/// [`finish`](Self::finish).
pub struct DemoRecorder {
    demo: Demo,
    checkpoint_interval: u64,
    last_tick: Option<u64>,
}

impl DemoRecorder {
    /// Snapshot `level` and start recording.
    ///
    /// A checkpoint is taken on every tick that is a multiple of
    /// `checkpoint_interval`, or on every tick when it is 0.
    pub fn new(level: &mut Level, checkpoint_interval: u64) -> EngineResult<Self> {
        let snapshot = level.snapshot()?;
        Ok(Self {
            demo: Demo {
                initial_snapshot: snapshot.into_container().unwrap_or_default(),
                start_tick: level.tick_count(),
                total_ticks: 0,
                entries: Vec::new(),
            },
            checkpoint_interval,
            last_tick: None,
        })
    }

    /// Like [`new`](Self::new), taking the checkpoint interval from `config`.
    pub fn from_config(level: &mut Level, config: &EngineConfig) -> EngineResult<Self> {
        Self::new(level, config.demo_checkpoint_interval)
    }

    fn wants_checkpoint(&self, tick: u64) -> bool {
        self.checkpoint_interval == 0 || tick % self.checkpoint_interval == 0
    }

    /// Record the level's upcoming tick: its input and, on checkpoint ticks,
    /// its state hash.
    pub fn record(&mut self, level: &mut Level) -> EngineResult<()> {
        let tick = level.tick_count();
        let hash = if self.wants_checkpoint(tick) {
            Some(level.state_hash()?)
        } else {
            None
        };
        let input = *level.current_input();
        self.record_tick(tick, &input, hash);
        Ok(())
    }

    /// Record one tick by hand. Empty inputs are not stored.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is not greater than the previously recorded tick.
    pub fn record_tick(&mut self, tick: u64, input: &InputFrame, state_hash: Option<String>) {
        if let Some(prev) = self.last_tick {
            assert!(
                tick > prev,
                "demo tick {tick} recorded after tick {prev}; ticks must increase"
            );
        }
        self.last_tick = Some(tick);
        self.demo.total_ticks += 1;

        if !input.is_empty() {
            self.demo.entries.push(DemoEntry::Input {
                tick,
                input: *input,
            });
        }
        if let Some(state_hash) = state_hash {
            self.demo
                .entries
                .push(DemoEntry::Checkpoint { tick, state_hash });
        }
    }

    pub fn finish(self) -> Demo {
        tracing::debug!(
            ticks = self.demo.total_ticks,
            entries = self.demo.entries.len(),
            "demo recorded"
        );
        self.demo
    }
}

// ---------------------------------------------------------------------------
// play_demo()
// ---------------------------------------------------------------------------

/// Play `demo` on `level`, checking every checkpoint.
///
/// The demo is validated before the level is touched. Playback stops at the
/// first divergent checkpoint. Thinker classes must already be registered on
/// `level`.
pub fn play_demo(level: &mut Level, demo: &Demo) -> Result<DemoResult, anyhow::Error> {
    let mut inputs: BTreeMap<u64, InputFrame> = BTreeMap::new();
    let mut checkpoints: BTreeMap<u64, &str> = BTreeMap::new();
    for entry in &demo.entries {
        match entry {
            DemoEntry::Input { tick, input } => {
                if inputs.insert(*tick, *input).is_some() {
                    return Err(anyhow::anyhow!("demo has two inputs for tick {tick}"));
                }
            }
            DemoEntry::Checkpoint { tick, state_hash } => {
                if checkpoints.insert(*tick, state_hash.as_str()).is_some() {
                    return Err(anyhow::anyhow!("demo has two checkpoints for tick {tick}"));
                }
            }
        }
    }

    let start_tick = demo.start_tick;
    let end_tick = start_tick.checked_add(demo.total_ticks).ok_or_else(|| {
        anyhow::anyhow!(
            "tick range overflow: start {start_tick} + {} ticks exceeds u64::MAX",
            demo.total_ticks
        )
    })?;

    let mut snapshot = CompressedMemFile::from_container(demo.initial_snapshot.clone())
        .map_err(|e| anyhow::anyhow!("demo snapshot is not a container: {e}"))?;
    level
        .restore_snapshot(&mut snapshot)
        .map_err(|e| anyhow::anyhow!("failed to restore demo snapshot: {e}"))?;

    let mut ticks_played = 0;
    for tick in start_tick..end_tick {
        level.set_input(inputs.get(&tick).copied().unwrap_or_default());

        if let Some(&expected) = checkpoints.get(&tick) {
            let actual = level.state_hash()?;
            if actual != expected {
                tracing::warn!(tick, "demo diverged");
                return Ok(DemoResult {
                    completed: false,
                    ticks_played,
                    first_divergence: Some(DemoDivergence {
                        tick,
                        expected_hash: expected.to_owned(),
                        actual_hash: actual,
                    }),
                });
            }
        }

        level.tick();
        ticks_played += 1;
    }

    Ok(DemoResult {
        completed: true,
        ticks_played,
        first_divergence: None,
    })
}
