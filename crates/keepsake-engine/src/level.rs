//! Levels: an object store full of thinkers driven by a fixed tick loop.
//!
//! Each call to [`Level::tick`]:
//!
//! 1. Runs every thinker once, in list order, with the current [`InputFrame`].
//! 2. Tears down every object flagged for destruction during the tick
//!    ([`ObjectStore::mass_destroy`]).
//! 3. Drops dead handles from the thinker list and advances the tick counter.
//!
//! All randomness goes through the level's seeded RNG, which is archived with
//! the level, so the same starting state and the same inputs always produce
//! the same state.

use std::sync::Arc;

use keepsake_core::prelude::*;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::thinker::{Thinker, ThinkerList};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// InputFrame
// ---------------------------------------------------------------------------

/// Player input for a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFrame {
    /// Button bitmask.
    pub buttons: u32,
    pub forward: i16,
    pub side: i16,
    /// Turn delta.
    pub angle: i16,
}

impl InputFrame {
    /// Whether nothing is pressed or moved.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Archivable for InputFrame {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        arc.io(&mut self.buttons)?;
        arc.io(&mut self.forward)?;
        arc.io(&mut self.side)?;
        arc.io(&mut self.angle)
    }
}

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// A running level.
pub struct Level {
    registry: Arc<TypeRegistry>,
    store: ObjectStore,
    thinkers: ThinkerList,
    /// Number of ticks executed so far.
    tick_counter: u64,
    /// Input applied by the next tick.
    current_input: InputFrame,
    rng: Pcg32,
    compress_saves: bool,
}

impl Level {
    /// Create an empty level at tick 0.
    pub fn new(registry: Arc<TypeRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            store: ObjectStore::new(),
            thinkers: ThinkerList::new(),
            tick_counter: 0,
            current_input: InputFrame::default(),
            rng: Pcg32::seed_from_u64(config.rng_seed),
            compress_saves: config.compress_saves,
        }
    }

    /// Make `T` a thinker class of this level.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered in the level's registry.
    pub fn register_thinker<T: Thinker>(&mut self) {
        self.thinkers.register::<T>(&self.registry);
    }

    /// Spawn a thinker at the end of the thinker list.
    pub fn spawn_thinker<T: Thinker>(&mut self, value: T) -> ObjectId {
        let id = self.store.spawn(&self.registry, value);
        self.thinkers.add(&self.store, id);
        id
    }

    /// Spawn an object that does not think.
    pub fn spawn<T: Persistent>(&mut self, value: T) -> ObjectId {
        self.store.spawn(&self.registry, value)
    }

    /// Execute one tick. Returns the number of objects destroyed at the end
    /// of it.
    pub fn tick(&mut self) -> usize {
        let tick = self.tick_counter;
        self.thinkers.run_thinkers(
            &self.registry,
            &mut self.store,
            &mut self.rng,
            &self.current_input,
            tick,
        );
        let destroyed = self.store.mass_destroy();
        self.thinkers.prune(&self.store);
        self.tick_counter += 1;
        tracing::trace!(
            tick,
            thinkers = self.thinkers.len(),
            destroyed,
            "tick complete"
        );
        destroyed
    }

    /// Execute `count` ticks.
    pub fn run_ticks(&mut self, count: u64) {
        for _ in 0..count {
            self.tick();
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Set the input used by the following ticks.
    pub fn set_input(&mut self, input: InputFrame) {
        self.current_input = input;
    }

    pub fn current_input(&self) -> &InputFrame {
        &self.current_input
    }

    pub fn rng_mut(&mut self) -> &mut Pcg32 {
        &mut self.rng
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn thinkers(&self) -> &ThinkerList {
        &self.thinkers
    }

    /// Whether snapshots and saves of this level deflate their payload.
    pub fn compress_saves(&self) -> bool {
        self.compress_saves
    }

    /// Store the level into `file`, or replace it with the level read from
    /// `file`, depending on the file's mode.
    ///
    /// The stream holds the tick counter, the current input, the RNG state
    /// and the thinker list. Loading builds the new level in a fresh store and
    /// only swaps it in once everything has been read, so a failed load
    /// leaves the level untouched.
    pub fn serialize(&mut self, file: &mut dyn ArchiveFile) -> EngineResult<()> {
        if file.mode() == OpenMode::Write {
            let rng_state = serde_json::to_string(&self.rng)?;
            let mut arc = Archive::new(file, &self.registry, &mut self.store);
            arc.write_u64(self.tick_counter)?;
            arc.io(&mut self.current_input)?;
            arc.write_str(&rng_state)?;
            self.thinkers.serialize_all(&mut arc)?;
            arc.finish()?;
            return Ok(());
        }

        let mut store = ObjectStore::new();
        let mut thinkers = self.thinkers.empty_like();
        let mut input = InputFrame::default();
        let (tick_counter, rng_state) = {
            let mut arc = Archive::new(file, &self.registry, &mut store);
            let tick_counter = arc.read_u64()?;
            arc.io(&mut input)?;
            let rng_state = arc.read_string()?;
            thinkers.serialize_all(&mut arc)?;
            arc.finish()?;
            (tick_counter, rng_state)
        };
        let rng: Pcg32 = serde_json::from_str(&rng_state)?;

        self.store.shutdown();
        self.store = store;
        self.thinkers = thinkers;
        self.tick_counter = tick_counter;
        self.current_input = input;
        self.rng = rng;
        tracing::debug!(
            tick = tick_counter,
            objects = self.store.len(),
            thinkers = self.thinkers.len(),
            "level loaded"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("tick", &self.tick_counter)
            .field("objects", &self.store.len())
            .field("thinkers", &self.thinkers)
            .field("input", &self.current_input)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thinker::ThinkContext;
    use rand::Rng;

    #[derive(Debug, Default)]
    struct Fuse {
        remaining: u32,
    }

    impl Persistent for Fuse {
        fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
            arc.io(&mut self.remaining)
        }
    }

    impl Thinker for Fuse {
        fn think(&mut self, ctx: &mut ThinkContext<'_>) {
            if self.remaining == 0 {
                ctx.destroy_self();
            } else {
                self.remaining -= 1;
            }
        }
    }

    #[derive(Debug, Default)]
    struct Roller {
        last: u32,
    }

    impl Persistent for Roller {
        fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
            arc.io(&mut self.last)
        }
    }

    impl Thinker for Roller {
        fn think(&mut self, ctx: &mut ThinkContext<'_>) {
            self.last = ctx.rng().gen();
        }
    }

    fn level() -> Level {
        let mut registry = TypeRegistry::new();
        registry.register::<Fuse>("Fuse", None);
        registry.register::<Roller>("Roller", None);
        let mut level = Level::new(Arc::new(registry), &EngineConfig::default());
        level.register_thinker::<Fuse>();
        level.register_thinker::<Roller>();
        level
    }

    #[test]
    fn destroyed_thinkers_leave_at_end_of_tick() {
        let mut level = level();
        let fuse = level.spawn_thinker(Fuse { remaining: 1 });

        assert_eq!(level.tick(), 0);
        assert!(level.store().is_alive(fuse));

        assert_eq!(level.tick(), 1);
        assert!(!level.store().is_alive(fuse));
        assert!(level.thinkers().is_empty());
        assert_eq!(level.tick_count(), 2);
    }

    #[test]
    fn input_frame_emptiness() {
        assert!(InputFrame::default().is_empty());
        let frame = InputFrame {
            side: -3,
            ..Default::default()
        };
        assert!(!frame.is_empty());
    }

    #[test]
    fn store_and_load_restores_rng_and_tick() {
        let mut level = level();
        level.spawn_thinker(Roller::default());
        level.run_ticks(4);
        level.set_input(InputFrame {
            buttons: 2,
            ..Default::default()
        });

        let mut file = MemoryFile::writer();
        level.serialize(&mut file).unwrap();
        let bytes = file.into_bytes();

        level.run_ticks(3);
        let roller = level.thinkers().ids()[0];
        let expected = level.store().get::<Roller>(roller).unwrap().last;

        let mut file = MemoryFile::reader(bytes);
        level.serialize(&mut file).unwrap();
        assert_eq!(level.tick_count(), 4);
        assert_eq!(level.current_input().buttons, 2);

        level.run_ticks(3);
        let roller = level.thinkers().ids()[0];
        assert_eq!(level.store().get::<Roller>(roller).unwrap().last, expected);
    }

    #[test]
    fn failed_load_leaves_level_untouched() {
        let mut level = level();
        let fuse = level.spawn_thinker(Fuse { remaining: 9 });
        level.run_ticks(2);

        let mut file = MemoryFile::writer();
        level.serialize(&mut file).unwrap();
        let mut bytes = file.into_bytes();
        bytes.truncate(bytes.len() - 3);

        let mut file = MemoryFile::reader(bytes);
        assert!(level.serialize(&mut file).is_err());
        assert_eq!(level.tick_count(), 2);
        assert_eq!(level.store().get::<Fuse>(fuse).unwrap().remaining, 7);
    }
}
