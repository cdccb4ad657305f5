//! Thinkers: persistent objects that act once per tick.
//!
//! A [`Thinker`] is a [`Persistent`] type with a `think` method. Because the
//! store only holds `Box<dyn Persistent>`, the [`ThinkerList`] keeps a
//! type-erased think function per registered class and downcasts to the
//! concrete type when it runs one.

use keepsake_core::prelude::*;
use rand_pcg::Pcg32;

use crate::level::InputFrame;

// ---------------------------------------------------------------------------
// Thinker
// ---------------------------------------------------------------------------

/// A persistent object that runs every tick.
pub trait Thinker: Persistent {
    fn think(&mut self, ctx: &mut ThinkContext<'_>);
}

/// Type-erased think function stored per class.
type ThinkFn = fn(&mut dyn Persistent, &mut ThinkContext<'_>);

fn think_as<T: Thinker>(object: &mut dyn Persistent, ctx: &mut ThinkContext<'_>) {
    if let Some(thinker) = object.as_any_mut().downcast_mut::<T>() {
        thinker.think(ctx);
    }
}

// ---------------------------------------------------------------------------
// ThinkContext
// ---------------------------------------------------------------------------

/// What a thinker can see and touch while it thinks.
///
/// The thinking object itself is checked out of the store for the duration of
/// the call, so looking up [`id`](Self::id) in the store yields `None`.
pub struct ThinkContext<'a> {
    id: ObjectId,
    tick: u64,
    registry: &'a TypeRegistry,
    store: &'a mut ObjectStore,
    rng: &'a mut Pcg32,
    input: &'a InputFrame,
    spawned: &'a mut Vec<ObjectId>,
}

impl<'a> ThinkContext<'a> {
    /// Id of the thinking object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Tick being executed.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn registry(&self) -> &TypeRegistry {
        self.registry
    }

    pub fn store(&self) -> &ObjectStore {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut *self.store
    }

    /// The level RNG. Use it for every gameplay roll so demos stay in sync.
    pub fn rng(&mut self) -> &mut Pcg32 {
        &mut *self.rng
    }

    /// Input frame of the current tick.
    pub fn input(&self) -> &InputFrame {
        self.input
    }

    /// Spawn a new thinker. It first thinks on the next tick.
    pub fn spawn_thinker<T: Thinker>(&mut self, value: T) -> ObjectId {
        let id = self.store.spawn(self.registry, value);
        self.spawned.push(id);
        id
    }

    /// Spawn a plain persistent object.
    pub fn spawn<T: Persistent>(&mut self, value: T) -> ObjectId {
        self.store.spawn(self.registry, value)
    }

    /// Flag the thinking object for destruction at the end of the tick.
    pub fn destroy_self(&mut self) {
        self.store.destroy(self.id);
    }

    /// Flag another object for destruction at the end of the tick.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        self.store.destroy(id)
    }
}

// ---------------------------------------------------------------------------
// ThinkerList
// ---------------------------------------------------------------------------

/// Thinker handles in run order plus the think function of every thinker
/// class.
#[derive(Clone, Default)]
pub struct ThinkerList {
    /// Indexed by `ClassId::index()`.
    think_fns: Vec<Option<ThinkFn>>,
    order: Vec<ObjectId>,
}

impl ThinkerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list with the same thinker classes and no thinkers.
    pub fn empty_like(&self) -> Self {
        Self {
            think_fns: self.think_fns.clone(),
            order: Vec::new(),
        }
    }

    /// Make `T` a thinker class.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered in `registry`.
    pub fn register<T: Thinker>(&mut self, registry: &TypeRegistry) {
        let class = registry.lookup::<T>().unwrap_or_else(|| {
            panic!(
                "thinker type {} is not registered",
                std::any::type_name::<T>()
            )
        });
        let idx = class.index() as usize;
        if idx >= self.think_fns.len() {
            self.think_fns.resize(idx + 1, None);
        }
        self.think_fns[idx] = Some(think_as::<T>);
    }

    /// Whether objects of `class` can think.
    pub fn is_thinker_class(&self, class: ClassId) -> bool {
        self.think_fn(class).is_some()
    }

    fn think_fn(&self, class: ClassId) -> Option<ThinkFn> {
        self.think_fns.get(class.index() as usize).copied().flatten()
    }

    /// Append a thinker to the run order.
    ///
    /// # Panics
    ///
    /// Panics if the object's class has no think function.
    pub fn add(&mut self, store: &ObjectStore, id: ObjectId) {
        let class = store
            .class_of(id)
            .unwrap_or_else(|| panic!("cannot add stale object {id} as a thinker"));
        assert!(
            self.is_thinker_class(class),
            "object {id} of {class:?} is not a thinker class"
        );
        self.order.push(id);
    }

    /// Thinkers in run order.
    pub fn ids(&self) -> &[ObjectId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Run every live thinker once, in order.
    ///
    /// Thinkers flagged for destruction earlier in the same tick are skipped.
    /// Thinkers spawned during the pass are appended after it.
    pub fn run_thinkers(
        &mut self,
        registry: &TypeRegistry,
        store: &mut ObjectStore,
        rng: &mut Pcg32,
        input: &InputFrame,
        tick: u64,
    ) {
        let mut spawned = Vec::new();
        for &id in &self.order {
            if store.is_pending_destruction(id) {
                continue;
            }
            let Some(think) = store.class_of(id).and_then(|c| self.think_fn(c)) else {
                continue;
            };
            let Some(mut object) = store.checkout(id) else {
                continue;
            };
            let mut ctx = ThinkContext {
                id,
                tick,
                registry,
                store: &mut *store,
                rng: &mut *rng,
                input,
                spawned: &mut spawned,
            };
            think(&mut *object, &mut ctx);
            store.checkin(id, object);
        }
        self.order.extend(spawned);
    }

    /// Drop handles of objects that no longer exist.
    pub fn prune(&mut self, store: &ObjectStore) {
        self.order.retain(|&id| store.is_alive(id));
    }

    /// Destroy every thinker through one mass destruction pass.
    pub fn destroy_all(&mut self, store: &mut ObjectStore) {
        for &id in &self.order {
            store.destroy(id);
        }
        store.mass_destroy();
        self.order.clear();
    }

    /// Store or load the whole list.
    ///
    /// Storing writes `1, object` per live thinker followed by `0`. Loading
    /// destroys the current thinkers and reads entries until the `0`.
    pub fn serialize_all(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            for &id in &self.order {
                if arc.store().is_pending_destruction(id) || !arc.store().is_alive(id) {
                    continue;
                }
                arc.write_u8(1)?;
                arc.write_object(Some(id))?;
            }
            return arc.write_u8(0);
        }

        self.destroy_all(arc.store_mut());
        while arc.read_u8()? != 0 {
            let Some(id) = arc.read_object(None)? else {
                continue;
            };
            let class = arc.store().class_of(id);
            match class {
                Some(class) if self.is_thinker_class(class) => self.order.push(id),
                _ => {
                    let found = class
                        .map(|c| arc.registry().name(c).to_owned())
                        .unwrap_or_default();
                    return arc.fail(ArchiveError::TypeMismatch {
                        expected: "thinker".to_owned(),
                        found,
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ThinkerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThinkerList")
            .field("thinkers", &self.order.len())
            .field(
                "classes",
                &self.think_fns.iter().filter(|t| t.is_some()).count(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[derive(Debug, Default)]
    struct Ticker {
        count: u32,
        spawn_at: Option<u32>,
    }

    impl Persistent for Ticker {
        fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
            arc.io(&mut self.count)
        }
    }

    impl Thinker for Ticker {
        fn think(&mut self, ctx: &mut ThinkContext<'_>) {
            self.count += 1;
            if self.spawn_at == Some(self.count) {
                ctx.spawn_thinker(Ticker::default());
            }
        }
    }

    #[derive(Debug, Default)]
    struct Rock;

    impl Persistent for Rock {
        fn serialize(&mut self, _arc: &mut Archive<'_>) -> ArchiveResult<()> {
            Ok(())
        }
    }

    fn setup() -> (TypeRegistry, ObjectStore, ThinkerList, Pcg32) {
        let mut registry = TypeRegistry::new();
        registry.register::<Ticker>("Ticker", None);
        registry.register::<Rock>("Rock", None);
        let mut list = ThinkerList::new();
        list.register::<Ticker>(&registry);
        (registry, ObjectStore::new(), list, Pcg32::seed_from_u64(1))
    }

    #[test]
    fn spawned_thinkers_run_from_next_pass() {
        let (registry, mut store, mut list, mut rng) = setup();
        let first = store.spawn(
            &registry,
            Ticker {
                count: 0,
                spawn_at: Some(1),
            },
        );
        list.add(&store, first);

        let input = InputFrame::default();
        list.run_thinkers(&registry, &mut store, &mut rng, &input, 0);
        assert_eq!(list.len(), 2);
        let child = list.ids()[1];
        assert_eq!(store.get::<Ticker>(child).unwrap().count, 0);

        list.run_thinkers(&registry, &mut store, &mut rng, &input, 1);
        assert_eq!(store.get::<Ticker>(first).unwrap().count, 2);
        assert_eq!(store.get::<Ticker>(child).unwrap().count, 1);
    }

    #[test]
    fn flagged_thinkers_are_skipped() {
        let (registry, mut store, mut list, mut rng) = setup();
        let id = store.spawn(&registry, Ticker::default());
        list.add(&store, id);
        store.destroy(id);

        list.run_thinkers(&registry, &mut store, &mut rng, &InputFrame::default(), 0);
        assert_eq!(store.get::<Ticker>(id).unwrap().count, 0);

        store.mass_destroy();
        list.prune(&store);
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "not a thinker class")]
    fn adding_a_non_thinker_panics() {
        let (registry, mut store, mut list, _) = setup();
        let rock = store.spawn(&registry, Rock);
        list.add(&store, rock);
    }

    #[test]
    fn serialize_all_roundtrip() {
        let (registry, mut store, mut list, _) = setup();
        for count in [3, 5] {
            let id = store.spawn(
                &registry,
                Ticker {
                    count,
                    spawn_at: None,
                },
            );
            list.add(&store, id);
        }

        let mut file = MemoryFile::writer();
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        list.serialize_all(&mut arc).unwrap();
        arc.finish().unwrap();

        let mut loaded_store = ObjectStore::new();
        let mut loaded = list.empty_like();
        let mut file = MemoryFile::reader(file.into_bytes());
        let mut arc = Archive::new(&mut file, &registry, &mut loaded_store);
        loaded.serialize_all(&mut arc).unwrap();
        arc.finish().unwrap();

        let counts: Vec<u32> = loaded
            .ids()
            .iter()
            .map(|&id| loaded_store.get::<Ticker>(id).unwrap().count)
            .collect();
        assert_eq!(counts, vec![3, 5]);
    }

    #[test]
    fn loading_a_non_thinker_entry_fails() {
        let (registry, mut store, list, _) = setup();
        let rock = store.spawn(&registry, Rock);

        let mut file = MemoryFile::writer();
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        arc.write_u8(1).unwrap();
        arc.write_object(Some(rock)).unwrap();
        arc.write_u8(0).unwrap();
        arc.finish().unwrap();

        let mut loaded_store = ObjectStore::new();
        let mut loaded = list.empty_like();
        let mut file = MemoryFile::reader(file.into_bytes());
        let mut arc = Archive::new(&mut file, &registry, &mut loaded_store);
        let err = loaded.serialize_all(&mut arc).unwrap_err();
        drop(arc);
        assert!(matches!(err, ArchiveError::TypeMismatch { ref found, .. } if found == "Rock"));
        assert!(loaded_store.is_empty());
    }
}
