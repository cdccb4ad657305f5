//! Persistent objects and the store that owns them.
//!
//! An [`ObjectId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and a *slot* in the low 32 bits. The generation is bumped
//! every time a slot is freed, so a handle to a destroyed object is detected
//! immediately instead of silently aliasing whatever reuses the slot.
//!
//! Destruction comes in two flavours. [`ObjectStore::remove`] and
//! [`ObjectStore::destroy_now`] free a slot on the spot.
//! [`ObjectStore::destroy`] only flags the object; the flagged set is torn
//! down once per tick by [`ObjectStore::mass_destroy`] from a snapshot of the
//! pending list, never while iterating the live slots.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use crate::archive::Archive;
use crate::registry::{ClassId, TypeRegistry};
use crate::ArchiveResult;

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// Handle to an object living in an [`ObjectStore`].
///
/// The low half names the store slot, the high half counts how many times
/// that slot has been vacated. A handle whose count no longer matches its
/// slot refers to an object that is gone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new(slot: u32, generation: u32) -> Self {
        Self(u64::from(generation) << 32 | u64::from(slot))
    }

    /// Position in the store's slot table.
    #[inline]
    pub fn index(self) -> u32 {
        (self.0 & u64::from(u32::MAX)) as u32
    }

    /// Times the slot was freed before this object took it.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Packed form, suitable as a hash or map key outside the store.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(#{}:{})", self.index(), self.generation())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// ObjectFlags
// ---------------------------------------------------------------------------

/// Per-object state bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    /// Queued for deletion at the next [`ObjectStore::mass_destroy`].
    pub const MASS_DESTRUCTION: Self = Self(0x0000_0001);
    /// Being torn down by the mass destruction pass.
    pub const CLEANUP: Self = Self(0x0000_0002);

    /// No flags set.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for ObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::MASS_DESTRUCTION) {
            names.push("MASS_DESTRUCTION");
        }
        if self.contains(Self::CLEANUP) {
            names.push("CLEANUP");
        }
        write!(f, "ObjectFlags({})", names.join(" | "))
    }
}

// ---------------------------------------------------------------------------
// Persistent
// ---------------------------------------------------------------------------

/// Upcast to [`Any`] for downcasting trait objects back to concrete types.
///
/// Implemented for every `'static` type; never implement it by hand.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An object that can live in an [`ObjectStore`] and be archived.
///
/// `serialize` must issue exactly the same sequence of archive calls whether
/// the archive is loading or storing. The simplest way to guarantee that is
/// to only use [`Archive::io`] for fields:
///
/// ```
/// use keepsake_core::prelude::*;
///
/// #[derive(Default)]
/// struct Light {
///     level: i16,
///     target: ObjectRef<Light>,
/// }
///
/// impl Persistent for Light {
///     fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
///         arc.io(&mut self.level)?;
///         arc.io(&mut self.target)
///     }
/// }
/// ```
pub trait Persistent: AsAny {
    /// Read or write this object's fields through `arc`.
    fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()>;

    /// Called once before the object's slot is freed by
    /// [`ObjectStore::mass_destroy`], [`ObjectStore::destroy_now`] or
    /// [`ObjectStore::shutdown`]. The object itself is checked out of the
    /// store while this runs; every other object flagged in the same batch is
    /// still resident.
    fn on_destroy(&mut self, _id: ObjectId, _store: &mut ObjectStore) {}
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

struct Entry {
    class: ClassId,
    flags: ObjectFlags,
    /// `None` while checked out.
    object: Option<Box<dyn Persistent>>,
}

/// Owns every persistent object, addressed by [`ObjectId`].
///
/// Freed slots are kept in a FIFO queue so that reuse is spread over time
/// rather than concentrated on the most recently freed slot.
pub struct ObjectStore {
    slots: Vec<Option<Entry>>,
    /// Current generation per slot. Never shrinks, so a popped tail slot
    /// keeps its generation when it is appended again.
    generations: Vec<u32>,
    free_indices: VecDeque<u32>,
    /// Objects flagged for mass destruction, in flag order.
    to_destroy: Vec<ObjectId>,
    inactive: bool,
    destroying: bool,
}

impl ObjectStore {
    /// Create an empty, active store.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            free_indices: VecDeque::new(),
            to_destroy: Vec::new(),
            inactive: false,
            destroying: false,
        }
    }

    /// Place an object of class `class` in the first freed slot, or a new
    /// slot at the end. The returned id stays valid until the object is
    /// removed.
    ///
    /// # Panics
    ///
    /// Panics after [`shutdown`](Self::shutdown).
    pub fn insert(&mut self, class: ClassId, object: Box<dyn Persistent>) -> ObjectId {
        self.place(class, Some(object))
    }

    /// Reserve a slot for an object that is still being built. The slot
    /// behaves as checked out until [`checkin`](Self::checkin).
    pub(crate) fn insert_vacant(&mut self, class: ClassId) -> ObjectId {
        self.place(class, None)
    }

    fn place(&mut self, class: ClassId, object: Option<Box<dyn Persistent>>) -> ObjectId {
        assert!(
            !self.inactive,
            "object store is shut down; no further objects may be created"
        );
        let entry = Entry {
            class,
            flags: ObjectFlags::empty(),
            object,
        };
        if let Some(index) = self.free_indices.pop_front() {
            self.slots[index as usize] = Some(entry);
            ObjectId::new(index, self.generations[index as usize])
        } else {
            let index = self.slots.len();
            if index == self.generations.len() {
                self.generations.push(0);
            }
            self.slots.push(Some(entry));
            ObjectId::new(index as u32, self.generations[index])
        }
    }

    /// Insert a typed value, resolving its class through `registry`.
    ///
    /// # Panics
    ///
    /// Panics if `T` was never registered.
    pub fn spawn<T: Persistent>(&mut self, registry: &TypeRegistry, value: T) -> ObjectId {
        let class = registry.lookup::<T>().unwrap_or_else(|| {
            panic!(
                "type {} is not registered as a persistent class",
                std::any::type_name::<T>()
            )
        });
        self.insert(class, Box::new(value))
    }

    /// Free the object's slot immediately and hand the object back. No
    /// destroy hook runs. Only the last slot shrinks the table.
    ///
    /// Returns `None` if `id` is stale, the store is shut down, or the object
    /// is currently checked out (the slot is still freed in that case).
    pub fn remove(&mut self, id: ObjectId) -> Option<Box<dyn Persistent>> {
        if self.inactive {
            return None;
        }
        let idx = self.live_index(id)?;
        let entry = self.slots[idx].take()?;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        if idx + 1 == self.slots.len() {
            self.slots.pop();
        } else {
            self.free_indices.push_back(idx as u32);
        }
        if entry.flags.contains(ObjectFlags::MASS_DESTRUCTION) && !self.destroying {
            self.to_destroy.retain(|&queued| queued != id);
        }
        entry.object
    }

    /// Flag an object for destruction at the next
    /// [`mass_destroy`](Self::mass_destroy). The object stays resident and
    /// reachable until then.
    ///
    /// Returns `false` if `id` is stale or already flagged.
    pub fn destroy(&mut self, id: ObjectId) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        if entry.flags.contains(ObjectFlags::MASS_DESTRUCTION) {
            return false;
        }
        entry.flags.insert(ObjectFlags::MASS_DESTRUCTION);
        self.to_destroy.push(id);
        true
    }

    /// Run the object's destroy hook and free its slot right away.
    ///
    /// Returns `false` if `id` is stale or the object is checked out.
    pub fn destroy_now(&mut self, id: ObjectId) -> bool {
        let Some(mut object) = self.checkout(id) else {
            return false;
        };
        if let Some(entry) = self.entry_mut(id) {
            entry.flags.insert(ObjectFlags::CLEANUP);
        }
        object.on_destroy(id, self);
        self.remove(id);
        true
    }

    /// Destroy every flagged object, in the order they were flagged.
    ///
    /// The pending list is drained into a batch first. All destroy hooks of
    /// the batch run before any of its slots is freed, so a hook may still
    /// look at another object of the same batch. Objects flagged by hooks
    /// form the next batch of the same call.
    ///
    /// Returns the number of objects destroyed.
    ///
    /// # Panics
    ///
    /// Panics if called reentrantly from a destroy hook.
    pub fn mass_destroy(&mut self) -> usize {
        assert!(!self.destroying, "mass_destroy called reentrantly");
        self.destroying = true;

        let mut destroyed = 0;
        loop {
            let batch = std::mem::take(&mut self.to_destroy);
            if batch.is_empty() {
                break;
            }

            for &id in &batch {
                if let Some(entry) = self.entry_mut(id) {
                    entry.flags.insert(ObjectFlags::CLEANUP);
                }
                if let Some(mut object) = self.checkout(id) {
                    object.on_destroy(id, self);
                    self.checkin(id, object);
                }
            }

            for id in batch {
                if self.remove(id).is_some() {
                    destroyed += 1;
                }
            }
        }

        self.destroying = false;
        if destroyed > 0 {
            tracing::trace!(destroyed, live = self.len(), "mass destruction complete");
        }
        destroyed
    }

    /// Destroy everything and refuse further insertions.
    ///
    /// Every live object is flagged and torn down through one final
    /// [`mass_destroy`](Self::mass_destroy); anything a hook creates along
    /// the way is dropped without a hook. Afterwards [`insert`](Self::insert)
    /// panics and [`remove`](Self::remove) is a no-op.
    pub fn shutdown(&mut self) {
        if self.inactive {
            return;
        }
        for id in self.ids() {
            self.destroy(id);
        }
        let destroyed = self.mass_destroy();
        self.inactive = true;
        self.slots.clear();
        self.free_indices.clear();
        self.to_destroy.clear();
        tracing::debug!(destroyed, "object store shut down");
    }

    /// Whether the store still accepts new objects.
    pub fn is_active(&self) -> bool {
        !self.inactive
    }

    /// Returns `true` if `id` refers to a resident object (including one
    /// flagged for destruction but not yet destroyed).
    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.live_index(id).is_some()
    }

    /// Class recorded for the object at insertion.
    pub fn class_of(&self, id: ObjectId) -> Option<ClassId> {
        self.entry(id).map(|e| e.class)
    }

    /// Current flags of the object.
    pub fn flags(&self, id: ObjectId) -> Option<ObjectFlags> {
        self.entry(id).map(|e| e.flags)
    }

    /// Whether the object is waiting for the next mass destruction.
    pub fn is_pending_destruction(&self, id: ObjectId) -> bool {
        self.flags(id)
            .is_some_and(|f| f.contains(ObjectFlags::MASS_DESTRUCTION))
    }

    /// Borrow the object as its concrete type.
    pub fn get<T: Persistent>(&self, id: ObjectId) -> Option<&T> {
        self.get_dyn(id)?.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the object as its concrete type.
    pub fn get_mut<T: Persistent>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.get_dyn_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Borrow the object as a trait object. `None` while it is checked out.
    pub fn get_dyn(&self, id: ObjectId) -> Option<&dyn Persistent> {
        self.entry(id)?.object.as_deref()
    }

    /// Mutably borrow the object as a trait object.
    pub fn get_dyn_mut(&mut self, id: ObjectId) -> Option<&mut (dyn Persistent + 'static)> {
        self.entry_mut(id)?.object.as_deref_mut()
    }

    /// Take the object out of its slot so it can be given `&mut` access to
    /// the store (or to an archive wrapping the store). The slot stays
    /// reserved; put the object back with [`checkin`](Self::checkin).
    ///
    /// Returns `None` if `id` is stale or the object is already checked out.
    pub fn checkout(&mut self, id: ObjectId) -> Option<Box<dyn Persistent>> {
        self.entry_mut(id)?.object.take()
    }

    /// Return a checked-out object to its slot. If the slot was freed in the
    /// meantime the object is dropped.
    pub fn checkin(&mut self, id: ObjectId, object: Box<dyn Persistent>) {
        match self.entry_mut(id) {
            Some(entry) => entry.object = Some(object),
            None => tracing::trace!(%id, "slot freed while object was checked out; dropping it"),
        }
    }

    /// Ids of all resident objects, in slot order.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| ObjectId::new(idx as u32, self.generations[idx]))
            .collect()
    }

    /// Number of resident objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the slot table, including free slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of objects flagged for the next mass destruction.
    pub fn pending_destruction(&self) -> usize {
        self.to_destroy.len()
    }

    fn live_index(&self, id: ObjectId) -> Option<usize> {
        let idx = id.index() as usize;
        if idx >= self.slots.len() || self.generations[idx] != id.generation() {
            return None;
        }
        self.slots[idx].as_ref().map(|_| idx)
    }

    fn entry(&self, id: ObjectId) -> Option<&Entry> {
        let idx = self.live_index(id)?;
        self.slots[idx].as_ref()
    }

    fn entry_mut(&mut self, id: ObjectId) -> Option<&mut Entry> {
        let idx = self.live_index(id)?;
        self.slots[idx].as_mut()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("live", &self.len())
            .field("slots", &self.slots.len())
            .field("free", &self.free_indices.len())
            .field("pending_destruction", &self.to_destroy.len())
            .field("active", &!self.inactive)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
