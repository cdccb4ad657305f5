//! Runtime type registration and ancestry queries.
//!
//! Every persistent type is described once, at startup, in a
//! [`TypeRegistry`]. Registration produces a dense [`ClassId`] that the
//! [`ObjectStore`](crate::object::ObjectStore) records per object and that
//! the [`Archive`](crate::archive::Archive) maps to session-local class
//! indices. Types form a single-inheritance chain through their optional
//! parent, which is what [`TypeRegistry::is_ancestor_of`] walks.
//!
//! The registry is an explicit value rather than process-wide state, so a
//! program builds one with a visible list of `register` calls and hands it to
//! whatever needs it.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::object::Persistent;

// ---------------------------------------------------------------------------
// ClassId
// ---------------------------------------------------------------------------

/// Dense index of a registered type, assigned in registration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    /// The raw registration index.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// TypeDescriptor
// ---------------------------------------------------------------------------

/// Creates a default-initialized instance of a persistent type. The loader
/// fills in its fields afterwards through [`Persistent::serialize`].
pub type Factory = fn() -> Box<dyn Persistent>;

/// Registry entry for one persistent type.
#[derive(Clone)]
pub struct TypeDescriptor {
    /// Index assigned at registration time.
    pub id: ClassId,
    /// Unique name; this is what archives store.
    pub name: String,
    /// Parent type, `None` for a root.
    pub parent: Option<ClassId>,
    /// `std::mem::size_of` of the Rust type. Informational only.
    pub size: usize,
    /// Constructor used by the generic loader. Abstract types have none.
    pub factory: Option<Factory>,
    /// Backing Rust type, when registered through a typed `register` call.
    pub rust_type: Option<TypeId>,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("size", &self.size)
            .field("constructible", &self.factory.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Append-only table of [`TypeDescriptor`]s.
///
/// A Rust type can only be registered once; registering it again returns the
/// existing [`ClassId`]. Names must be unique across all types.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    /// Rust TypeId -> ClassId for dedup and typed lookups.
    by_type: HashMap<TypeId, ClassId>,
    /// Name -> ClassId, used when resolving stored class names.
    by_name: HashMap<String, ClassId>,
    /// Indexed by ClassId.0.
    descriptors: Vec<TypeDescriptor>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete persistent type that the loader can instantiate.
    ///
    /// The factory builds `T::default()`. If `T` is already registered the
    /// existing id is returned and `name`/`parent` are ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different type, or if `parent`
    /// is not a registered class.
    pub fn register<T>(&mut self, name: &str, parent: Option<ClassId>) -> ClassId
    where
        T: Persistent + Default,
    {
        fn make<T: Persistent + Default>() -> Box<dyn Persistent> {
            Box::new(T::default())
        }
        self.register_typed::<T>(name, parent, Some(make::<T> as Factory))
    }

    /// Register a type that can be stored but never instantiated generically,
    /// e.g. a base type only ever used as a wanted type for references.
    pub fn register_abstract<T>(&mut self, name: &str, parent: Option<ClassId>) -> ClassId
    where
        T: Persistent,
    {
        self.register_typed::<T>(name, parent, None)
    }

    fn register_typed<T>(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        factory: Option<Factory>,
    ) -> ClassId
    where
        T: Persistent,
    {
        let rust_type = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type) {
            return existing;
        }
        let id = self.push(name, parent, std::mem::size_of::<T>(), factory, Some(rust_type));
        self.by_type.insert(rust_type, id);
        id
    }

    /// Register a descriptor that is not tied to a Rust type.
    ///
    /// This is the raw form of registration: the caller supplies the size and
    /// factory directly. Objects of such a class can only be created through
    /// the factory, so typed lookups ([`lookup`](Self::lookup)) never return it.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register_descriptor(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        size: usize,
        factory: Option<Factory>,
    ) -> ClassId {
        self.push(name, parent, size, factory, None)
    }

    fn push(
        &mut self,
        name: &str,
        parent: Option<ClassId>,
        size: usize,
        factory: Option<Factory>,
        rust_type: Option<TypeId>,
    ) -> ClassId {
        if self.by_name.contains_key(name) {
            panic!("class name '{name}' is already registered for a different type");
        }
        if let Some(parent) = parent {
            assert!(
                (parent.0 as usize) < self.descriptors.len(),
                "parent {parent:?} of class '{name}' is not registered"
            );
        }

        // Growth is geometric; allocation failure aborts the process.
        let id = ClassId(self.descriptors.len() as u32);
        self.descriptors.push(TypeDescriptor {
            id,
            name: name.to_owned(),
            parent,
            size,
            factory,
            rust_type,
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Look up a descriptor by its registered name.
    ///
    /// Returns `None` if absent; probing for optional types is a normal use.
    pub fn find_by_name(&self, name: &str) -> Option<&TypeDescriptor> {
        self.by_name
            .get(name)
            .map(|id| &self.descriptors[id.0 as usize])
    }

    /// Look up the class registered for Rust type `T`.
    pub fn lookup<T: 'static>(&self) -> Option<ClassId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Class of a live object value, resolved through its concrete Rust type.
    pub fn class_of(&self, object: &dyn Persistent) -> Option<ClassId> {
        self.by_type.get(&object.as_any().type_id()).copied()
    }

    /// Get the descriptor for `id`.
    pub fn get(&self, id: ClassId) -> Option<&TypeDescriptor> {
        self.descriptors.get(id.0 as usize)
    }

    /// Name of a registered class.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this registry.
    pub fn name(&self, id: ClassId) -> &str {
        &self.descriptor(id).name
    }

    fn descriptor(&self, id: ClassId) -> &TypeDescriptor {
        self.descriptors
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("{id:?} is not registered"))
    }

    /// Returns `true` if `ancestor` is `descendant` itself or appears in its
    /// parent chain. Walks the chain, so this is O(depth).
    pub fn is_ancestor_of(&self, ancestor: ClassId, descendant: ClassId) -> bool {
        let mut current = Some(descendant);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.get(id).and_then(|d| d.parent);
        }
        false
    }

    /// Inverse of [`is_ancestor_of`](Self::is_ancestor_of).
    #[inline]
    pub fn is_descendant_of(&self, descendant: ClassId, ancestor: ClassId) -> bool {
        self.is_ancestor_of(ancestor, descendant)
    }

    /// Instantiate a class through its factory. `None` for abstract classes.
    pub fn create(&self, id: ClassId) -> Option<Box<dyn Persistent>> {
        self.get(id).and_then(|d| d.factory).map(|make| make())
    }

    /// Total number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether any types have been registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Iterate descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.descriptors.iter()
    }

    /// Returns the names of all registered types, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use crate::ArchiveResult;

    #[derive(Debug, Default)]
    struct Thinker;

    #[derive(Debug, Default)]
    struct Mover {
        speed: u32,
    }

    #[derive(Debug, Default)]
    struct Door;

    impl Persistent for Thinker {
        fn serialize(&mut self, _arc: &mut Archive<'_>) -> ArchiveResult<()> {
            Ok(())
        }
    }

    impl Persistent for Mover {
        fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
            arc.io(&mut self.speed)
        }
    }

    impl Persistent for Door {
        fn serialize(&mut self, _arc: &mut Archive<'_>) -> ArchiveResult<()> {
            Ok(())
        }
    }

    fn hierarchy() -> (TypeRegistry, ClassId, ClassId, ClassId) {
        let mut reg = TypeRegistry::new();
        let thinker = reg.register_abstract::<Thinker>("Thinker", None);
        let mover = reg.register::<Mover>("Mover", Some(thinker));
        let door = reg.register::<Door>("Door", Some(mover));
        (reg, thinker, mover, door)
    }

    #[test]
    fn indices_are_dense_in_registration_order() {
        let (reg, thinker, mover, door) = hierarchy();
        assert_eq!(thinker.index(), 0);
        assert_eq!(mover.index(), 1);
        assert_eq!(door.index(), 2);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = TypeRegistry::new();
        let a = reg.register::<Mover>("Mover", None);
        let b = reg.register::<Mover>("MoverAgain", None);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        assert!(reg.find_by_name("MoverAgain").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_name_panics() {
        let mut reg = TypeRegistry::new();
        reg.register::<Mover>("Thing", None);
        reg.register::<Door>("Thing", None);
    }

    #[test]
    fn find_by_name_absent_is_none() {
        let (reg, ..) = hierarchy();
        assert!(reg.find_by_name("Pillar").is_none());
        assert_eq!(reg.find_by_name("Door").map(|d| d.name.as_str()), Some("Door"));
    }

    #[test]
    fn ancestry_walks_parent_chain() {
        let (reg, thinker, mover, door) = hierarchy();
        assert!(reg.is_ancestor_of(thinker, door));
        assert!(reg.is_ancestor_of(mover, door));
        assert!(reg.is_ancestor_of(door, door));
        assert!(!reg.is_ancestor_of(door, mover));
        assert!(reg.is_descendant_of(door, thinker));
    }

    #[test]
    fn abstract_types_have_no_factory() {
        let (reg, thinker, mover, _) = hierarchy();
        assert!(reg.create(thinker).is_none());
        let made = reg.create(mover).unwrap();
        assert_eq!(reg.class_of(&*made), Some(mover));
    }

    #[test]
    fn raw_descriptor_registration() {
        let (mut reg, thinker, ..) = hierarchy();
        let id = reg.register_descriptor("Marker", Some(thinker), 0, None);
        let desc = reg.get(id).unwrap();
        assert_eq!(desc.parent, Some(thinker));
        assert!(desc.rust_type.is_none());
        assert_eq!(reg.names(), vec!["Door", "Marker", "Mover", "Thinker"]);
    }
}
