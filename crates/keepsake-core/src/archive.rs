//! Bidirectional archive over an [`ArchiveFile`].
//!
//! An [`Archive`] is either loading or storing, decided by the mode its file
//! was opened in. Objects implement [`Persistent::serialize`] once and use
//! [`Archive::io`] for every field, so the same code path reads and writes.
//!
//! # Wire format
//!
//! - Fixed-width integers and floats are big-endian.
//! - Counts are 7-bit varints, least significant group first, at most five
//!   bytes for a `u32`.
//! - A string is `count(len + 1)` followed by its UTF-8 bytes. A count of 0
//!   is the null string.
//! - An object reference is `count(index)`, where 0 is null. The first time an
//!   object appears in a session it gets the next sequential index and is
//!   followed by its class tag and its own field stream. The class tag is
//!   `count(0)` plus the class name for a class not yet seen this session,
//!   otherwise `count(class_index + 1)`.
//!
//! Because an object's index is assigned before its fields are written,
//! references back to an object that is still being written resolve to that
//! index. Cycles and self references need no special handling.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::file::{ArchiveFile, OpenMode};
use crate::object::{ObjectId, ObjectStore, Persistent};
use crate::registry::{ClassId, TypeRegistry};
use crate::{ArchiveError, ArchiveResult};

/// Longest encoding of a `u32` count.
const MAX_COUNT_BYTES: usize = 5;

// ---------------------------------------------------------------------------
// ArchiveMode
// ---------------------------------------------------------------------------

/// Direction of an archive session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveMode {
    /// Reading from the file and reconstructing objects.
    Loading,
    /// Writing objects into the file.
    Storing,
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// One loading or storing session.
///
/// The archive borrows the file, the registry used to name and build classes,
/// and the object store that loaded objects are placed in (or stored objects
/// are read from). Object and class indices are local to the session.
///
/// If a loading session fails, every object it created is removed from the
/// store again when the archive is closed or dropped.
pub struct Archive<'a> {
    file: &'a mut dyn ArchiveFile,
    registry: &'a TypeRegistry,
    store: &'a mut ObjectStore,
    mode: ArchiveMode,

    stored_objects: HashMap<ObjectId, u32>,
    stored_classes: HashMap<ClassId, u32>,

    /// Archive index - 1 -> object.
    loaded_objects: Vec<ObjectId>,
    /// Archive class index -> class.
    loaded_classes: Vec<ClassId>,
    /// Objects instantiated by this session, in creation order.
    created: Vec<ObjectId>,

    poisoned: bool,
    closed: bool,
}

impl<'a> Archive<'a> {
    /// Bind an archive to an open file. The file's mode decides whether the
    /// archive loads or stores.
    ///
    /// # Panics
    ///
    /// Panics if `file` is not open.
    pub fn new(
        file: &'a mut dyn ArchiveFile,
        registry: &'a TypeRegistry,
        store: &'a mut ObjectStore,
    ) -> Self {
        assert!(file.is_open(), "cannot bind an archive to a closed file");
        let mode = match file.mode() {
            OpenMode::Read => ArchiveMode::Loading,
            OpenMode::Write => ArchiveMode::Storing,
        };
        Self {
            file,
            registry,
            store,
            mode,
            stored_objects: HashMap::new(),
            stored_classes: HashMap::new(),
            loaded_objects: Vec::new(),
            loaded_classes: Vec::new(),
            created: Vec::new(),
            poisoned: false,
            closed: false,
        }
    }

    #[inline]
    pub fn mode(&self) -> ArchiveMode {
        self.mode
    }

    #[inline]
    pub fn is_loading(&self) -> bool {
        self.mode == ArchiveMode::Loading
    }

    #[inline]
    pub fn is_storing(&self) -> bool {
        self.mode == ArchiveMode::Storing
    }

    /// The registry classes are resolved against.
    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    /// The store objects are read from or loaded into.
    pub fn store(&self) -> &ObjectStore {
        &*self.store
    }

    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut *self.store
    }

    /// Whether the underlying file survives the process (saved to disk).
    pub fn is_persistent(&self) -> bool {
        self.file.is_persistent()
    }

    /// Number of distinct objects written or read so far.
    pub fn objects_seen(&self) -> usize {
        match self.mode {
            ArchiveMode::Loading => self.loaded_objects.len(),
            ArchiveMode::Storing => self.stored_objects.len(),
        }
    }

    /// Number of distinct classes written or read so far.
    pub fn classes_seen(&self) -> usize {
        match self.mode {
            ArchiveMode::Loading => self.loaded_classes.len(),
            ArchiveMode::Storing => self.stored_classes.len(),
        }
    }

    /// Whether an operation of this session has failed.
    pub fn has_failed(&self) -> bool {
        self.poisoned
    }

    /// Read or write `value` depending on the mode.
    #[inline]
    pub fn io<T: Archivable + ?Sized>(&mut self, value: &mut T) -> ArchiveResult<()> {
        value.archive(self)
    }

    /// End the session and close the file.
    ///
    /// A failed loading session removes the objects it created from the
    /// store. Closing twice is a no-op.
    pub fn close(&mut self) -> ArchiveResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.poisoned && self.is_loading() {
            self.roll_back();
        }
        tracing::debug!(
            mode = ?self.mode,
            objects = self.objects_seen(),
            classes = self.classes_seen(),
            failed = self.poisoned,
            "archive session closed"
        );
        self.file.close()
    }

    /// Consume the archive, closing it.
    pub fn finish(mut self) -> ArchiveResult<()> {
        self.close()
    }

    fn roll_back(&mut self) {
        tracing::warn!(
            created = self.created.len(),
            "load failed; removing objects created by this session"
        );
        for id in std::mem::take(&mut self.created).into_iter().rev() {
            self.store.remove(id);
        }
        self.loaded_objects.clear();
    }

    /// Record `error` as a failure of this session and return it. Loading
    /// code that detects corruption on its own should report it through here
    /// so the session rolls back on close.
    pub fn fail<T>(&mut self, error: ArchiveError) -> ArchiveResult<T> {
        self.poisoned = true;
        Err(error)
    }

    fn assert_storing(&self, op: &str) {
        assert!(!self.closed, "{op} called on a closed archive");
        assert!(self.is_storing(), "{op} called on a loading archive");
    }

    fn assert_loading(&self, op: &str) {
        assert!(!self.closed, "{op} called on a closed archive");
        assert!(self.is_loading(), "{op} called on a storing archive");
    }

    // -- raw bytes ----------------------------------------------------------

    /// Write `bytes` verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> ArchiveResult<()> {
        self.assert_storing("write_bytes");
        match self.file.write(bytes) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Fill `buf` from the file. Running out of data is an error.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> ArchiveResult<()> {
        self.assert_loading("read_bytes");
        let position = self.file.tell();
        let read = match self.file.read(buf) {
            Ok(n) => n,
            Err(e) => return self.fail(e),
        };
        if read < buf.len() {
            let length = self.file.length();
            return self.fail(ArchiveError::UnexpectedEof {
                position,
                requested: buf.len(),
                length,
            });
        }
        Ok(())
    }

    /// Read `len` bytes into a new buffer. The length is checked against the
    /// remaining data before anything is allocated.
    pub fn read_byte_vec(&mut self, len: usize) -> ArchiveResult<Vec<u8>> {
        self.assert_loading("read_byte_vec");
        let position = self.file.tell();
        let length = self.file.length();
        if position.saturating_add(len as u64) > length {
            return self.fail(ArchiveError::UnexpectedEof {
                position,
                requested: len,
                length,
            });
        }
        let mut bytes = vec![0u8; len];
        self.read_bytes(&mut bytes)?;
        Ok(bytes)
    }

    // -- counts and strings -------------------------------------------------

    /// Write a variable-length count.
    pub fn write_count(&mut self, mut value: u32) -> ArchiveResult<()> {
        let mut buf = [0u8; MAX_COUNT_BYTES];
        let mut len = 0;
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            buf[len] = byte;
            len += 1;
            if value == 0 {
                break;
            }
        }
        self.write_bytes(&buf[..len])
    }

    /// Read a variable-length count.
    pub fn read_count(&mut self) -> ArchiveResult<u32> {
        let position = self.file.tell();
        let mut value = 0u32;
        for group in 0..MAX_COUNT_BYTES {
            let byte = self.read_u8()?;
            // The last group holds only the top four bits of a u32.
            if group == MAX_COUNT_BYTES - 1 && byte > 0x0f {
                break;
            }
            value |= u32::from(byte & 0x7f) << (7 * group);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        self.fail(ArchiveError::MalformedCount { position })
    }

    /// Write a string, or the null string for `None`.
    pub fn write_opt_str(&mut self, value: Option<&str>) -> ArchiveResult<()> {
        match value {
            None => self.write_count(0),
            Some(s) => {
                let count = u32::try_from(s.len())
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .unwrap_or_else(|| panic!("string of {} bytes is too long to archive", s.len()));
                self.write_count(count)?;
                self.write_bytes(s.as_bytes())
            }
        }
    }

    #[inline]
    pub fn write_str(&mut self, value: &str) -> ArchiveResult<()> {
        self.write_opt_str(Some(value))
    }

    /// Read a string; `None` for the null string.
    pub fn read_opt_string(&mut self) -> ArchiveResult<Option<String>> {
        let count = self.read_count()?;
        if count == 0 {
            return Ok(None);
        }
        let bytes = self.read_byte_vec((count - 1) as usize)?;
        match String::from_utf8(bytes) {
            Ok(s) => Ok(Some(s)),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Read a string; the null string reads as empty.
    pub fn read_string(&mut self) -> ArchiveResult<String> {
        Ok(self.read_opt_string()?.unwrap_or_default())
    }

    // -- objects ------------------------------------------------------------

    /// Write a reference to `id`, writing the object itself the first time
    /// it is referenced in this session.
    ///
    /// A stale id is written as null.
    ///
    /// # Panics
    ///
    /// Panics if the object is checked out of the store (its own destroy
    /// hook or think function is running) and not yet written.
    pub fn write_object(&mut self, id: Option<ObjectId>) -> ArchiveResult<()> {
        self.assert_storing("write_object");
        let Some(id) = id else {
            return self.write_count(0);
        };
        if let Some(&index) = self.stored_objects.get(&id) {
            return self.write_count(index);
        }
        let Some(class) = self.store.class_of(id) else {
            tracing::warn!(%id, "stale object reference stored as null");
            return self.write_count(0);
        };

        let index = self.stored_objects.len() as u32 + 1;
        self.stored_objects.insert(id, index);
        self.write_count(index)?;
        self.write_class(class)?;

        let mut object = self
            .store
            .checkout(id)
            .unwrap_or_else(|| panic!("object {id} is checked out and cannot be stored"));
        let result = object.serialize(self);
        self.store.checkin(id, object);
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    fn write_class(&mut self, class: ClassId) -> ArchiveResult<()> {
        if let Some(&index) = self.stored_classes.get(&class) {
            return self.write_count(index + 1);
        }
        let index = self.stored_classes.len() as u32;
        self.stored_classes.insert(class, index);
        self.write_count(0)?;
        let registry = self.registry;
        self.write_str(registry.name(class))
    }

    /// Read an object reference. The first occurrence of an object builds it
    /// through its class factory, inserts it into the store and reads its
    /// fields.
    ///
    /// With `wanted` set, the object must be of that class or a descendant.
    pub fn read_object(&mut self, wanted: Option<ClassId>) -> ArchiveResult<Option<ObjectId>> {
        self.assert_loading("read_object");
        let index = self.read_count()?;
        if index == 0 {
            return Ok(None);
        }

        let seen = self.loaded_objects.len() as u32;
        if index <= seen {
            let id = self.loaded_objects[(index - 1) as usize];
            if let (Some(wanted), Some(class)) = (wanted, self.store.class_of(id)) {
                self.check_kind(wanted, class)?;
            }
            return Ok(Some(id));
        }
        if index != seen + 1 {
            return self.fail(ArchiveError::ObjectIndexOutOfRange {
                index,
                max: seen + 1,
            });
        }

        let class = self.read_class()?;
        if let Some(wanted) = wanted {
            self.check_kind(wanted, class)?;
        }
        let Some(mut object) = self.registry.create(class) else {
            let name = self.registry.name(class).to_owned();
            return self.fail(ArchiveError::NotConstructible { name });
        };

        let id = self.store.insert_vacant(class);
        self.loaded_objects.push(id);
        self.created.push(id);

        let result = object.serialize(self);
        self.store.checkin(id, object);
        match result {
            Ok(()) => Ok(Some(id)),
            Err(e) => self.fail(e),
        }
    }

    /// Read an object reference that must be a `T` (or a descendant of
    /// `T`'s class).
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered.
    pub fn read_object_of<T: Persistent>(&mut self) -> ArchiveResult<Option<ObjectId>> {
        let wanted = wanted_class::<T>(self.registry);
        self.read_object(Some(wanted))
    }

    fn read_class(&mut self) -> ArchiveResult<ClassId> {
        let tag = self.read_count()?;
        if tag == 0 {
            let name = self.read_opt_string()?.unwrap_or_default();
            let Some(class) = self.registry.find_by_name(&name).map(|d| d.id) else {
                return self.fail(ArchiveError::UnknownClass { name });
            };
            self.loaded_classes.push(class);
            return Ok(class);
        }
        match self.loaded_classes.get((tag - 1) as usize) {
            Some(&class) => Ok(class),
            None => {
                let max = self.loaded_classes.len() as u32;
                self.fail(ArchiveError::ClassIndexOutOfRange { index: tag, max })
            }
        }
    }

    fn check_kind(&mut self, wanted: ClassId, found: ClassId) -> ArchiveResult<()> {
        if self.registry.is_ancestor_of(wanted, found) {
            return Ok(());
        }
        let expected = self.registry.name(wanted).to_owned();
        let found = self.registry.name(found).to_owned();
        self.fail(ArchiveError::TypeMismatch { expected, found })
    }
}

macro_rules! be_primitives {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        impl<'a> Archive<'a> {
            $(
                #[inline]
                pub fn $write(&mut self, value: $ty) -> ArchiveResult<()> {
                    self.write_bytes(&value.to_be_bytes())
                }

                #[inline]
                pub fn $read(&mut self) -> ArchiveResult<$ty> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    self.read_bytes(&mut buf)?;
                    Ok(<$ty>::from_be_bytes(buf))
                }
            )*
        }
    };
}

be_primitives! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl<'a> Archive<'a> {
    #[inline]
    pub fn write_bool(&mut self, value: bool) -> ArchiveResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Any nonzero byte reads as `true`.
    #[inline]
    pub fn read_bool(&mut self) -> ArchiveResult<bool> {
        Ok(self.read_u8()? != 0)
    }
}

impl Drop for Archive<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing archive on drop failed");
        }
    }
}

impl fmt::Debug for Archive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("mode", &self.mode)
            .field("objects", &self.objects_seen())
            .field("classes", &self.classes_seen())
            .field("failed", &self.poisoned)
            .field("closed", &self.closed)
            .finish()
    }
}

fn wanted_class<T: Persistent>(registry: &TypeRegistry) -> ClassId {
    registry.lookup::<T>().unwrap_or_else(|| {
        panic!(
            "type {} is not registered as a persistent class",
            std::any::type_name::<T>()
        )
    })
}

// ---------------------------------------------------------------------------
// Archivable
// ---------------------------------------------------------------------------

/// A value that can be read and written through the same call.
pub trait Archivable {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()>;
}

macro_rules! archivable_via {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Archivable for $ty {
                fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
                    if arc.is_storing() {
                        arc.$write(*self)
                    } else {
                        *self = arc.$read()?;
                        Ok(())
                    }
                }
            }
        )*
    };
}

archivable_via! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
}

impl Archivable for String {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            arc.write_str(self)
        } else {
            *self = arc.read_string()?;
            Ok(())
        }
    }
}

impl Archivable for Option<String> {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            arc.write_opt_str(self.as_deref())
        } else {
            *self = arc.read_opt_string()?;
            Ok(())
        }
    }
}

/// Element count followed by the elements.
impl<T: Archivable + Default> Archivable for Vec<T> {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            let len = u32::try_from(self.len())
                .unwrap_or_else(|_| panic!("vector of {} elements is too long to archive", self.len()));
            arc.write_count(len)?;
            for item in self.iter_mut() {
                item.archive(arc)?;
            }
        } else {
            let len = arc.read_count()?;
            self.clear();
            for _ in 0..len {
                let mut item = T::default();
                item.archive(arc)?;
                self.push(item);
            }
        }
        Ok(())
    }
}

/// Untyped object reference.
impl Archivable for Option<ObjectId> {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            arc.write_object(*self)
        } else {
            *self = arc.read_object(None)?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// A nullable reference to an object whose class is `T`'s class or one of its
/// descendants. Loading checks the class; a mismatch fails the load.
///
/// Rust types do not inherit, so [`get`](Self::get) only succeeds when the
/// object's concrete type is exactly `T`.
pub struct ObjectRef<T> {
    id: Option<ObjectId>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectRef<T> {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id: Some(id),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self {
            id: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.id.is_none()
    }

    pub fn set(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }
}

impl<T: Persistent> ObjectRef<T> {
    /// Resolve the reference. `None` if null, stale, or not exactly a `T`.
    pub fn get<'s>(&self, store: &'s ObjectStore) -> Option<&'s T> {
        store.get::<T>(self.id?)
    }
}

impl<T> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectRef<T> {}

impl<T> Default for ObjectRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ObjectRef<T> {}

impl<T> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "ObjectRef({id})"),
            None => f.write_str("ObjectRef(null)"),
        }
    }
}

impl<T> From<ObjectId> for ObjectRef<T> {
    fn from(id: ObjectId) -> Self {
        Self::new(id)
    }
}

impl<T: Persistent> Archivable for ObjectRef<T> {
    fn archive(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            arc.write_object(self.id)
        } else {
            self.id = arc.read_object_of::<T>()?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
