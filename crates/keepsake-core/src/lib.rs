//! Keepsake core -- persistence of live, cyclic, polymorphic object graphs.
//!
//! This crate provides the pieces every save game, level snapshot and demo
//! recording is built on:
//!
//! - a [`TypeRegistry`](registry::TypeRegistry) of named, single-inheritance
//!   type descriptors with optional factories,
//! - an [`ObjectStore`](object::ObjectStore) owning every persistent object
//!   behind a generational [`ObjectId`](object::ObjectId), with deferred
//!   ("mass") destruction,
//! - an [`Archive`](archive::Archive) that reads or writes primitives and
//!   object references while preserving object identity and cycles,
//! - a self-describing container format and the byte backends the archive
//!   runs on (see [`container`] and [`file`]).
//!
//! # Quick Start
//!
//! ```
//! use keepsake_core::prelude::*;
//!
//! #[derive(Default)]
//! struct Node {
//!     value: u32,
//!     next: ObjectRef<Node>,
//! }
//!
//! impl Persistent for Node {
//!     fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
//!         arc.io(&mut self.value)?;
//!         arc.io(&mut self.next)
//!     }
//! }
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<Node>("Node", None);
//!
//! let mut store = ObjectStore::new();
//! let node = store.spawn(&registry, Node { value: 7, ..Default::default() });
//! store.get_mut::<Node>(node).unwrap().next = ObjectRef::new(node);
//!
//! let mut file = MemoryFile::writer();
//! let mut arc = Archive::new(&mut file, &registry, &mut store);
//! arc.write_object(Some(node)).unwrap();
//! arc.finish().unwrap();
//!
//! let mut loaded_store = ObjectStore::new();
//! let mut file = MemoryFile::reader(file.into_bytes());
//! let mut arc = Archive::new(&mut file, &registry, &mut loaded_store);
//! let loaded = arc.read_object_of::<Node>().unwrap().unwrap();
//! arc.finish().unwrap();
//!
//! let node = loaded_store.get::<Node>(loaded).unwrap();
//! assert_eq!(node.value, 7);
//! assert_eq!(node.next.id(), Some(loaded));
//! ```

#![deny(unsafe_code)]

pub mod archive;
pub mod container;
pub mod file;
pub mod object;
pub mod registry;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while reading or writing archives and containers.
///
/// Every variant is fatal for the operation that produced it: a load either
/// fully succeeds or is aborted, there is no partially restored graph.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The data does not start with the container signature.
    #[error("not a keepsake container: expected signature {expected:?}, found {found:?}")]
    BadSignature { expected: [u8; 4], found: [u8; 4] },

    /// The container is shorter than its header or declared payload.
    #[error("container truncated: needed {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },

    /// The decompressor rejected the payload.
    #[error("could not decompress container payload: {details}")]
    Decompress { details: String },

    /// The payload decompressed to a different size than the header declares.
    #[error("container payload decompressed to {actual} bytes, header declares {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A read went past the end of the archived data.
    #[error("attempt to read {requested} bytes at offset {position} past end of data ({length} bytes)")]
    UnexpectedEof {
        position: u64,
        requested: usize,
        length: u64,
    },

    /// A variable-length count did not terminate within 5 bytes.
    #[error("malformed count at offset {position}")]
    MalformedCount { position: u64 },

    /// A stored string is not valid UTF-8.
    #[error("stored string is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    /// A stored object index refers past the objects seen so far.
    #[error("object reference too high ({index}; max is {max})")]
    ObjectIndexOutOfRange { index: u32, max: u32 },

    /// A stored class index refers past the classes seen so far.
    #[error("class reference too high ({index}; max is {max})")]
    ClassIndexOutOfRange { index: u32, max: u32 },

    /// A stored class name is not registered in this process.
    #[error("unknown class '{name}'")]
    UnknownClass { name: String },

    /// A stored object is not of the requested type (or a subtype of it).
    #[error("expected to extract an object of type '{expected}', found one of type '{found}' instead")]
    TypeMismatch { expected: String, found: String },

    /// A stored class has no factory, so it cannot be instantiated on load.
    #[error("class '{name}' cannot be instantiated: no factory registered")]
    NotConstructible { name: String },

    /// Underlying file I/O failed.
    #[error("container I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archive::{Archivable, Archive, ArchiveMode, ObjectRef};
    pub use crate::container::{ContainerHeader, CONTAINER_SIGNATURE};
    pub use crate::file::{
        ArchiveFile, CompressedFile, CompressedMemFile, MemoryFile, OpenMode, PlainFile,
    };
    pub use crate::object::{AsAny, ObjectFlags, ObjectId, ObjectStore, Persistent};
    pub use crate::registry::{ClassId, Factory, TypeDescriptor, TypeRegistry};
    pub use crate::{ArchiveError, ArchiveResult};
}
