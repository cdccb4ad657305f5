//! Level snapshots and the per-map snapshot bank.
//!
//! A snapshot is the level's archive stream held in a [`CompressedMemFile`].
//! It can be restored any number of times, embedded in a save game, or kept
//! in a [`SnapshotBank`] while the player is on another map.
//!
//! ```
//! use std::sync::Arc;
//! use keepsake_engine::prelude::*;
//!
//! let mut level = Level::new(Arc::new(TypeRegistry::new()), &EngineConfig::default());
//! level.run_ticks(10);
//!
//! let mut snapshot = level.snapshot().unwrap();
//! level.run_ticks(10);
//! assert_eq!(level.tick_count(), 20);
//!
//! level.restore_snapshot(&mut snapshot).unwrap();
//! assert_eq!(level.tick_count(), 10);
//! ```

use std::collections::BTreeMap;

use keepsake_core::prelude::*;

use crate::level::Level;
use crate::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Level snapshots
// ---------------------------------------------------------------------------

impl Level {
    /// Capture the whole level into a compressed in-memory container.
    pub fn snapshot(&mut self) -> EngineResult<CompressedMemFile> {
        let mut file = CompressedMemFile::new();
        file.set_compress(self.compress_saves());
        self.serialize(&mut file)?;
        Ok(file)
    }

    /// Replace the level with the state held in `snapshot`.
    ///
    /// The snapshot is left intact and can be restored again.
    pub fn restore_snapshot(&mut self, snapshot: &mut CompressedMemFile) -> EngineResult<()> {
        snapshot.reopen()?;
        self.serialize(snapshot)
    }

    /// BLAKE3 hex digest of the level's uncompressed archive stream.
    ///
    /// Two levels with the same objects, thinker order, tick counter, input
    /// and RNG state hash the same.
    pub fn state_hash(&mut self) -> EngineResult<String> {
        let mut file = MemoryFile::writer();
        self.serialize(&mut file)?;
        Ok(blake3::hash(file.as_bytes()).to_hex().to_string())
    }

    /// Snapshot the level into `bank` under `map`, replacing any earlier
    /// snapshot of that map.
    pub fn snapshot_into(&mut self, bank: &mut SnapshotBank, map: &str) -> EngineResult<()> {
        if map.is_empty() {
            return Err(EngineError::EmptyMapName);
        }
        let snapshot = self.snapshot()?;
        bank.insert(map, snapshot);
        Ok(())
    }

    /// Restore the snapshot banked for `map` and drop it from the bank.
    ///
    /// On failure the banked snapshot is kept.
    pub fn restore_from_bank(&mut self, bank: &mut SnapshotBank, map: &str) -> EngineResult<()> {
        let snapshot = bank
            .get_mut(map)
            .ok_or_else(|| EngineError::MissingSnapshot {
                map: map.to_owned(),
            })?;
        self.restore_snapshot(snapshot)?;
        bank.remove(map);
        tracing::debug!(map, tick = self.tick_count(), "level restored from bank");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SnapshotBank
// ---------------------------------------------------------------------------

/// Snapshots of maps the player has left, keyed by map name.
#[derive(Debug, Default)]
pub struct SnapshotBank {
    snapshots: BTreeMap<String, CompressedMemFile>,
}

impl SnapshotBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bank `snapshot` under `map`. Returns the snapshot it replaces.
    ///
    /// # Panics
    ///
    /// Panics if `map` is empty.
    pub fn insert(&mut self, map: &str, snapshot: CompressedMemFile) -> Option<CompressedMemFile> {
        assert!(!map.is_empty(), "snapshot map name must not be empty");
        self.snapshots.insert(map.to_owned(), snapshot)
    }

    pub fn get(&self, map: &str) -> Option<&CompressedMemFile> {
        self.snapshots.get(map)
    }

    pub fn get_mut(&mut self, map: &str) -> Option<&mut CompressedMemFile> {
        self.snapshots.get_mut(map)
    }

    pub fn remove(&mut self, map: &str) -> Option<CompressedMemFile> {
        self.snapshots.remove(map)
    }

    pub fn contains(&self, map: &str) -> bool {
        self.snapshots.contains_key(map)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Banked map names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    /// Store or load every banked snapshot.
    ///
    /// The stream is a sequence of `map name, embedded container` pairs
    /// terminated by an empty name. Loading replaces the bank's contents.
    pub fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        if arc.is_storing() {
            for (map, snapshot) in &mut self.snapshots {
                arc.write_str(map)?;
                snapshot.serialize(arc)?;
            }
            return arc.write_str("");
        }

        let mut loaded = BTreeMap::new();
        loop {
            let map = arc.read_string()?;
            if map.is_empty() {
                break;
            }
            let mut snapshot = CompressedMemFile::new();
            snapshot.serialize(arc)?;
            loaded.insert(map, snapshot);
        }
        self.snapshots = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;

    fn empty_level() -> Level {
        Level::new(Arc::new(TypeRegistry::new()), &EngineConfig::default())
    }

    #[test]
    fn state_hash_follows_state() {
        let mut a = empty_level();
        let mut b = empty_level();
        assert_eq!(a.state_hash().unwrap(), b.state_hash().unwrap());
        assert_eq!(a.state_hash().unwrap().len(), 64);

        a.tick();
        assert_ne!(a.state_hash().unwrap(), b.state_hash().unwrap());
        b.tick();
        assert_eq!(a.state_hash().unwrap(), b.state_hash().unwrap());
    }

    #[test]
    fn bank_restore_consumes_the_entry() {
        let mut level = empty_level();
        let mut bank = SnapshotBank::new();
        level.run_ticks(5);
        level.snapshot_into(&mut bank, "E1M1").unwrap();
        assert!(bank.contains("E1M1"));

        level.run_ticks(5);
        level.restore_from_bank(&mut bank, "E1M1").unwrap();
        assert_eq!(level.tick_count(), 5);
        assert!(bank.is_empty());
    }

    #[test]
    fn banking_under_an_empty_name_is_an_error() {
        let mut level = empty_level();
        let mut bank = SnapshotBank::new();
        let err = level.snapshot_into(&mut bank, "").unwrap_err();
        assert!(matches!(err, EngineError::EmptyMapName));
        assert!(bank.is_empty());
    }

    #[test]
    fn missing_bank_entry_is_an_error() {
        let mut level = empty_level();
        let mut bank = SnapshotBank::new();
        let err = level.restore_from_bank(&mut bank, "MAP07").unwrap_err();
        assert!(matches!(err, EngineError::MissingSnapshot { ref map } if map == "MAP07"));
    }

    #[test]
    fn bank_roundtrips_through_an_archive() {
        let mut level = empty_level();
        let mut bank = SnapshotBank::new();
        level.run_ticks(1);
        level.snapshot_into(&mut bank, "MAP01").unwrap();
        level.run_ticks(2);
        level.snapshot_into(&mut bank, "MAP02").unwrap();

        let registry = TypeRegistry::new();
        let mut store = ObjectStore::new();
        let mut file = MemoryFile::writer();
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        bank.serialize(&mut arc).unwrap();
        arc.finish().unwrap();

        let mut loaded = SnapshotBank::new();
        let mut file = MemoryFile::reader(file.into_bytes());
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        loaded.serialize(&mut arc).unwrap();
        arc.finish().unwrap();

        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["MAP01", "MAP02"]);
        level.restore_from_bank(&mut loaded, "MAP02").unwrap();
        assert_eq!(level.tick_count(), 3);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_map_name_panics() {
        SnapshotBank::new().insert("", CompressedMemFile::new());
    }
}
