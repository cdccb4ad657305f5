//! Save games.
//!
//! A save game is one container on disk whose stream holds:
//!
//! | field        | encoding                                     |
//! |--------------|----------------------------------------------|
//! | signature    | string, [`SAVE_SIGNATURE`]                   |
//! | description  | string                                       |
//! | map          | string, name of the map being played         |
//! | snapshots    | [`SnapshotBank`] stream, current map included |
//! | marker       | `u8`, [`CONSISTENCY_MARKER`]                 |
//!
//! The level being played is banked under its map name before the bank is
//! written, so loading is "read the bank, then enter the current map".

use std::path::Path;

use keepsake_core::prelude::*;

use crate::level::Level;
use crate::snapshot::SnapshotBank;
use crate::{EngineError, EngineResult};

/// First string of every save game.
pub const SAVE_SIGNATURE: &str = "KEEPSAKE SAVE v1";

/// Last byte of every save game.
pub const CONSISTENCY_MARKER: u8 = 0x1d;

/// What [`load_game`] found besides the level itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveGame {
    pub description: String,
    pub map_name: String,
}

/// Write a save game to `path`.
///
/// The current level is snapshotted into `bank` under `map_name` first, so
/// the bank keeps that snapshot afterwards.
pub fn save_game(
    path: impl AsRef<Path>,
    description: &str,
    map_name: &str,
    level: &mut Level,
    bank: &mut SnapshotBank,
) -> EngineResult<()> {
    let path = path.as_ref();
    if map_name.is_empty() {
        return Err(EngineError::EmptyMapName);
    }
    level.snapshot_into(bank, map_name)?;

    let mut file = CompressedFile::create(path)?;
    file.set_compress(level.compress_saves());
    // Snapshots are embedded as opaque containers; the outer stream holds no
    // objects of its own.
    let registry = TypeRegistry::new();
    let mut store = ObjectStore::new();
    let mut arc = Archive::new(&mut file, &registry, &mut store);
    arc.write_str(SAVE_SIGNATURE)?;
    arc.write_str(description)?;
    arc.write_str(map_name)?;
    bank.serialize(&mut arc)?;
    arc.write_u8(CONSISTENCY_MARKER)?;
    arc.finish()?;

    tracing::debug!(
        path = %path.display(),
        map = map_name,
        snapshots = bank.len(),
        "game saved"
    );
    Ok(())
}

/// Read the header of a save game without touching any level, e.g. to list
/// saves in a menu.
pub fn read_save_info(path: impl AsRef<Path>) -> EngineResult<SaveGame> {
    let mut file = CompressedFile::open(path)?;
    let registry = TypeRegistry::new();
    let mut store = ObjectStore::new();
    let mut arc = Archive::new(&mut file, &registry, &mut store);
    read_header(&mut arc)
}

fn read_header(arc: &mut Archive<'_>) -> EngineResult<SaveGame> {
    let signature = arc.read_string()?;
    if signature != SAVE_SIGNATURE {
        return Err(EngineError::NotASaveGame { found: signature });
    }
    Ok(SaveGame {
        description: arc.read_string()?,
        map_name: arc.read_string()?,
    })
}

/// Load the save game at `path` into `level` and `bank`.
///
/// Nothing is modified unless the whole file reads back cleanly and the
/// current map's snapshot restores.
pub fn load_game(
    path: impl AsRef<Path>,
    level: &mut Level,
    bank: &mut SnapshotBank,
) -> EngineResult<SaveGame> {
    let path = path.as_ref();
    let mut file = CompressedFile::open(path)?;
    let registry = TypeRegistry::new();
    let mut store = ObjectStore::new();
    let mut loaded = SnapshotBank::new();

    let info = {
        let mut arc = Archive::new(&mut file, &registry, &mut store);
        let info = read_header(&mut arc)?;
        loaded.serialize(&mut arc)?;
        let marker = arc.read_u8()?;
        if marker != CONSISTENCY_MARKER {
            return Err(EngineError::BadConsistencyMarker { found: marker });
        }
        arc.finish()?;
        info
    };

    level.restore_from_bank(&mut loaded, &info.map_name)?;
    *bank = loaded;
    tracing::debug!(
        path = %path.display(),
        map = %info.map_name,
        tick = level.tick_count(),
        "game loaded"
    );
    Ok(info)
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
    fn header_is_readable_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot0.sav");
        let mut level = empty_level();
        save_game(&path, "before the boss", "E1M8", &mut level, &mut SnapshotBank::new()).unwrap();

        let info = read_save_info(&path).unwrap();
        assert_eq!(info.description, "before the boss");
        assert_eq!(info.map_name, "E1M8");
    }

    #[test]
    fn empty_map_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot1.sav");
        let mut level = empty_level();
        let mut bank = SnapshotBank::new();
        let err = save_game(&path, "nowhere", "", &mut level, &mut bank).unwrap_err();
        assert!(matches!(err, EngineError::EmptyMapName));
        assert!(bank.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn foreign_container_is_not_a_save_game() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.bin");
        {
            let registry = TypeRegistry::new();
            let mut store = ObjectStore::new();
            let mut file = CompressedFile::create(&path).unwrap();
            let mut arc = Archive::new(&mut file, &registry, &mut store);
            arc.write_str("SOMETHING ELSE").unwrap();
            arc.finish().unwrap();
        }

        let mut level = empty_level();
        let err = load_game(&path, &mut level, &mut SnapshotBank::new()).unwrap_err();
        assert!(matches!(err, EngineError::NotASaveGame { ref found } if found == "SOMETHING ELSE"));
    }
}
