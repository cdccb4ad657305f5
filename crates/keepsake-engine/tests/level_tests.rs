//! End-to-end tests for levels, snapshots, the snapshot bank and save games.

use std::sync::Arc;

use keepsake_engine::prelude::*;
use rand::Rng;

// ---------------------------------------------------------------------------
// A tiny game
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Player {
    health: i32,
    x: i32,
}

impl Persistent for Player {
    fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        arc.io(&mut self.health)?;
        arc.io(&mut self.x)
    }
}

impl Thinker for Player {
    fn think(&mut self, ctx: &mut ThinkContext<'_>) {
        self.x += i32::from(ctx.input().forward);
    }
}

/// Fires a missile at its target every `period` ticks.
#[derive(Debug, Default)]
struct Turret {
    target: ObjectRef<Player>,
    period: u32,
    cooldown: u32,
    shots: u32,
}

impl Persistent for Turret {
    fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        arc.io(&mut self.target)?;
        arc.io(&mut self.period)?;
        arc.io(&mut self.cooldown)?;
        arc.io(&mut self.shots)
    }
}

impl Thinker for Turret {
    fn think(&mut self, ctx: &mut ThinkContext<'_>) {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            return;
        }
        self.cooldown = self.period;
        self.shots += 1;
        let damage = ctx.rng().gen_range(1..=8);
        ctx.spawn_thinker(Missile {
            target: self.target,
            damage,
            flight: 2,
        });
    }
}

/// Hits its target after `flight` ticks and disappears.
#[derive(Debug, Default)]
struct Missile {
    target: ObjectRef<Player>,
    damage: i32,
    flight: u32,
}

impl Persistent for Missile {
    fn serialize(&mut self, arc: &mut Archive<'_>) -> ArchiveResult<()> {
        arc.io(&mut self.target)?;
        arc.io(&mut self.damage)?;
        arc.io(&mut self.flight)
    }
}

impl Thinker for Missile {
    fn think(&mut self, ctx: &mut ThinkContext<'_>) {
        if self.flight > 0 {
            self.flight -= 1;
            return;
        }
        if let Some(id) = self.target.id() {
            if let Some(player) = ctx.store_mut().get_mut::<Player>(id) {
                player.health -= self.damage;
            }
        }
        ctx.destroy_self();
    }
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register::<Player>("Player", None);
    registry.register::<Turret>("Turret", None);
    registry.register::<Missile>("Missile", None);
    Arc::new(registry)
}

fn new_level(config: &EngineConfig) -> Level {
    let mut level = Level::new(registry(), config);
    level.register_thinker::<Player>();
    level.register_thinker::<Turret>();
    level.register_thinker::<Missile>();
    level
}

fn populated_level(config: &EngineConfig) -> Level {
    let mut level = new_level(config);
    let player = level.spawn_thinker(Player { health: 100, x: 0 });
    level.spawn_thinker(Turret {
        target: ObjectRef::new(player),
        period: 3,
        ..Default::default()
    });
    level
}

fn player_of(level: &Level) -> &Player {
    let id = level.thinkers().ids()[0];
    level.store().get::<Player>(id).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn missiles_hit_and_vanish() {
    let mut level = populated_level(&EngineConfig::default());
    level.run_ticks(20);

    let player = player_of(&level);
    assert!(player.health < 100);
    assert!(level.thinkers().len() <= 4, "spent missiles are removed");
}

#[test]
fn snapshot_restore_resumes_identically() {
    let mut level = populated_level(&EngineConfig::default());
    level.run_ticks(7);
    let mut snapshot = level.snapshot().unwrap();

    level.run_ticks(13);
    let health = player_of(&level).health;
    let hash = level.state_hash().unwrap();

    level.restore_snapshot(&mut snapshot).unwrap();
    assert_eq!(level.tick_count(), 7);
    level.run_ticks(13);
    assert_eq!(player_of(&level).health, health);
    assert_eq!(level.state_hash().unwrap(), hash);
}

#[test]
fn references_survive_a_snapshot() {
    let mut level = populated_level(&EngineConfig::default());
    level.run_ticks(6);
    let mut snapshot = level.snapshot().unwrap();
    level.restore_snapshot(&mut snapshot).unwrap();

    let ids = level.thinkers().ids().to_vec();
    let player = ids[0];
    let turret = level.store().get::<Turret>(ids[1]).unwrap();
    assert_eq!(turret.target.id(), Some(player));
    assert_eq!(ids.len(), 3, "one missile in flight");
    for &id in &ids[2..] {
        let missile = level.store().get::<Missile>(id).unwrap();
        assert_eq!(missile.target.id(), Some(player));
    }
}

#[test]
fn uncompressed_snapshots_are_stored() {
    let config = EngineConfig {
        compress_saves: false,
        ..Default::default()
    };
    let mut level = populated_level(&config);
    let snapshot = level.snapshot().unwrap();
    let header = ContainerHeader::parse(snapshot.container_bytes().unwrap()).unwrap();
    assert!(header.is_stored());
}

#[test]
fn save_and_load_game() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("save1.ksav");

    let config = EngineConfig::default();
    let mut level = populated_level(&config);
    let mut bank = SnapshotBank::new();

    // A map visited earlier.
    let mut other = new_level(&config);
    other.spawn_thinker(Player { health: 5, x: 9 });
    other.run_ticks(2);
    other.snapshot_into(&mut bank, "MAP01").unwrap();

    level.run_ticks(10);
    let hash = level.state_hash().unwrap();
    save_game(&path, "hub visit", "MAP02", &mut level, &mut bank).unwrap();

    let mut fresh = new_level(&config);
    let mut fresh_bank = SnapshotBank::new();
    let info = load_game(&path, &mut fresh, &mut fresh_bank).unwrap();
    assert_eq!(info.description, "hub visit");
    assert_eq!(info.map_name, "MAP02");
    assert_eq!(fresh.tick_count(), 10);
    assert_eq!(fresh.state_hash().unwrap(), hash);

    assert_eq!(fresh_bank.names().collect::<Vec<_>>(), vec!["MAP01"]);
    fresh.restore_from_bank(&mut fresh_bank, "MAP01").unwrap();
    assert_eq!(player_of(&fresh).x, 9);
}

#[test]
fn corrupt_marker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.ksav");
    let mut level = populated_level(&EngineConfig {
        compress_saves: false,
        ..Default::default()
    });
    level.run_ticks(3);
    save_game(&path, "x", "MAP01", &mut level, &mut SnapshotBank::new()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    *bytes.last_mut().unwrap() = 0x1c;
    std::fs::write(&path, &bytes).unwrap();

    let mut target = populated_level(&EngineConfig::default());
    let before = target.state_hash().unwrap();
    let err = load_game(&path, &mut target, &mut SnapshotBank::new()).unwrap_err();
    assert!(matches!(err, EngineError::BadConsistencyMarker { found: 0x1c }));
    assert_eq!(target.state_hash().unwrap(), before);
}

#[test]
fn loading_a_missing_file_fails_with_io() {
    let dir = tempfile::tempdir().unwrap();
    let mut level = new_level(&EngineConfig::default());
    let err = load_game(dir.path().join("nope"), &mut level, &mut SnapshotBank::new()).unwrap_err();
    assert!(matches!(err, EngineError::Archive(ArchiveError::Io(_))));
}
