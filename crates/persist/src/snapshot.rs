use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;
use worldsave_common::{FormatVersion, LocalId, ModId};

use crate::integrity;

/// One captured entity: its snapshot-local id and its encoded components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub local_id: LocalId,
    /// Component type name to registry-encoded bytes.
    pub components: BTreeMap<String, Vec<u8>>,
    /// Local ids this entity's components point at.
    #[serde(default)]
    pub references: BTreeSet<LocalId>,
}

impl EntityRecord {
    pub fn new(local_id: LocalId) -> Self {
        Self {
            local_id,
            components: BTreeMap::new(),
            references: BTreeSet::new(),
        }
    }
}

/// Entities sharing an identical set of component types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archetype {
    pub component_types: BTreeSet<String>,
    pub entities: Vec<EntityRecord>,
}

impl Archetype {
    /// Sort key used for canonical ordering: the concatenated type names.
    pub fn sort_key(&self) -> String {
        self.component_types
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Captured entity/component state, grouped by archetype.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    pub archetypes: Vec<Archetype>,
}

impl WorldState {
    pub fn entity_count(&self) -> usize {
        self.archetypes.iter().map(|a| a.entities.len()).sum()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.archetypes.iter().flat_map(|a| a.entities.iter())
    }

    /// Canonical form: archetypes by concatenated type names, entities by local id.
    pub fn canonicalize(&mut self) {
        self.archetypes.sort_by_cached_key(Archetype::sort_key);
        for archetype in &mut self.archetypes {
            archetype.entities.sort_by_key(|e| e.local_id);
        }
    }
}

/// Player progression carried alongside the world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProgress {
    pub play_time_secs: u64,
    pub chapter: u32,
    pub counters: BTreeMap<String, i64>,
    pub flags: BTreeSet<String>,
}

/// Versioned, opaque data owned by one mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModBlock {
    pub version: u32,
    pub bytes: Vec<u8>,
}

/// Caller-supplied description of a save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub description: String,
    /// Overrides the configured game version when set.
    pub game_version: Option<String>,
}

impl SaveMetadata {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            game_version: None,
        }
    }
}

/// Immutable captured representation of world, progress, and mod data.
///
/// The checksum is a SHA-256 over the canonical CBOR encoding of every other
/// field and is fixed at construction. Operations that "change" a snapshot,
/// like migration, build a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: Uuid,
    game_version: String,
    format_version: FormatVersion,
    created_at: DateTime<Utc>,
    world: WorldState,
    progress: PlayerProgress,
    mod_data: BTreeMap<ModId, ModBlock>,
    checksum: [u8; 32],
}

/// Borrowed view of the checksummed fields, in canonical order.
#[derive(Serialize)]
struct CanonicalBody<'a> {
    id: &'a Uuid,
    game_version: &'a str,
    format_version: FormatVersion,
    created_at_ms: i64,
    world: &'a WorldState,
    progress: &'a PlayerProgress,
    mod_data: &'a BTreeMap<ModId, ModBlock>,
}

impl Snapshot {
    /// Build a snapshot, canonicalizing the world and computing the checksum.
    ///
    /// `created_at` is truncated to millisecond precision, the resolution of
    /// the file header timestamp.
    pub fn new(
        id: Uuid,
        game_version: impl Into<String>,
        format_version: FormatVersion,
        created_at: DateTime<Utc>,
        mut world: WorldState,
        progress: PlayerProgress,
        mod_data: BTreeMap<ModId, ModBlock>,
    ) -> Self {
        world.canonicalize();
        let created_at =
            DateTime::from_timestamp_millis(created_at.timestamp_millis()).unwrap_or(created_at);
        let mut snapshot = Self {
            id,
            game_version: game_version.into(),
            format_version,
            created_at,
            world,
            progress,
            mod_data,
            checksum: [0; 32],
        };
        snapshot.checksum = snapshot.compute_checksum();
        snapshot
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn game_version(&self) -> &str {
        &self.game_version
    }

    pub fn format_version(&self) -> FormatVersion {
        self.format_version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn progress(&self) -> &PlayerProgress {
        &self.progress
    }

    pub fn mod_data(&self) -> &BTreeMap<ModId, ModBlock> {
        &self.mod_data
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    pub fn entity_count(&self) -> usize {
        self.world.entity_count()
    }

    /// Recompute the checksum and compare with the stored one.
    pub fn verify(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// A new snapshot with the world replaced and the format version bumped.
    pub fn with_world(&self, world: WorldState, format_version: FormatVersion) -> Self {
        Self::new(
            self.id,
            self.game_version.clone(),
            format_version,
            self.created_at,
            world,
            self.progress.clone(),
            self.mod_data.clone(),
        )
    }

    /// Take the world out of the snapshot, consuming it.
    pub fn into_parts(self) -> (WorldState, PlayerProgress, BTreeMap<ModId, ModBlock>) {
        (self.world, self.progress, self.mod_data)
    }

    fn compute_checksum(&self) -> [u8; 32] {
        let body = CanonicalBody {
            id: &self.id,
            game_version: &self.game_version,
            format_version: self.format_version,
            created_at_ms: self.created_at.timestamp_millis(),
            world: &self.world,
            progress: &self.progress,
            mod_data: &self.mod_data,
        };
        let mut buf = Vec::new();
        // Writing plain data into a Vec does not fail.
        if let Err(e) = ciborium::into_writer(&body, &mut buf) {
            tracing::error!(error = %e, "canonical snapshot encoding failed");
        }
        integrity::checksum(&buf)
    }
}
