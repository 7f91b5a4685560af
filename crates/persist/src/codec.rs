//! World codec: capture a live world into a [`WorldState`], encode it (and
//! the rest of a snapshot) into payload bytes, and the reverse.
//!
//! # Invariants
//! - Encoding is canonical: archetypes ordered by concatenated type names,
//!   entities by local id. The same logical state always yields the same bytes.
//! - A declared entity count that disagrees with the records present is a
//!   [`CodecError::StructuralMismatch`], never silently truncated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use uuid::Uuid;
use worldsave_common::{EntityId, FormatVersion, LocalId, ModId};
use worldsave_kernel::{ComponentValue, WorldAccess};

use crate::error::{CodecError, IntegrityIssue};
use crate::registry::ComponentRegistry;
use crate::snapshot::{Archetype, EntityRecord, ModBlock, PlayerProgress, Snapshot, WorldState};

/// Local id recorded for a reference whose target is not in the world.
pub const DANGLING: LocalId = LocalId(u32::MAX);

/// Placeholder handle standing for a local id inside encoded components.
///
/// Real handles are v4 UUIDs, whose version bits are never all zero, so
/// placeholders cannot collide with them.
pub fn placeholder(local: LocalId) -> EntityId {
    EntityId(Uuid::from_u128(u128::from(local.0)))
}

/// Inverse of [`placeholder`].
pub fn local_of(id: EntityId) -> Option<LocalId> {
    u32::try_from(id.0.as_u128()).ok().map(LocalId)
}

/// Result of capturing a world.
#[derive(Debug, Default)]
pub struct Capture {
    pub world: WorldState,
    /// Components skipped because their type is not registered.
    pub warnings: Vec<String>,
    /// Registered components that failed to encode.
    pub errors: Vec<IntegrityIssue>,
}

/// Capture a world in a single synchronous enumeration pass.
///
/// Local ids are assigned densely in enumeration order. Unregistered
/// component types are skipped with a warning; the entity keeps its other
/// components and moves to the archetype matching what was captured.
pub fn capture<W: WorldAccess + ?Sized>(world: &W, registry: &ComponentRegistry) -> Capture {
    let _span = tracing::debug_span!("capture").entered();
    let archetypes = world.archetypes();

    let mut locals: HashMap<EntityId, LocalId> = HashMap::new();
    let mut next = 0u32;
    for archetype in &archetypes {
        for id in &archetype.entities {
            locals.insert(*id, LocalId(next));
            next += 1;
        }
    }

    let mut out = Capture::default();
    let mut skipped: BTreeMap<String, usize> = BTreeMap::new();
    let mut grouped: BTreeMap<BTreeSet<String>, Vec<EntityRecord>> = BTreeMap::new();

    for archetype in &archetypes {
        for id in &archetype.entities {
            let mut record = EntityRecord::new(locals[id]);
            for type_name in &archetype.component_types {
                let Some(value) = world.component(*id, type_name) else {
                    continue;
                };
                let is_tombstone = value.is::<crate::registry::Tombstone>();
                if !is_tombstone && !registry.contains(type_name) {
                    *skipped.entry(type_name.clone()).or_default() += 1;
                    continue;
                }
                let mut refs = Vec::new();
                let encoded = registry.encode_mapped(type_name, value, &mut |target| {
                    let local = locals.get(&target).copied().unwrap_or(DANGLING);
                    refs.push(local);
                    placeholder(local)
                });
                match encoded {
                    Ok(bytes) => {
                        record.components.insert(type_name.clone(), bytes);
                        record.references.extend(refs);
                    }
                    Err(e) => out.errors.push(IntegrityIssue::CaptureFailed {
                        type_name: type_name.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            let key: BTreeSet<String> = record.components.keys().cloned().collect();
            grouped.entry(key).or_default().push(record);
        }
    }

    for (type_name, count) in skipped {
        tracing::warn!(%type_name, count, "skipping unregistered component type");
        out.warnings.push(format!(
            "component type {type_name} is not registered; skipped on {count} entities"
        ));
    }

    out.world = WorldState {
        archetypes: grouped
            .into_iter()
            .map(|(component_types, entities)| Archetype {
                component_types,
                entities,
            })
            .collect(),
    };
    out.world.canonicalize();
    tracing::debug!(
        entities = out.world.entity_count(),
        archetypes = out.world.archetypes.len(),
        "world captured"
    );
    out
}

/// Summary of a restore.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub entities: usize,
    pub archetypes: usize,
    /// Components kept as tombstones because their type is unknown.
    pub tombstones: usize,
    pub warnings: Vec<String>,
}

/// Decode every component, then clear `world` and instantiate the snapshot.
///
/// All decoding happens before the world is touched, so a decode failure
/// leaves the target world unchanged. References are resolved in a second
/// pass once every entity has its fresh handle.
pub fn restore<W: WorldAccess + ?Sized>(
    state: &WorldState,
    registry: &ComponentRegistry,
    world: &mut W,
) -> Result<RestoreReport, CodecError> {
    let _span = tracing::debug_span!("restore").entered();
    let mut report = RestoreReport {
        archetypes: state.archetypes.len(),
        ..Default::default()
    };

    let mut prepared: Vec<(LocalId, Vec<(String, ComponentValue)>)> =
        Vec::with_capacity(state.entity_count());
    let mut unknown: BTreeSet<String> = BTreeSet::new();
    for entity in state.entities() {
        let mut components = Vec::with_capacity(entity.components.len());
        for (type_name, bytes) in &entity.components {
            let decoded = registry.decode(type_name, bytes)?;
            if decoded.is_tombstone() {
                report.tombstones += 1;
                unknown.insert(type_name.clone());
            }
            components.push((type_name.clone(), decoded.into_value()));
        }
        prepared.push((entity.local_id, components));
    }
    for type_name in unknown {
        report
            .warnings
            .push(format!("component type {type_name} is unknown; kept as tombstone"));
    }

    world.clear();
    let mut handles: HashMap<LocalId, EntityId> = HashMap::with_capacity(prepared.len());
    let mut with_refs: Vec<(EntityId, Vec<String>)> = Vec::new();
    for (local, components) in prepared {
        let ref_types: Vec<String> = components
            .iter()
            .filter(|(name, _)| registry.has_references(name))
            .map(|(name, _)| name.clone())
            .collect();
        let handle = world.create_entity(components);
        handles.insert(local, handle);
        if !ref_types.is_empty() {
            with_refs.push((handle, ref_types));
        }
    }

    let mut unresolved = 0usize;
    for (handle, ref_types) in with_refs {
        for type_name in ref_types {
            if let Some(value) = world.component_mut(handle, &type_name) {
                registry.remap(&type_name, value, &mut |placeholder_id| {
                    match local_of(placeholder_id).and_then(|l| handles.get(&l)) {
                        Some(fresh) => *fresh,
                        None => {
                            unresolved += 1;
                            placeholder_id
                        }
                    }
                });
            }
        }
    }
    if unresolved > 0 {
        report
            .warnings
            .push(format!("{unresolved} entity references could not be resolved"));
    }

    report.entities = handles.len();
    tracing::debug!(entities = report.entities, tombstones = report.tombstones, "world restored");
    Ok(report)
}

#[derive(Serialize, Deserialize)]
struct WireEntity {
    local_id: u32,
    components: BTreeMap<String, Vec<u8>>,
    references: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct WireArchetype {
    component_types: Vec<String>,
    entity_count: u32,
    entities: Vec<WireEntity>,
}

#[derive(Serialize, Deserialize)]
struct WirePayload {
    snapshot_id: Uuid,
    game_version: String,
    format_version: FormatVersion,
    created_at_ms: i64,
    progress: PlayerProgress,
    world: Vec<WireArchetype>,
    mods: BTreeMap<ModId, ModBlock>,
}

/// Encode a world state as canonical CBOR.
pub fn encode_world(state: &WorldState) -> Result<Vec<u8>, CodecError> {
    cbor_serialize(&to_wire(state))
}

/// Decode a world state produced by [`encode_world`].
pub fn decode_world(bytes: &[u8]) -> Result<WorldState, CodecError> {
    let wire: Vec<WireArchetype> = cbor_deserialize(bytes)?;
    from_wire(wire)
}

/// Encode a whole snapshot into the compressed payload stored in a save file.
pub fn encode_payload(snapshot: &Snapshot, compression_level: i32) -> Result<Vec<u8>, CodecError> {
    let payload = WirePayload {
        snapshot_id: snapshot.id(),
        game_version: snapshot.game_version().to_string(),
        format_version: snapshot.format_version(),
        created_at_ms: snapshot.created_at().timestamp_millis(),
        progress: snapshot.progress().clone(),
        world: to_wire(snapshot.world()),
        mods: snapshot.mod_data().clone(),
    };
    let cbor = cbor_serialize(&payload)?;
    zstd_compress(&cbor, compression_level)
}

/// Decode a payload produced by [`encode_payload`] into a snapshot.
pub fn decode_payload(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    let cbor = zstd_decompress(bytes)?;
    let payload: WirePayload = cbor_deserialize(&cbor)?;
    let created_at = chrono::DateTime::from_timestamp_millis(payload.created_at_ms)
        .ok_or_else(|| CodecError::StructuralMismatch("timestamp out of range".into()))?;
    let world = from_wire(payload.world)?;
    Ok(Snapshot::new(
        payload.snapshot_id,
        payload.game_version,
        payload.format_version,
        created_at,
        world,
        payload.progress,
        payload.mods,
    ))
}

fn to_wire(state: &WorldState) -> Vec<WireArchetype> {
    let mut archetypes: Vec<&Archetype> = state.archetypes.iter().collect();
    archetypes.sort_by_cached_key(|a| a.sort_key());
    archetypes
        .into_iter()
        .map(|archetype| {
            let mut entities: Vec<&EntityRecord> = archetype.entities.iter().collect();
            entities.sort_by_key(|e| e.local_id);
            WireArchetype {
                component_types: archetype.component_types.iter().cloned().collect(),
                entity_count: entities.len() as u32,
                entities: entities
                    .into_iter()
                    .map(|e| WireEntity {
                        local_id: e.local_id.0,
                        components: e.components.clone(),
                        references: e.references.iter().map(|r| r.0).collect(),
                    })
                    .collect(),
            }
        })
        .collect()
}

fn from_wire(wire: Vec<WireArchetype>) -> Result<WorldState, CodecError> {
    let mut seen: BTreeSet<u32> = BTreeSet::new();
    let mut archetypes = Vec::with_capacity(wire.len());
    for archetype in wire {
        if archetype.entity_count as usize != archetype.entities.len() {
            return Err(CodecError::StructuralMismatch(format!(
                "archetype [{}] declares {} entities but holds {}",
                archetype.component_types.join(","),
                archetype.entity_count,
                archetype.entities.len()
            )));
        }
        let component_types: BTreeSet<String> = archetype.component_types.into_iter().collect();
        let mut entities = Vec::with_capacity(archetype.entities.len());
        for entity in archetype.entities {
            if !seen.insert(entity.local_id) {
                return Err(CodecError::StructuralMismatch(format!(
                    "local id {} appears twice",
                    entity.local_id
                )));
            }
            if !entity.components.keys().eq(component_types.iter()) {
                return Err(CodecError::StructuralMismatch(format!(
                    "entity {} does not match its archetype",
                    entity.local_id
                )));
            }
            entities.push(EntityRecord {
                local_id: LocalId(entity.local_id),
                components: entity.components,
                references: entity.references.into_iter().map(LocalId).collect(),
            });
        }
        archetypes.push(Archetype {
            component_types,
            entities,
        });
    }
    Ok(WorldState { archetypes })
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(data).map_err(|e| CodecError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}
