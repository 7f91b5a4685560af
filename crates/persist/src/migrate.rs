//! Format migration over a graph of registered steps.
//!
//! Steps are edges `from -> to`. Migrating walks the shortest path from the
//! snapshot's format to the current one, applying each transform in order.
//! A failing or panicking step aborts the whole migration; the input snapshot
//! is never modified.

use ciborium::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use worldsave_common::FormatVersion;

use crate::error::MigrationError;
use crate::snapshot::{Archetype, EntityRecord, Snapshot, WorldState};

pub type MigrationFn = Arc<dyn Fn(WorldState) -> Result<WorldState, String> + Send + Sync>;

/// One edge of the migration graph.
#[derive(Clone)]
pub struct MigrationStep {
    pub from: FormatVersion,
    pub to: FormatVersion,
    pub name: String,
    transform: MigrationFn,
}

impl MigrationStep {
    pub fn new(
        from: FormatVersion,
        to: FormatVersion,
        name: impl Into<String>,
        transform: impl Fn(WorldState) -> Result<WorldState, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            from,
            to,
            name: name.into(),
            transform: Arc::new(transform),
        }
    }

    fn apply(&self, world: WorldState) -> Result<WorldState, String> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.transform)(world))) {
            Ok(result) => result,
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MigrationStep({} {} -> {})", self.name, self.from, self.to)
    }
}

/// A migrated snapshot and the names of the steps that produced it.
#[derive(Debug)]
pub struct Migrated {
    pub snapshot: Snapshot,
    pub applied: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VersionMigrator {
    current: FormatVersion,
    steps: Vec<MigrationStep>,
}

impl Default for VersionMigrator {
    fn default() -> Self {
        Self::new(FormatVersion::CURRENT)
    }
}

impl VersionMigrator {
    pub fn new(current: FormatVersion) -> Self {
        Self {
            current,
            steps: Vec::new(),
        }
    }

    pub fn current(&self) -> FormatVersion {
        self.current
    }

    /// Add a step. Two steps may not share the same `(from, to)` pair.
    pub fn register(&mut self, step: MigrationStep) -> Result<&mut Self, MigrationError> {
        if self
            .steps
            .iter()
            .any(|s| s.from == step.from && s.to == step.to)
        {
            return Err(MigrationError::DuplicateStep {
                from: step.from,
                to: step.to,
            });
        }
        tracing::debug!(step = %step.name, from = %step.from, to = %step.to, "migration step registered");
        self.steps.push(step);
        Ok(self)
    }

    pub fn needs_migration(&self, version: FormatVersion) -> bool {
        version != self.current
    }

    /// Shortest sequence of steps from `from` to the current version.
    pub fn plan(&self, from: FormatVersion) -> Result<Vec<&MigrationStep>, MigrationError> {
        if from > self.current {
            return Err(MigrationError::FromFuture {
                found: from,
                current: self.current,
            });
        }
        if from == self.current {
            return Ok(Vec::new());
        }

        let mut edges: BTreeMap<FormatVersion, Vec<usize>> = BTreeMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            edges.entry(step.from).or_default().push(i);
        }
        for out in edges.values_mut() {
            out.sort_by_key(|i| self.steps[*i].to);
        }

        // BFS, remembering the edge that first reached each version.
        let mut reached_by: HashMap<FormatVersion, usize> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(version) = queue.pop_front() {
            if version == self.current {
                break;
            }
            for &i in edges.get(&version).into_iter().flatten() {
                let to = self.steps[i].to;
                if to != from && !reached_by.contains_key(&to) {
                    reached_by.insert(to, i);
                    queue.push_back(to);
                }
            }
        }

        let mut path = Vec::new();
        let mut at = self.current;
        while at != from {
            let Some(&i) = reached_by.get(&at) else {
                return Err(MigrationError::NoPath {
                    from,
                    to: self.current,
                });
            };
            path.push(&self.steps[i]);
            at = self.steps[i].from;
        }
        path.reverse();
        Ok(path)
    }

    /// Run every step on the path from the snapshot's version to current.
    pub fn migrate(&self, snapshot: &Snapshot) -> Result<Migrated, MigrationError> {
        let path = self.plan(snapshot.format_version())?;
        let mut world = snapshot.world().clone();
        let mut version = snapshot.format_version();
        let mut applied = Vec::with_capacity(path.len());

        for step in path {
            let _span = tracing::info_span!("migration_step", step = %step.name).entered();
            world = step.apply(world).map_err(|reason| {
                tracing::error!(from = %step.from, to = %step.to, %reason, "migration step failed");
                MigrationError::StepFailed {
                    step: step.name.clone(),
                    from: step.from,
                    to: step.to,
                    reason,
                }
            })?;
            version = step.to;
            tracing::info!(from = %step.from, to = %step.to, "migration step applied");
            applied.push(step.name.clone());
        }

        Ok(Migrated {
            snapshot: snapshot.with_world(world, version),
            applied,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Rewrite every stored component of `type_name` as a CBOR value.
///
/// Intended for use inside migration steps. Fails if a component of that
/// type is not valid CBOR.
pub fn update_components(
    world: &mut WorldState,
    type_name: &str,
    mut f: impl FnMut(&mut Value) -> Result<(), String>,
) -> Result<usize, String> {
    let mut updated = 0;
    for archetype in &mut world.archetypes {
        for entity in &mut archetype.entities {
            let Some(bytes) = entity.components.get_mut(type_name) else {
                continue;
            };
            let mut value: Value = ciborium::from_reader(bytes.as_slice())
                .map_err(|e| format!("{type_name} on {}: {e}", entity.local_id))?;
            f(&mut value)?;
            let mut out = Vec::new();
            ciborium::into_writer(&value, &mut out).map_err(|e| e.to_string())?;
            *bytes = out;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Set a map field on every component of `type_name`, overwriting any value.
pub fn set_field(
    world: &mut WorldState,
    type_name: &str,
    field: &str,
    value: Value,
) -> Result<usize, String> {
    update_components(world, type_name, |component| {
        let Value::Map(entries) = component else {
            return Err(format!("{type_name} is not a map"));
        };
        match entries
            .iter_mut()
            .find(|(k, _)| k.as_text() == Some(field))
        {
            Some((_, v)) => *v = value.clone(),
            None => entries.push((Value::Text(field.to_string()), value.clone())),
        }
        Ok(())
    })
}

/// Rename a component type everywhere it appears, regrouping entities
/// whose archetypes now coincide. Returns the number of components moved.
///
/// Fails without modifying `world` if an entity already holds `to`.
pub fn rename_component_type(
    world: &mut WorldState,
    from: &str,
    to: &str,
) -> Result<usize, String> {
    if from == to {
        return Ok(0);
    }
    if let Some(entity) = world
        .entities()
        .find(|e| e.components.contains_key(from) && e.components.contains_key(to))
    {
        return Err(format!(
            "cannot rename {from} to {to}: entity {} already has {to}",
            entity.local_id
        ));
    }
    let mut renamed = 0;
    let mut grouped: BTreeMap<BTreeSet<String>, Vec<EntityRecord>> = BTreeMap::new();
    for archetype in std::mem::take(&mut world.archetypes) {
        let mut types = archetype.component_types;
        if types.remove(from) {
            types.insert(to.to_string());
        }
        let entities = grouped.entry(types).or_default();
        for mut entity in archetype.entities {
            if let Some(bytes) = entity.components.remove(from) {
                entity.components.insert(to.to_string(), bytes);
                renamed += 1;
            }
            entities.push(entity);
        }
    }
    world.archetypes = grouped
        .into_iter()
        .map(|(component_types, entities)| Archetype {
            component_types,
            entities,
        })
        .collect();
    world.canonicalize();
    Ok(renamed)
}
