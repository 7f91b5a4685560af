use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use worldsave_common::EntityId;

use crate::access::{ArchetypeInfo, Component, ComponentValue, WorldAccess};

/// Per-entity data stored in the world.
struct EntityData {
    /// Spawn sequence number; archetype enumeration follows spawn order.
    seq: u64,
    components: BTreeMap<String, ComponentValue>,
}

/// Reference in-memory entity/component world.
///
/// Components are stored type-erased and keyed by their type name. Uses
/// BTreeMap throughout so enumeration is deterministic; entities inside an
/// archetype are listed in spawn order.
#[derive(Default)]
pub struct World {
    entities: BTreeMap<EntityId, EntityData>,
    next_seq: u64,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities in the world.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Whether the entity exists.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Spawn an entity without components. Returns its id.
    pub fn spawn(&mut self) -> EntityId {
        self.spawn_erased(Vec::new())
    }

    /// Attach a typed component, replacing any previous value of the same type.
    ///
    /// Returns false if the entity does not exist.
    pub fn insert<T: Component>(&mut self, id: EntityId, component: T) -> bool {
        self.insert_erased(id, T::TYPE_NAME.to_string(), Box::new(component))
    }

    /// Attach a type-erased component under an explicit type name.
    pub fn insert_erased(&mut self, id: EntityId, type_name: String, value: ComponentValue) -> bool {
        let Some(data) = self.entities.get_mut(&id) else {
            return false;
        };
        data.components.insert(type_name, value);
        true
    }

    /// Remove a typed component. Returns it if it was present.
    pub fn remove<T: Component>(&mut self, id: EntityId) -> Option<T> {
        let data = self.entities.get_mut(&id)?;
        let boxed = data.components.remove(T::TYPE_NAME)?;
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    /// Get a typed component of an entity.
    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        self.entities
            .get(&id)?
            .components
            .get(T::TYPE_NAME)?
            .downcast_ref::<T>()
    }

    /// Get a typed component of an entity mutably.
    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        self.entities
            .get_mut(&id)?
            .components
            .get_mut(T::TYPE_NAME)?
            .downcast_mut::<T>()
    }

    /// Component type names attached to an entity, in sorted order.
    pub fn component_types(&self, id: EntityId) -> Option<Vec<&str>> {
        self.entities
            .get(&id)
            .map(|d| d.components.keys().map(String::as_str).collect())
    }

    /// Remove an entity. Returns true if it existed.
    pub fn despawn(&mut self, id: EntityId) -> bool {
        self.entities.remove(&id).is_some()
    }

    /// All entity ids in spawn order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<(u64, EntityId)> = self
            .entities
            .iter()
            .map(|(id, data)| (data.seq, *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn spawn_erased(&mut self, components: Vec<(String, ComponentValue)>) -> EntityId {
        let id = EntityId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entities.insert(
            id,
            EntityData {
                seq,
                components: components.into_iter().collect(),
            },
        );
        id
    }
}

impl WorldAccess for World {
    fn archetypes(&self) -> Vec<ArchetypeInfo> {
        let mut groups: BTreeMap<BTreeSet<String>, Vec<(u64, EntityId)>> = BTreeMap::new();
        for (id, data) in &self.entities {
            let key: BTreeSet<String> = data.components.keys().cloned().collect();
            groups.entry(key).or_default().push((data.seq, *id));
        }
        groups
            .into_iter()
            .map(|(component_types, mut members)| {
                members.sort_unstable();
                ArchetypeInfo {
                    component_types,
                    entities: members.into_iter().map(|(_, id)| id).collect(),
                }
            })
            .collect()
    }

    fn component(&self, entity: EntityId, type_name: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.entities
            .get(&entity)?
            .components
            .get(type_name)
            .map(|b| b.as_ref())
    }

    fn component_mut(
        &mut self,
        entity: EntityId,
        type_name: &str,
    ) -> Option<&mut (dyn Any + Send + Sync)> {
        self.entities
            .get_mut(&entity)?
            .components
            .get_mut(type_name)
            .map(|b| b.as_mut())
    }

    fn create_entity(&mut self, components: Vec<(String, ComponentValue)>) -> EntityId {
        self.spawn_erased(components)
    }

    fn clear(&mut self) {
        let removed = self.entities.len();
        self.entities.clear();
        self.next_seq = 0;
        tracing::debug!(removed, "world cleared");
    }

    fn entity_count(&self) -> usize {
        self.entities.len()
    }
}
