use std::any::Any;
use std::collections::BTreeSet;
use worldsave_common::EntityId;

/// A type-erased component value as held by a world.
pub type ComponentValue = Box<dyn Any + Send + Sync>;

/// A component type with a stable name.
///
/// The name is what appears in save files, so renaming a type is a format
/// change and needs a migration step.
pub trait Component: Any + Send + Sync {
    const TYPE_NAME: &'static str;
}

/// One group of entities sharing an identical set of component types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchetypeInfo {
    pub component_types: BTreeSet<String>,
    pub entities: Vec<EntityId>,
}

/// The operations the persistence core needs from a live world.
///
/// Implementations must not mutate structure while a capture pass is
/// enumerating them; the caller is responsible for quiescence.
pub trait WorldAccess {
    /// Enumerate all archetypes with their entities.
    fn archetypes(&self) -> Vec<ArchetypeInfo>;

    /// Borrow a component of an entity by type name.
    fn component(&self, entity: EntityId, type_name: &str) -> Option<&(dyn Any + Send + Sync)>;

    /// Mutably borrow a component of an entity by type name.
    fn component_mut(
        &mut self,
        entity: EntityId,
        type_name: &str,
    ) -> Option<&mut (dyn Any + Send + Sync)>;

    /// Create an entity with the given components and return its fresh handle.
    fn create_entity(&mut self, components: Vec<(String, ComponentValue)>) -> EntityId;

    /// Remove every entity.
    fn clear(&mut self);

    fn entity_count(&self) -> usize;
}
