//! Built-in gameplay components and the codecs that persist them.
//!
//! # Invariants
//! - Every type here has a stable [`Component::TYPE_NAME`]; renaming one
//!   needs a migration step.
//! - [`register_builtin`] registers each type exactly once.
//! - Components holding entity handles implement [`MapEntities`].

use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldsave_common::{EntityId, FormatVersion, Transform};
use worldsave_kernel::Component;
use worldsave_persist::migrate::{self, MigrationStep, VersionMigrator};
use worldsave_persist::registry::{EntityMapper, MapEntities, RegistryBuilder};
use worldsave_persist::{CodecError, ComponentRegistry, MigrationError};

/// Human-readable name. Stored as raw UTF-8 rather than CBOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name(pub String);

impl Component for Name {
    const TYPE_NAME: &'static str = "Name";
}

/// World-space placement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Placement(pub Transform);

impl Component for Placement {
    const TYPE_NAME: &'static str = "Placement";
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity(pub Vec3);

impl Component for Velocity {
    const TYPE_NAME: &'static str = "Velocity";
}

/// Hit points. `max` was added in format 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub current: i32,
    pub max: i32,
}

impl Health {
    /// Value given to `max` for saves written before it existed.
    pub const LEGACY_MAX: i32 = 70;

    pub fn full(max: i32) -> Self {
        Self { current: max, max }
    }

    pub fn is_dead(&self) -> bool {
        self.current <= 0
    }
}

impl Component for Health {
    const TYPE_NAME: &'static str = "Health";
}

/// Entity that owns this one, e.g. a summoner or a chest's holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner(pub EntityId);

impl Component for Owner {
    const TYPE_NAME: &'static str = "Owner";
}

impl MapEntities for Owner {
    fn map_entities(&mut self, map: &mut EntityMapper<'_>) {
        self.0 = map(self.0);
    }
}

/// Item stacks by item id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub items: BTreeMap<String, u32>,
}

impl Inventory {
    pub fn add(&mut self, item: impl Into<String>, count: u32) {
        *self.items.entry(item.into()).or_default() += count;
    }
}

impl Component for Inventory {
    const TYPE_NAME: &'static str = "Inventory";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub mass: f32,
    pub is_kinematic: bool,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self {
            mass: 1.0,
            is_kinematic: false,
        }
    }
}

impl Component for RigidBody {
    const TYPE_NAME: &'static str = "RigidBody";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Collider {
    Box { half_extents: [f32; 3] },
    Sphere { radius: f32 },
}

impl Default for Collider {
    fn default() -> Self {
        Self::Box {
            half_extents: [0.5, 0.5, 0.5],
        }
    }
}

impl Component for Collider {
    const TYPE_NAME: &'static str = "Collider";
}

/// Register codecs for every built-in component.
pub fn register_builtin(builder: &mut RegistryBuilder) -> Result<(), CodecError> {
    builder
        .register_fn::<Name>(Name::TYPE_NAME, encode_name, decode_name)?
        .register::<Placement>()?
        .register::<Velocity>()?
        .register::<Health>()?
        .register_mapped::<Owner>()?
        .register::<Inventory>()?
        .register::<RigidBody>()?
        .register::<Collider>()?;
    tracing::debug!("built-in component codecs registered");
    Ok(())
}

/// A registry holding only the built-in components.
pub fn builtin_registry() -> Result<ComponentRegistry, CodecError> {
    let mut builder = ComponentRegistry::builder();
    register_builtin(&mut builder)?;
    Ok(builder.build())
}

/// Register the format migrations for built-in components.
pub fn register_migrations(migrator: &mut VersionMigrator) -> Result<(), MigrationError> {
    migrator.register(MigrationStep::new(
        FormatVersion::new(0, 9),
        FormatVersion::new(1, 0),
        "health_max",
        |mut world| {
            migrate::set_field(
                &mut world,
                Health::TYPE_NAME,
                "max",
                ciborium::Value::Integer(Health::LEGACY_MAX.into()),
            )?;
            Ok(world)
        },
    ))?;
    Ok(())
}

/// A migrator at the current format with the built-in steps registered.
pub fn builtin_migrator() -> Result<VersionMigrator, MigrationError> {
    let mut migrator = VersionMigrator::new(FormatVersion::CURRENT);
    register_migrations(&mut migrator)?;
    Ok(migrator)
}

fn encode_name(name: &Name) -> Result<Vec<u8>, String> {
    Ok(name.0.as_bytes().to_vec())
}

fn decode_name(bytes: &[u8]) -> Result<Name, String> {
    String::from_utf8(bytes.to_vec())
        .map(Name)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;
    use worldsave_common::LocalId;
    use worldsave_kernel::World;
    use worldsave_persist::{
        Archetype, EntityRecord, PersistConfig, PlayerProgress, SaveOrchestrator, SaveRequest,
        Snapshot, WorldState, codec,
    };

    fn sample_world() -> World {
        let mut w = World::new();
        let hero = w.spawn();
        w.insert(hero, Name("Ayla".into()));
        w.insert(hero, Health::full(120));
        w.insert(
            hero,
            Placement(Transform {
                position: Vec3::new(4.0, 0.0, -2.0),
                ..Transform::default()
            }),
        );
        let mut bag = Inventory::default();
        bag.add("potion", 3);
        bag.add("potion", 1);
        w.insert(hero, bag);

        let familiar = w.spawn();
        w.insert(familiar, Name("Moss".into()));
        w.insert(familiar, Owner(hero));
        w.insert(familiar, Velocity(Vec3::X));
        w.insert(familiar, RigidBody::default());
        w.insert(familiar, Collider::Sphere { radius: 0.25 });
        w
    }

    fn find_named(w: &World, name: &str) -> EntityId {
        w.entity_ids()
            .into_iter()
            .find(|id| w.get::<Name>(*id).is_some_and(|n| n.0 == name))
            .unwrap()
    }

    #[test]
    fn all_builtins_registered_once() {
        let reg = builtin_registry().unwrap();
        assert_eq!(reg.len(), 8);
        assert!(reg.has_references(Owner::TYPE_NAME));

        let mut builder = ComponentRegistry::builder();
        register_builtin(&mut builder).unwrap();
        assert!(register_builtin(&mut builder).is_err());
    }

    #[test]
    fn name_uses_raw_utf8() {
        let reg = builtin_registry().unwrap();
        let bytes = reg.encode(Name::TYPE_NAME, &Name("Ayla".into())).unwrap();
        assert_eq!(bytes, b"Ayla");
        assert!(reg.decode(Name::TYPE_NAME, &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn capture_restore_keeps_ownership() {
        let reg = builtin_registry().unwrap();
        let source = sample_world();
        let captured = codec::capture(&source, &reg);
        assert!(captured.warnings.is_empty());
        assert!(captured.errors.is_empty());

        let mut target = World::new();
        codec::restore(&captured.world, &reg, &mut target).unwrap();
        let hero = find_named(&target, "Ayla");
        let familiar = find_named(&target, "Moss");
        assert_eq!(target.get::<Owner>(familiar), Some(&Owner(hero)));
        assert_eq!(target.get::<Health>(hero), Some(&Health::full(120)));
        assert_eq!(target.get::<Inventory>(hero).unwrap().items["potion"], 4);
        assert_eq!(
            target.get::<Collider>(familiar),
            Some(&Collider::Sphere { radius: 0.25 })
        );
    }

    #[test]
    fn legacy_health_gets_default_max() {
        #[derive(Serialize)]
        struct LegacyHealth {
            current: i32,
        }
        let mut bytes = Vec::new();
        ciborium::into_writer(&LegacyHealth { current: 12 }, &mut bytes).unwrap();

        let mut record = EntityRecord::new(LocalId(0));
        record.components.insert(Health::TYPE_NAME.into(), bytes);
        let world = WorldState {
            archetypes: vec![Archetype {
                component_types: [Health::TYPE_NAME.to_string()].into_iter().collect(),
                entities: vec![record],
            }],
        };
        let old = Snapshot::new(
            Uuid::new_v4(),
            "0.9.2",
            FormatVersion::new(0, 9),
            Utc::now(),
            world,
            PlayerProgress::default(),
            BTreeMap::new(),
        );

        let migrated = builtin_migrator().unwrap().migrate(&old).unwrap();
        assert_eq!(migrated.snapshot.format_version(), FormatVersion::CURRENT);
        let reg = builtin_registry().unwrap();
        let bytes = &migrated.snapshot.world().archetypes[0].entities[0].components[Health::TYPE_NAME];
        let value = reg.decode(Health::TYPE_NAME, bytes).unwrap().into_value();
        assert_eq!(
            value.downcast_ref::<Health>(),
            Some(&Health {
                current: 12,
                max: Health::LEGACY_MAX
            })
        );
    }

    #[tokio::test]
    async fn full_save_load_through_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let orch = SaveOrchestrator::new(
            PersistConfig::in_dir(dir.path()),
            Arc::new(builtin_registry().unwrap()),
        )
        .with_migrator(Arc::new(builtin_migrator().unwrap()));

        let world = sample_world();
        let saved = orch
            .save_game("camp", SaveRequest::new(&world).description("At camp"))
            .await;
        assert!(saved.success, "{:?}", saved.error);

        let mut target = World::new();
        let loaded = orch.load_game("camp", &mut target).await;
        assert!(loaded.success, "{:?}", loaded.error);
        assert_eq!(target.entity_count(), 2);
        let hero = find_named(&target, "Ayla");
        assert_eq!(
            target.get::<Placement>(hero).unwrap().0.position,
            Vec3::new(4.0, 0.0, -2.0)
        );
    }
}
