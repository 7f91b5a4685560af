//! World kernel: the interface the persistence core uses to reach a live
//! entity/component world, plus a reference in-memory implementation.
//!
//! # Invariants
//! - Archetype enumeration order is deterministic.
//! - Clearing a [`World`] restarts spawn order, so a restored world lists
//!   entities in the order they were created.

pub mod access;
pub mod world;

pub use access::{ArchetypeInfo, Component, ComponentValue, WorldAccess};
pub use world::World;
