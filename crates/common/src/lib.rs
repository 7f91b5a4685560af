//! Shared types for the worldsave workspace.
//!
//! Live entity handles ([`EntityId`]) never appear in a save file. Snapshots
//! refer to entities by [`LocalId`], an index scoped to a single snapshot.

mod types;

pub use types::{EntityId, FormatVersion, LocalId, ModId, ParseVersionError, Transform};
