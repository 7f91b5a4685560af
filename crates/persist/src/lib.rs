//! Persistence core: capture a live world into an immutable snapshot, write
//! it as a versioned, checksummed save file, and load it back with format
//! migration and mod-data compatibility checks.
//!
//! # Invariants
//! - Snapshots are immutable and carry a SHA-256 over their canonical encoding.
//! - Encoding the same logical state twice yields identical bytes.
//! - Decode never runs on a file whose checksum failed.
//! - A save either commits by atomic rename or leaves the slot as it was.
//! - Operations on one slot are serialized; different slots run concurrently.

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod integrity;
pub mod migrate;
pub mod mods;
pub mod orchestrator;
pub mod registry;
pub mod snapshot;
pub mod storage;

pub use codec::{Capture, RestoreReport};
pub use config::{ConfigError, PersistConfig, RetryPolicy};
pub use error::{
    CodecError, ErrorCode, FormatError, IntegrityIssue, LoadError, MigrationError, StorageError,
};
pub use format::SaveHeader;
pub use integrity::ValidationResult;
pub use migrate::{MigrationStep, VersionMigrator};
pub use mods::{CompatibilityResult, ModConflictInfo, ModRegistry, ModSchema};
pub use orchestrator::{
    CancelToken, LoadResult, LoadStage, OperationError, OperationResult, SaveEvent,
    SaveOrchestrator, SaveRequest, SaveResult, SaveState,
};
pub use registry::{ComponentRegistry, MapEntities, RegistryBuilder, Tombstone};
pub use snapshot::{
    Archetype, EntityRecord, ModBlock, PlayerProgress, SaveMetadata, Snapshot, WorldState,
};
pub use storage::{SaveSlotInfo, SlotId, StorageBackend};
