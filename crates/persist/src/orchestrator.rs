//! The public save/load facade.
//!
//! Save: `Idle -> Capturing -> Validating -> BackingUp -> Encoding -> Writing
//! -> Committed`. Validation failures end in `Rejected` with nothing touched
//! on disk; failures once the backup step has started end in `RolledBack`.
//! Load: read, verify, decode, migrate, check mods, restore.
//!
//! Operations on one slot are serialized by a per-slot async mutex; header
//! reads and listing never take it.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::Instrument;
use uuid::Uuid;
use worldsave_common::{FormatVersion, ModId};
use worldsave_kernel::WorldAccess;

use crate::codec;
use crate::config::PersistConfig;
use crate::error::{ErrorCode, LoadError, StorageError};
use crate::format::{self, SaveHeader};
use crate::integrity::{self, ValidationResult};
use crate::migrate::VersionMigrator;
use crate::mods::{CompatibilityResult, ModRegistry};
use crate::registry::ComponentRegistry;
use crate::snapshot::{ModBlock, PlayerProgress, SaveMetadata, Snapshot};
use crate::storage::{SaveSlotInfo, SlotId, StorageBackend};

const EVENT_CAPACITY: usize = 256;
const NO_AUTOSAVE: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SaveState {
    Idle,
    Capturing,
    Validating,
    BackingUp,
    Encoding,
    Writing,
    Committed,
    Rejected,
    RolledBack,
    /// Cancelled before anything was written.
    Cancelled,
}

impl SaveState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Rejected | Self::RolledBack | Self::Cancelled
        )
    }

    /// States after which a failure must roll back.
    fn has_side_effects(self) -> bool {
        matches!(self, Self::BackingUp | Self::Encoding | Self::Writing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LoadStage {
    Reading,
    Verifying,
    Decoding,
    Migrating,
    CheckingMods,
    Restoring,
}

/// Lifecycle notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SaveEvent {
    StateChanged {
        op_id: u64,
        slot: String,
        from: SaveState,
        to: SaveState,
    },
    Committed {
        op_id: u64,
        slot: String,
        bytes: u64,
    },
    Rejected {
        op_id: u64,
        slot: String,
        errors: Vec<String>,
    },
    RolledBack {
        op_id: u64,
        slot: String,
        code: ErrorCode,
    },
    LoadStage {
        op_id: u64,
        slot: String,
        stage: LoadStage,
    },
    LoadCompleted {
        op_id: u64,
        slot: String,
        entities: usize,
    },
    LoadFailed {
        op_id: u64,
        slot: String,
        code: ErrorCode,
    },
}

impl SaveEvent {
    pub fn op_id(&self) -> u64 {
        match self {
            Self::StateChanged { op_id, .. }
            | Self::Committed { op_id, .. }
            | Self::Rejected { op_id, .. }
            | Self::RolledBack { op_id, .. }
            | Self::LoadStage { op_id, .. }
            | Self::LoadCompleted { op_id, .. }
            | Self::LoadFailed { op_id, .. } => *op_id,
        }
    }
}

/// Cooperative cancellation, checked between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a save captures.
pub struct SaveRequest<'a, W: WorldAccess + ?Sized> {
    world: &'a W,
    progress: PlayerProgress,
    mod_data: BTreeMap<ModId, ModBlock>,
    metadata: SaveMetadata,
    cancel: CancelToken,
}

impl<'a, W: WorldAccess + ?Sized> SaveRequest<'a, W> {
    pub fn new(world: &'a W) -> Self {
        Self {
            world,
            progress: PlayerProgress::default(),
            mod_data: BTreeMap::new(),
            metadata: SaveMetadata::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn progress(mut self, progress: PlayerProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn mod_data(mut self, mod_data: BTreeMap<ModId, ModBlock>) -> Self {
        self.mod_data = mod_data;
        self
    }

    pub fn metadata(mut self, metadata: SaveMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub code: ErrorCode,
    pub message: String,
}

impl OperationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<LoadError> for OperationError {
    fn from(err: LoadError) -> Self {
        Self::new(err.code, err.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveResult {
    pub success: bool,
    pub slot_id: String,
    pub state: SaveState,
    pub error: Option<OperationError>,
    pub warnings: Vec<String>,
    pub snapshot_id: Option<Uuid>,
    pub entity_count: usize,
    pub bytes_written: u64,
    /// Hex SHA-256 of the file trailer.
    pub checksum: Option<String>,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub success: bool,
    pub slot_id: String,
    pub error: Option<OperationError>,
    pub warnings: Vec<String>,
    pub snapshot_id: Option<Uuid>,
    pub game_version: Option<String>,
    pub format_version: Option<FormatVersion>,
    /// Format the file was written in, when a migration ran.
    pub migrated_from: Option<FormatVersion>,
    pub applied_migrations: Vec<String>,
    pub pre_migration_backup: Option<PathBuf>,
    pub entities_restored: usize,
    pub tombstones: usize,
    pub progress: Option<PlayerProgress>,
    /// Mod data after compatibility handling, for the game to hand to its mods.
    pub mod_data: BTreeMap<ModId, ModBlock>,
    pub compatibility: Option<CompatibilityResult>,
}

impl LoadResult {
    fn empty(slot: &str) -> Self {
        Self {
            success: false,
            slot_id: slot.to_string(),
            error: None,
            warnings: Vec::new(),
            snapshot_id: None,
            game_version: None,
            format_version: None,
            migrated_from: None,
            applied_migrations: Vec::new(),
            pre_migration_backup: None,
            entities_restored: 0,
            tombstones: 0,
            progress: None,
            mod_data: BTreeMap::new(),
            compatibility: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub error: Option<OperationError>,
    pub warnings: Vec<String>,
}

impl OperationResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
            warnings: Vec::new(),
        }
    }

    fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(OperationError::new(code, message)),
            warnings: Vec::new(),
        }
    }
}

/// Tracks one save through the state machine and reports transitions.
struct SaveRun<'o> {
    events: &'o broadcast::Sender<SaveEvent>,
    op_id: u64,
    result: SaveResult,
}

impl<'o> SaveRun<'o> {
    fn new(events: &'o broadcast::Sender<SaveEvent>, op_id: u64, slot: &str) -> Self {
        Self {
            events,
            op_id,
            result: SaveResult {
                success: false,
                slot_id: slot.to_string(),
                state: SaveState::Idle,
                error: None,
                warnings: Vec::new(),
                snapshot_id: None,
                entity_count: 0,
                bytes_written: 0,
                checksum: None,
                backup: None,
            },
        }
    }

    fn enter(&mut self, to: SaveState) {
        let from = self.result.state;
        tracing::debug!(?from, ?to, "save state");
        self.result.state = to;
        self.emit(SaveEvent::StateChanged {
            op_id: self.op_id,
            slot: self.result.slot_id.clone(),
            from,
            to,
        });
    }

    fn emit(&self, event: SaveEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail(mut self, to: SaveState, code: ErrorCode, message: impl Into<String>) -> SaveResult {
        let message = message.into();
        tracing::warn!(%code, %message, state = ?self.result.state, "save failed");
        self.result.error = Some(OperationError::new(code, message));
        self.enter(to);
        self.result
    }
}

/// Sequences capture, validation, backup, encoding, and writing for saves,
/// and the reverse for loads.
pub struct SaveOrchestrator {
    config: PersistConfig,
    registry: Arc<ComponentRegistry>,
    mods: Arc<ModRegistry>,
    migrator: Arc<VersionMigrator>,
    storage: StorageBackend,
    locks: Mutex<HashMap<SlotId, Arc<Mutex<()>>>>,
    autosave: Mutex<()>,
    last_autosave: AtomicUsize,
    next_op: AtomicU64,
    events: broadcast::Sender<SaveEvent>,
}

impl SaveOrchestrator {
    pub fn new(config: PersistConfig, registry: Arc<ComponentRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage: StorageBackend::from_config(&config),
            config,
            registry,
            mods: Arc::new(ModRegistry::new()),
            migrator: Arc::new(VersionMigrator::default()),
            locks: Mutex::new(HashMap::new()),
            autosave: Mutex::new(()),
            last_autosave: AtomicUsize::new(NO_AUTOSAVE),
            next_op: AtomicU64::new(1),
            events,
        }
    }

    pub fn with_mods(mut self, mods: Arc<ModRegistry>) -> Self {
        self.mods = mods;
        self
    }

    pub fn with_migrator(mut self, migrator: Arc<VersionMigrator>) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn slot_lock(&self, slot: &SlotId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(slot.clone()).or_default().clone()
    }

    fn op_id(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    /// Capture the request's world and write it to `slot`.
    pub async fn save_game<W: WorldAccess + ?Sized>(
        &self,
        slot: &str,
        request: SaveRequest<'_, W>,
    ) -> SaveResult {
        let op_id = self.op_id();
        let span = tracing::info_span!("save_game", slot, op_id);
        self.run_save(op_id, slot, request).instrument(span).await
    }

    async fn run_save<W: WorldAccess + ?Sized>(
        &self,
        op_id: u64,
        raw_slot: &str,
        request: SaveRequest<'_, W>,
    ) -> SaveResult {
        let mut run = SaveRun::new(&self.events, op_id, raw_slot);
        let slot = match SlotId::parse(raw_slot) {
            Ok(slot) => slot,
            Err(e) => return run.fail(SaveState::Rejected, ErrorCode::InvalidState, e.to_string()),
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        let cancel = &request.cancel;

        if cancel.is_cancelled() {
            return run.fail(SaveState::Cancelled, ErrorCode::Cancelled, "cancelled before capture");
        }
        run.enter(SaveState::Capturing);
        let capture = codec::capture(request.world, &self.registry);
        run.result.warnings.extend(capture.warnings);

        if cancel.is_cancelled() {
            return run.fail(SaveState::Cancelled, ErrorCode::Cancelled, "cancelled after capture");
        }
        run.enter(SaveState::Validating);
        let game_version = request
            .metadata
            .game_version
            .clone()
            .unwrap_or_else(|| self.config.game_version.clone());
        let snapshot = Snapshot::new(
            Uuid::new_v4(),
            game_version,
            self.migrator.current(),
            Utc::now(),
            capture.world,
            request.progress,
            request.mod_data,
        );
        run.result.snapshot_id = Some(snapshot.id());
        run.result.entity_count = snapshot.entity_count();

        let capture_failed = !capture.errors.is_empty();
        let mut validation = integrity::validate_before_save(&snapshot, &self.mods);
        if capture_failed {
            let mut errors: Vec<String> = capture.errors.iter().map(ToString::to_string).collect();
            errors.append(&mut validation.errors);
            validation = ValidationResult {
                is_valid: false,
                errors,
            };
        }
        if !validation.is_valid {
            let code = if capture_failed {
                ErrorCode::SerializationFailed
            } else {
                ErrorCode::ValidationFailed
            };
            run.emit(SaveEvent::Rejected {
                op_id,
                slot: slot.to_string(),
                errors: validation.errors.clone(),
            });
            return run.fail(SaveState::Rejected, code, validation.errors.join("; "));
        }

        if cancel.is_cancelled() {
            return run.fail(SaveState::Cancelled, ErrorCode::Cancelled, "cancelled after validation");
        }
        run.enter(SaveState::BackingUp);
        if let Err(e) = self.storage.ensure_dir().await {
            return self.roll_back(run, &slot, e.write_code(), e.to_string()).await;
        }
        match self.storage.backup(&slot).await {
            Ok(backup) => run.result.backup = backup,
            Err(e) => {
                return self
                    .roll_back(run, &slot, ErrorCode::BackupFailed, e.to_string())
                    .await;
            }
        }

        if cancel.is_cancelled() {
            return self.roll_back(run, &slot, ErrorCode::Cancelled, "cancelled after backup").await;
        }
        run.enter(SaveState::Encoding);
        let payload = match codec::encode_payload(&snapshot, self.config.compression_level) {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .roll_back(run, &slot, ErrorCode::SerializationFailed, e.to_string())
                    .await;
            }
        };
        if request.metadata.description.len() > format::MAX_DESCRIPTION_LEN {
            run.result.warnings.push(format!(
                "description of {} bytes truncated to {}",
                request.metadata.description.len(),
                format::MAX_DESCRIPTION_LEN
            ));
        }
        let header = SaveHeader::new(
            snapshot.format_version(),
            snapshot.created_at().timestamp_millis(),
            &request.metadata.description,
            snapshot.entity_count() as u64,
        );
        let (bytes, digest) = format::assemble(&header, &payload);

        if cancel.is_cancelled() {
            return self.roll_back(run, &slot, ErrorCode::Cancelled, "cancelled after encoding").await;
        }
        run.enter(SaveState::Writing);
        if let Err(e) = self.storage.write_temp(&slot, &bytes).await {
            return self.roll_back(run, &slot, e.write_code(), e.to_string()).await;
        }
        // The temp write has finished; the rename must not follow a cancel.
        if cancel.is_cancelled() {
            return self.roll_back(run, &slot, ErrorCode::Cancelled, "cancelled before commit").await;
        }
        if let Err(e) = self.storage.commit(&slot).await {
            return self.roll_back(run, &slot, e.write_code(), e.to_string()).await;
        }
        if let Err(e) = self.storage.prune_backups(&slot).await {
            run.result.warnings.push(format!("failed to prune old backups: {e}"));
        }

        run.result.success = true;
        run.result.bytes_written = bytes.len() as u64;
        run.result.checksum = Some(integrity::hex(&digest));
        run.enter(SaveState::Committed);
        run.emit(SaveEvent::Committed {
            op_id,
            slot: slot.to_string(),
            bytes: bytes.len() as u64,
        });
        tracing::info!(
            entities = run.result.entity_count,
            bytes = bytes.len(),
            "save committed"
        );
        run.result
    }

    async fn roll_back(
        &self,
        mut run: SaveRun<'_>,
        slot: &SlotId,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> SaveResult {
        debug_assert!(run.result.state.has_side_effects());
        if let Err(e) = self.storage.discard_temp(slot).await {
            run.result.warnings.push(format!("failed to discard temp file: {e}"));
        }
        if run.result.backup.take().is_some() {
            let live_ok = matches!(self.storage.exists(slot).await, Ok(true));
            let undo = if live_ok {
                self.storage.drop_latest_backup(slot).await
            } else {
                self.storage.restore_latest_backup(slot).await.map(|_| ())
            };
            if let Err(e) = undo {
                run.result.warnings.push(format!("failed to restore backup: {e}"));
            }
        }
        run.emit(SaveEvent::RolledBack {
            op_id: run.op_id,
            slot: slot.to_string(),
            code,
        });
        run.fail(SaveState::RolledBack, code, message)
    }

    /// Save to the next rotating `autosave_<n>` slot.
    ///
    /// Picks the first slot that does not exist yet, otherwise the one after
    /// the last autosave written by this orchestrator, otherwise the oldest.
    pub async fn auto_save<W: WorldAccess + ?Sized>(&self, request: SaveRequest<'_, W>) -> SaveResult {
        let _serial = self.autosave.lock().await;
        let index = self.next_autosave_index().await;
        let slot = autosave_slot_name(index);
        tracing::debug!(%slot, "autosave slot chosen");
        let result = self.save_game(&slot, request).await;
        if result.success {
            self.last_autosave.store(index, Ordering::SeqCst);
        }
        result
    }

    async fn next_autosave_index(&self) -> usize {
        let slots = self.config.max_auto_save_slots.max(1);
        let mut oldest: Option<(i64, usize)> = None;
        for index in 0..slots {
            let Ok(slot) = SlotId::parse(&autosave_slot_name(index)) else {
                continue;
            };
            let saved_at = match self.storage.read_header(&slot).await {
                Ok(header) => header.saved_at_ms,
                Err(StorageError::NotFound(_)) => return index,
                // Unreadable slots are overwritten first.
                Err(_) => i64::MIN,
            };
            if oldest.is_none_or(|(t, _)| saved_at < t) {
                oldest = Some((saved_at, index));
            }
        }
        match self.last_autosave.load(Ordering::SeqCst) {
            NO_AUTOSAVE => oldest.map_or(0, |(_, index)| index),
            last => (last + 1) % slots,
        }
    }

    /// Load `slot` into `world`. The world is only touched once every
    /// earlier step has succeeded.
    pub async fn load_game<W: WorldAccess + ?Sized>(&self, slot: &str, world: &mut W) -> LoadResult {
        self.load_game_with(slot, world, &CancelToken::new()).await
    }

    pub async fn load_game_with<W: WorldAccess + ?Sized>(
        &self,
        slot: &str,
        world: &mut W,
        cancel: &CancelToken,
    ) -> LoadResult {
        let op_id = self.op_id();
        let span = tracing::info_span!("load_game", slot, op_id);
        async {
            let mut result = LoadResult::empty(slot);
            match self.run_load(op_id, slot, world, cancel, &mut result).await {
                Ok(()) => {
                    result.success = true;
                    let _ = self.events.send(SaveEvent::LoadCompleted {
                        op_id,
                        slot: slot.to_string(),
                        entities: result.entities_restored,
                    });
                    tracing::info!(entities = result.entities_restored, "load completed");
                }
                Err(e) => {
                    tracing::warn!(code = %e.code, message = %e.message, "load failed");
                    let _ = self.events.send(SaveEvent::LoadFailed {
                        op_id,
                        slot: slot.to_string(),
                        code: e.code,
                    });
                    result.error = Some(e.into());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_load<W: WorldAccess + ?Sized>(
        &self,
        op_id: u64,
        raw_slot: &str,
        world: &mut W,
        cancel: &CancelToken,
        result: &mut LoadResult,
    ) -> Result<(), LoadError> {
        let slot = SlotId::parse(raw_slot)
            .map_err(|e| LoadError::new(ErrorCode::InvalidState, e.to_string()))?;
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        let stage = |stage: LoadStage| -> Result<(), LoadError> {
            if cancel.is_cancelled() {
                return Err(LoadError::new(
                    ErrorCode::Cancelled,
                    format!("cancelled before {stage:?}"),
                ));
            }
            tracing::debug!(?stage, "load stage");
            let _ = self.events.send(SaveEvent::LoadStage {
                op_id,
                slot: slot.to_string(),
                stage,
            });
            Ok(())
        };

        stage(LoadStage::Reading)?;
        let bytes = self
            .storage
            .read(&slot)
            .await
            .map_err(|e| LoadError::new(e.read_code(), e.to_string()))?;

        stage(LoadStage::Verifying)?;
        let file = format::split(&bytes).map_err(|e| {
            let e = StorageError::Format(e);
            LoadError::new(e.read_code(), e.to_string())
        })?;
        if !file.checksum_ok() {
            return Err(LoadError::new(
                ErrorCode::CorruptedData,
                "file checksum does not match its contents",
            ));
        }
        let current = self.migrator.current();
        if file.header.version > current {
            return Err(LoadError::new(
                ErrorCode::UnsupportedVersion,
                format!(
                    "save format {} is newer than supported format {current}",
                    file.header.version
                ),
            ));
        }

        stage(LoadStage::Decoding)?;
        let snapshot = codec::decode_payload(file.payload)
            .map_err(|e| LoadError::new(ErrorCode::CorruptedData, e.to_string()))?;
        if snapshot.format_version() != file.header.version {
            return Err(LoadError::new(
                ErrorCode::CorruptedData,
                format!(
                    "header says format {} but payload says {}",
                    file.header.version,
                    snapshot.format_version()
                ),
            ));
        }
        let issues = integrity::world_issues(snapshot.world());
        if let Some(issue) = issues.first() {
            return Err(LoadError::new(ErrorCode::CorruptedData, issue.to_string()));
        }
        result.snapshot_id = Some(snapshot.id());
        result.game_version = Some(snapshot.game_version().to_string());

        let snapshot = if self.migrator.needs_migration(snapshot.format_version()) {
            stage(LoadStage::Migrating)?;
            let from = snapshot.format_version();
            // Refuse early so no backup is left for a save that cannot load.
            self.migrator.plan(from)?;
            let backup = self
                .storage
                .backup_pre_migration(&slot, &bytes, from)
                .await
                .map_err(|e| {
                    LoadError::new(
                        ErrorCode::MigrationFailed,
                        format!("pre-migration backup failed: {e}"),
                    )
                })?;
            result.pre_migration_backup = Some(backup);
            let migrated = self.migrator.migrate(&snapshot)?;
            if let Some(issue) = integrity::world_issues(migrated.snapshot.world()).first() {
                return Err(LoadError::new(
                    ErrorCode::MigrationFailed,
                    format!("migrated world is inconsistent: {issue}"),
                ));
            }
            result.migrated_from = Some(from);
            result.applied_migrations = migrated.applied;
            migrated.snapshot
        } else {
            snapshot
        };
        result.format_version = Some(snapshot.format_version());

        stage(LoadStage::CheckingMods)?;
        let (compat, mod_data) = self.mods.check(snapshot.mod_data());
        result.warnings.extend(compat.warnings.iter().cloned());
        let conflicts: Vec<String> = compat
            .conflicts
            .iter()
            .map(|c| {
                format!(
                    "{} (saved v{}, loaded v{}): {}",
                    c.mod_id, c.saved_version, c.loaded_version, c.reason
                )
            })
            .collect();
        result.compatibility = Some(compat);
        if !conflicts.is_empty() {
            return Err(LoadError::new(ErrorCode::ModConflict, conflicts.join("; ")));
        }

        stage(LoadStage::Restoring)?;
        let report = codec::restore(snapshot.world(), &self.registry, world)
            .map_err(|e| LoadError::new(ErrorCode::RestoreError, e.to_string()))?;
        result.warnings.extend(report.warnings);
        result.entities_restored = report.entities;
        result.tombstones = report.tombstones;
        let (_, progress, _) = snapshot.into_parts();
        result.progress = Some(progress);
        result.mod_data = mod_data;
        Ok(())
    }

    /// Remove a slot and its backups. False if it did not exist or could not
    /// be removed.
    pub async fn delete_save(&self, slot: &str) -> bool {
        let Ok(slot) = SlotId::parse(slot) else {
            tracing::warn!(slot, "refusing to delete invalid slot id");
            return false;
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        match self.storage.delete(&slot).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!(%slot, error = %e, "delete failed");
                false
            }
        }
    }

    /// Put the newest rotating backup of `slot` back in place.
    pub async fn restore_backup(&self, slot: &str) -> OperationResult {
        let slot = match SlotId::parse(slot) {
            Ok(slot) => slot,
            Err(e) => return OperationResult::failed(ErrorCode::InvalidState, e.to_string()),
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        match self.storage.restore_latest_backup(&slot).await {
            Ok(true) => OperationResult::ok(),
            Ok(false) => OperationResult::failed(
                ErrorCode::FileNotFound,
                format!("{slot} has no backup"),
            ),
            Err(e) => OperationResult::failed(e.write_code(), e.to_string()),
        }
    }

    /// Header-only listing of every slot.
    pub async fn list_save_slots(&self) -> Vec<SaveSlotInfo> {
        match self.storage.list_slots().await {
            Ok(slots) => slots,
            Err(e) => {
                tracing::warn!(error = %e, "listing save slots failed");
                Vec::new()
            }
        }
    }

    pub async fn export_save(&self, slot: &str, dest: &Path) -> OperationResult {
        let slot = match SlotId::parse(slot) {
            Ok(slot) => slot,
            Err(e) => return OperationResult::failed(ErrorCode::InvalidState, e.to_string()),
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        match self.storage.export(&slot, dest).await {
            Ok(bytes) => {
                tracing::info!(%slot, dest = %dest.display(), bytes, "save exported");
                OperationResult::ok()
            }
            Err(e) => OperationResult::failed(e.read_code(), e.to_string()),
        }
    }

    pub async fn import_save(&self, src: &Path, slot: &str) -> OperationResult {
        let slot = match SlotId::parse(slot) {
            Ok(slot) => slot,
            Err(e) => return OperationResult::failed(ErrorCode::InvalidState, e.to_string()),
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        match self.storage.import(src, &slot).await {
            Ok(()) => OperationResult::ok(),
            Err(e @ (StorageError::NotASaveFile(..) | StorageError::NotFound(_))) => {
                OperationResult::failed(e.read_code(), e.to_string())
            }
            Err(e) => OperationResult::failed(e.write_code(), e.to_string()),
        }
    }

    /// Full integrity check of a slot without touching any world.
    pub async fn verify_save_integrity(&self, slot: &str) -> ValidationResult {
        let slot = match SlotId::parse(slot) {
            Ok(slot) => slot,
            Err(e) => return ValidationResult::failed(e.to_string()),
        };
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        let bytes = match self.storage.read(&slot).await {
            Ok(bytes) => bytes,
            Err(e) => return ValidationResult::failed(e.to_string()),
        };
        let file = match format::split(&bytes) {
            Ok(file) => file,
            Err(e) => return ValidationResult::failed(e.to_string()),
        };
        if !file.checksum_ok() {
            return ValidationResult::failed("file checksum does not match its contents");
        }
        let snapshot = match codec::decode_payload(file.payload) {
            Ok(snapshot) => snapshot,
            Err(e) => return ValidationResult::failed(e.to_string()),
        };
        let mut errors: Vec<String> = integrity::world_issues(snapshot.world())
            .iter()
            .map(ToString::to_string)
            .collect();
        if snapshot.entity_count() as u64 != file.header.entity_count {
            errors.push(format!(
                "header declares {} entities but payload holds {}",
                file.header.entity_count,
                snapshot.entity_count()
            ));
        }
        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

pub fn autosave_slot_name(index: usize) -> String {
    format!("autosave_{index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{MigrationStep, set_field};
    use crate::mods::ModSchema;
    use crate::registry::{EntityMapper, MapEntities};
    use crate::snapshot::{Archetype, EntityRecord, WorldState};
    use serde::Deserialize;
    use std::time::Duration;
    use worldsave_common::{EntityId, LocalId};
    use worldsave_kernel::{Component, World};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {
        const TYPE_NAME: &'static str = "Position";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }
    impl Component for Velocity {
        const TYPE_NAME: &'static str = "Velocity";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health {
        current: i32,
        max: i32,
    }
    impl Component for Health {
        const TYPE_NAME: &'static str = "Health";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Target(EntityId);
    impl Component for Target {
        const TYPE_NAME: &'static str = "Target";
    }
    impl MapEntities for Target {
        fn map_entities(&mut self, map: &mut EntityMapper<'_>) {
            self.0 = map(self.0);
        }
    }

    fn registry() -> Arc<ComponentRegistry> {
        let mut b = ComponentRegistry::builder();
        b.register::<Position>()
            .unwrap()
            .register::<Velocity>()
            .unwrap()
            .register::<Health>()
            .unwrap()
            .register_mapped::<Target>()
            .unwrap();
        Arc::new(b.build())
    }

    fn orchestrator(dir: &Path) -> SaveOrchestrator {
        SaveOrchestrator::new(PersistConfig::in_dir(dir), registry())
    }

    fn three_entities() -> World {
        let mut w = World::new();
        for (x, y) in [(1.0, 2.0), (3.0, 4.0)] {
            let id = w.spawn();
            w.insert(id, Position { x, y });
            w.insert(id, Velocity { dx: 0.5, dy: -0.5 });
        }
        let id = w.spawn();
        w.insert(id, Health { current: 80, max: 100 });
        w
    }

    fn positions(w: &World) -> Vec<(f32, f32)> {
        let mut out: Vec<(f32, f32)> = w
            .entity_ids()
            .into_iter()
            .filter_map(|id| w.get::<Position>(id).map(|p| (p.x, p.y)))
            .collect();
        out.sort_by(|a, b| a.partial_cmp(b).unwrap());
        out
    }

    fn drain(rx: &mut broadcast::Receiver<SaveEvent>) -> Vec<SaveEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[SaveEvent]) -> Vec<SaveState> {
        events
            .iter()
            .filter_map(|e| match e {
                SaveEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_world_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = World::new();
        let saved = orch.save_game("slot1", SaveRequest::new(&world)).await;
        assert!(saved.success, "{:?}", saved.error);
        assert_eq!(saved.state, SaveState::Committed);
        assert_eq!(saved.entity_count, 0);

        let mut target = three_entities();
        let loaded = orch.load_game("slot1", &mut target).await;
        assert!(loaded.success, "{:?}", loaded.error);
        assert_eq!(loaded.entities_restored, 0);
        assert_eq!(target.entity_count(), 0);
        assert_eq!(loaded.snapshot_id, saved.snapshot_id);
    }

    #[tokio::test]
    async fn three_entities_two_archetypes() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = three_entities();
        let mut progress = PlayerProgress::default();
        progress.chapter = 2;
        progress.counters.insert("coins".into(), 120);

        let mut rx = orch.subscribe();
        let saved = orch
            .save_game(
                "slot2",
                SaveRequest::new(&world)
                    .progress(progress.clone())
                    .description("Before the bridge"),
            )
            .await;
        assert!(saved.success, "{:?}", saved.error);
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                SaveState::Capturing,
                SaveState::Validating,
                SaveState::BackingUp,
                SaveState::Encoding,
                SaveState::Writing,
                SaveState::Committed,
            ]
        );

        let mut target = World::new();
        let loaded = orch.load_game("slot2", &mut target).await;
        assert!(loaded.success, "{:?}", loaded.error);
        assert_eq!(loaded.entities_restored, 3);
        assert_eq!(loaded.progress, Some(progress));
        assert_eq!(positions(&target), vec![(1.0, 2.0), (3.0, 4.0)]);
        let healths: Vec<&Health> = target
            .entity_ids()
            .into_iter()
            .filter_map(|id| target.get::<Health>(id))
            .collect();
        assert_eq!(healths, vec![&Health { current: 80, max: 100 }]);

        let slots = orch.list_save_slots().await;
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].description.as_deref(), Some("Before the bridge"));
        assert_eq!(slots[0].entity_count, Some(3));
        assert!(orch.verify_save_integrity("slot2").await.is_valid);
    }

    #[tokio::test]
    async fn resave_of_loaded_world_matches() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let reg = registry();
        let world = three_entities();
        assert!(orch.save_game("a", SaveRequest::new(&world)).await.success);
        let mut loaded = World::new();
        assert!(orch.load_game("a", &mut loaded).await.success);
        let before = codec::encode_world(&codec::capture(&world, &reg).world).unwrap();
        let after = codec::encode_world(&codec::capture(&loaded, &reg).world).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn flipped_payload_byte_is_corrupted_data() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        assert!(orch.save_game("c", SaveRequest::new(&three_entities())).await.success);

        let path = orch.storage().slot_path(&SlotId::parse("c").unwrap());
        let mut bytes = std::fs::read(&path).unwrap();
        let last_payload = bytes.len() - format::CHECKSUM_LEN - 1;
        bytes[last_payload] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut target = three_entities();
        let before = positions(&target);
        let loaded = orch.load_game("c", &mut target).await;
        assert!(!loaded.success);
        assert_eq!(loaded.error.unwrap().code, ErrorCode::CorruptedData);
        assert_eq!(positions(&target), before);
        assert_eq!(target.entity_count(), 3);
        assert!(!orch.verify_save_integrity("c").await.is_valid);
    }

    #[tokio::test]
    async fn truncated_file_is_invalid_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        std::fs::write(dir.path().join("short.wsav"), b"WSAV").unwrap();
        let loaded = orch.load_game("short", &mut World::new()).await;
        assert_eq!(loaded.error.unwrap().code, ErrorCode::InvalidChecksum);
    }

    #[tokio::test]
    async fn missing_slot_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let loaded = orch.load_game("nothing", &mut World::new()).await;
        assert_eq!(loaded.error.unwrap().code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn invalid_slot_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let saved = orch.save_game("../escape", SaveRequest::new(&World::new())).await;
        assert!(!saved.success);
        assert_eq!(saved.error.unwrap().code, ErrorCode::InvalidState);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        assert!(!orch.delete_save("a/b").await);
    }

    #[derive(Serialize)]
    struct HealthV0 {
        current: i32,
    }

    /// Write a format 0.9 save whose Health components lack `max`.
    async fn write_v09_save(orch: &SaveOrchestrator, slot: &str) {
        let mut bytes = Vec::new();
        ciborium::into_writer(&HealthV0 { current: 40 }, &mut bytes).unwrap();
        let mut record = EntityRecord::new(LocalId(0));
        record.components.insert("Health".into(), bytes);
        let world = WorldState {
            archetypes: vec![Archetype {
                component_types: ["Health".to_string()].into_iter().collect(),
                entities: vec![record],
            }],
        };
        let v09 = FormatVersion::new(0, 9);
        let snapshot = Snapshot::new(
            Uuid::new_v4(),
            "0.9.0",
            v09,
            Utc::now(),
            world,
            PlayerProgress::default(),
            BTreeMap::new(),
        );
        let payload = codec::encode_payload(&snapshot, 3).unwrap();
        let header = SaveHeader::new(v09, 0, "old", 1);
        let (file, _) = format::assemble(&header, &payload);
        orch.storage()
            .write(&SlotId::parse(slot).unwrap(), &file)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migration_from_0_9_sets_default_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut migrator = VersionMigrator::new(FormatVersion::new(1, 0));
        migrator
            .register(MigrationStep::new(
                FormatVersion::new(0, 9),
                FormatVersion::new(1, 0),
                "health_max",
                |mut world| {
                    set_field(&mut world, "Health", "max", ciborium::Value::Integer(70.into()))?;
                    Ok(world)
                },
            ))
            .unwrap();
        let orch = orchestrator(dir.path()).with_migrator(Arc::new(migrator));
        write_v09_save(&orch, "old").await;

        let mut world = World::new();
        let loaded = orch.load_game("old", &mut world).await;
        assert!(loaded.success, "{:?}", loaded.error);
        assert_eq!(loaded.migrated_from, Some(FormatVersion::new(0, 9)));
        assert_eq!(loaded.format_version, Some(FormatVersion::new(1, 0)));
        assert_eq!(loaded.applied_migrations, vec!["health_max".to_string()]);
        let id = world.entity_ids()[0];
        assert_eq!(world.get::<Health>(id), Some(&Health { current: 40, max: 70 }));
        assert!(loaded.pre_migration_backup.unwrap().exists());
    }

    #[tokio::test]
    async fn failed_migration_keeps_backup_and_world() {
        let dir = tempfile::tempdir().unwrap();
        let mut migrator = VersionMigrator::new(FormatVersion::new(1, 0));
        migrator
            .register(MigrationStep::new(
                FormatVersion::new(0, 9),
                FormatVersion::new(1, 0),
                "broken_step",
                |_| Err("cannot convert".to_string()),
            ))
            .unwrap();
        let orch = orchestrator(dir.path()).with_migrator(Arc::new(migrator));
        write_v09_save(&orch, "old").await;

        let mut world = three_entities();
        let loaded = orch.load_game("old", &mut world).await;
        let error = loaded.error.unwrap();
        assert_eq!(error.code, ErrorCode::MigrationFailed);
        assert!(error.message.contains("broken_step"));
        assert_eq!(world.entity_count(), 3);
        assert!(loaded.pre_migration_backup.unwrap().exists());
    }

    #[tokio::test]
    async fn missing_migration_path_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        write_v09_save(&orch, "old").await;
        let loaded = orch.load_game("old", &mut World::new()).await;
        assert_eq!(loaded.error.unwrap().code, ErrorCode::UnsupportedVersion);
        assert!(loaded.pre_migration_backup.is_none());
    }

    #[tokio::test]
    async fn autosave_rotates_over_three_slots() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = three_entities();
        let mut used = Vec::new();
        for i in 0..4 {
            let result = orch
                .auto_save(SaveRequest::new(&world).description(format!("auto {i}")))
                .await;
            assert!(result.success, "{:?}", result.error);
            used.push(result.slot_id);
        }
        assert_eq!(used, vec!["autosave_0", "autosave_1", "autosave_2", "autosave_0"]);

        let slots = orch.list_save_slots().await;
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].description.as_deref(), Some("auto 3"));
        assert_eq!(slots[1].description.as_deref(), Some("auto 1"));
    }

    #[tokio::test]
    async fn autosave_prefers_oldest_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::new();
        {
            let orch = orchestrator(dir.path());
            for _ in 0..3 {
                assert!(orch.auto_save(SaveRequest::new(&world)).await.success);
            }
            // Rewrite slot 0 so slot 1 becomes the oldest.
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(orch.save_game("autosave_0", SaveRequest::new(&world)).await.success);
        }
        let orch = orchestrator(dir.path());
        let result = orch.auto_save(SaveRequest::new(&world)).await;
        assert_eq!(result.slot_id, "autosave_1");
    }

    #[tokio::test]
    async fn dangling_reference_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut world = World::new();
        let id = world.spawn();
        world.insert(id, Target(EntityId::new()));

        let mut rx = orch.subscribe();
        let saved = orch.save_game("bad", SaveRequest::new(&world)).await;
        assert_eq!(saved.state, SaveState::Rejected);
        assert_eq!(saved.error.unwrap().code, ErrorCode::ValidationFailed);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SaveEvent::Rejected { .. })));
        assert!(!dir.path().join("bad.wsav").exists());
    }

    #[tokio::test]
    async fn references_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut world = World::new();
        let enemy = world.spawn();
        world.insert(enemy, Health { current: 5, max: 5 });
        let hunter = world.spawn();
        world.insert(hunter, Target(enemy));
        assert!(orch.save_game("refs", SaveRequest::new(&world)).await.success);

        let mut target = World::new();
        assert!(orch.load_game("refs", &mut target).await.success);
        let hunter = target
            .entity_ids()
            .into_iter()
            .find(|id| target.get::<Target>(*id).is_some())
            .unwrap();
        let enemy = target.get::<Target>(hunter).unwrap().0;
        assert_eq!(target.get::<Health>(enemy), Some(&Health { current: 5, max: 5 }));
    }

    #[tokio::test]
    async fn unregistered_mod_data_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut mods = BTreeMap::new();
        mods.insert(
            ModId::new("quests"),
            ModBlock {
                version: 1,
                bytes: vec![1],
            },
        );
        let saved = orch
            .save_game("m", SaveRequest::new(&World::new()).mod_data(mods))
            .await;
        assert_eq!(saved.error.unwrap().code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn newer_mod_data_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut newer = ModRegistry::new();
        newer.register(ModSchema::new("quests", 3)).unwrap();
        let writer = orchestrator(dir.path()).with_mods(Arc::new(newer));
        let mut blocks = BTreeMap::new();
        blocks.insert(
            ModId::new("quests"),
            ModBlock {
                version: 3,
                bytes: vec![7],
            },
        );
        let world = three_entities();
        assert!(writer
            .save_game("m", SaveRequest::new(&world).mod_data(blocks))
            .await
            .success);

        let mut older = ModRegistry::new();
        older.register(ModSchema::new("quests", 2)).unwrap();
        let reader = orchestrator(dir.path()).with_mods(Arc::new(older));
        let mut target = World::new();
        let loaded = reader.load_game("m", &mut target).await;
        assert_eq!(loaded.error.unwrap().code, ErrorCode::ModConflict);
        assert_eq!(target.entity_count(), 0);
    }

    #[tokio::test]
    async fn missing_mod_loads_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut mods = ModRegistry::new();
        mods.register(ModSchema::new("weather", 1)).unwrap();
        let writer = orchestrator(dir.path()).with_mods(Arc::new(mods));
        let mut blocks = BTreeMap::new();
        blocks.insert(
            ModId::new("weather"),
            ModBlock {
                version: 1,
                bytes: vec![1],
            },
        );
        let world = World::new();
        assert!(writer
            .save_game("w", SaveRequest::new(&world).mod_data(blocks))
            .await
            .success);

        let reader = orchestrator(dir.path());
        let loaded = reader.load_game("w", &mut World::new()).await;
        assert!(loaded.success);
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.mod_data.contains_key(&ModId::new("weather")));
    }

    #[tokio::test]
    async fn write_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let slot = SlotId::parse("rb").unwrap();
        let original = three_entities();
        assert!(orch.save_game("rb", SaveRequest::new(&original)).await.success);
        let live_before = std::fs::read(orch.storage().slot_path(&slot)).unwrap();

        // A directory where the temp file goes makes the write fail.
        std::fs::create_dir(orch.storage().temp_path(&slot)).unwrap();
        let mut rx = orch.subscribe();
        let saved = orch.save_game("rb", SaveRequest::new(&World::new())).await;
        assert_eq!(saved.state, SaveState::RolledBack);
        assert_eq!(saved.error.unwrap().code, ErrorCode::WriteFailed);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SaveEvent::RolledBack { .. })));

        assert_eq!(std::fs::read(orch.storage().slot_path(&slot)).unwrap(), live_before);
        assert!(orch.storage().backups(&slot).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_save_at_backup_cap_keeps_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PersistConfig::in_dir(dir.path());
        config.max_backups_per_slot = 2;
        let orch = SaveOrchestrator::new(config, registry());
        let slot = SlotId::parse("capped").unwrap();
        let world = three_entities();
        for _ in 0..3 {
            assert!(orch.save_game("capped", SaveRequest::new(&world)).await.success);
        }
        let backups_before: Vec<Vec<u8>> = orch
            .storage()
            .backups(&slot)
            .await
            .unwrap()
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();
        assert_eq!(backups_before.len(), 2);
        assert!(!orch.storage().backup_path(&slot, 3).exists());

        std::fs::create_dir(orch.storage().temp_path(&slot)).unwrap();
        let saved = orch.save_game("capped", SaveRequest::new(&World::new())).await;
        assert_eq!(saved.state, SaveState::RolledBack);

        let backups_after: Vec<Vec<u8>> = orch
            .storage()
            .backups(&slot)
            .await
            .unwrap()
            .iter()
            .map(|p| std::fs::read(p).unwrap())
            .collect();
        assert_eq!(backups_after, backups_before);
        assert!(!orch.storage().backup_path(&slot, 3).exists());
    }

    #[tokio::test]
    async fn long_description_truncated_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let long = "d".repeat(format::MAX_DESCRIPTION_LEN + 10);
        let world = World::new();
        let saved = orch
            .save_game("long", SaveRequest::new(&world).description(long))
            .await;
        assert!(saved.success, "{:?}", saved.error);
        assert!(saved.warnings.iter().any(|w| w.contains("truncated")));
        let slots = orch.list_save_slots().await;
        assert_eq!(
            slots[0].description.as_ref().map(String::len),
            Some(format::MAX_DESCRIPTION_LEN)
        );
    }

    #[tokio::test]
    async fn restore_backup_waits_for_slot_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let slot = SlotId::parse("undo").unwrap();
        assert!(orch.save_game("undo", SaveRequest::new(&three_entities())).await.success);
        let first = std::fs::read(orch.storage().slot_path(&slot)).unwrap();
        assert!(orch.save_game("undo", SaveRequest::new(&World::new())).await.success);

        {
            let held = orch.slot_lock(&slot).await;
            let _guard = held.lock().await;
            let blocked =
                tokio::time::timeout(Duration::from_millis(50), orch.restore_backup("undo")).await;
            assert!(blocked.is_err());
        }

        assert!(orch.restore_backup("undo").await.success);
        assert_eq!(std::fs::read(orch.storage().slot_path(&slot)).unwrap(), first);
        let none_left = orch.restore_backup("undo").await;
        assert_eq!(none_left.error.unwrap().code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn inconsistent_migration_result_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut migrator = VersionMigrator::new(FormatVersion::new(1, 0));
        migrator
            .register(MigrationStep::new(
                FormatVersion::new(0, 9),
                FormatVersion::new(1, 0),
                "duplicates_archetype",
                |mut world| {
                    let copy = world.archetypes[0].clone();
                    world.archetypes.push(copy);
                    Ok(world)
                },
            ))
            .unwrap();
        let orch = orchestrator(dir.path()).with_migrator(Arc::new(migrator));
        write_v09_save(&orch, "old").await;

        let mut world = three_entities();
        let loaded = orch.load_game("old", &mut world).await;
        let error = loaded.error.unwrap();
        assert_eq!(error.code, ErrorCode::MigrationFailed);
        assert!(error.message.contains("inconsistent"), "{}", error.message);
        assert_eq!(world.entity_count(), 3);
    }

    #[tokio::test]
    async fn cancel_before_start_has_no_effects() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let token = CancelToken::new();
        token.cancel();
        let saved = orch
            .save_game("x", SaveRequest::new(&World::new()).cancel_token(token.clone()))
            .await;
        assert_eq!(saved.state, SaveState::Cancelled);
        assert_eq!(saved.error.unwrap().code, ErrorCode::Cancelled);
        assert!(!dir.path().join("x.wsav").exists());

        let loaded = orch.load_game_with("x", &mut World::new(), &token).await;
        assert_eq!(loaded.error.unwrap().code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn cancel_mid_save_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = three_entities();
        assert!(orch.save_game("mid", SaveRequest::new(&world)).await.success);
        let slot = SlotId::parse("mid").unwrap();
        let before = std::fs::read(orch.storage().slot_path(&slot)).unwrap();

        let token = CancelToken::new();
        let mut rx = orch.subscribe();
        let watcher = {
            let token = token.clone();
            async move {
                while let Ok(event) = rx.recv().await {
                    if matches!(
                        event,
                        SaveEvent::StateChanged {
                            to: SaveState::Encoding,
                            ..
                        }
                    ) {
                        token.cancel();
                        break;
                    }
                }
            }
        };
        let empty = World::new();
        let (saved, ()) = tokio::join!(
            orch.save_game("mid", SaveRequest::new(&empty).cancel_token(token)),
            watcher
        );
        assert_eq!(saved.state, SaveState::RolledBack);
        assert_eq!(saved.error.unwrap().code, ErrorCode::Cancelled);
        assert_eq!(std::fs::read(orch.storage().slot_path(&slot)).unwrap(), before);
        assert!(!orch.storage().temp_path(&slot).exists());
    }

    #[tokio::test]
    async fn same_slot_operations_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = three_entities();
        let mut rx = orch.subscribe();
        let (a, b) = tokio::join!(
            orch.save_game("shared", SaveRequest::new(&world)),
            orch.save_game("shared", SaveRequest::new(&world))
        );
        assert!(a.success && b.success);

        let ops: Vec<u64> = drain(&mut rx).iter().map(SaveEvent::op_id).collect();
        let first = ops[0];
        let switch = ops.iter().position(|op| *op != first).unwrap();
        assert!(ops[switch..].iter().all(|op| *op != first), "interleaved: {ops:?}");
    }

    #[tokio::test]
    async fn different_slots_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let world = three_entities();
        let held = orch.slot_lock(&SlotId::parse("busy").unwrap()).await;
        let _guard = held.lock().await;

        let other = tokio::time::timeout(
            Duration::from_secs(5),
            orch.save_game("free", SaveRequest::new(&world)),
        )
        .await
        .expect("save on another slot must not wait");
        assert!(other.success);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            orch.save_game("busy", SaveRequest::new(&world)),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn delete_export_import() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir.path().join("saves"));
        let world = three_entities();
        assert!(orch.save_game("keep", SaveRequest::new(&world)).await.success);

        let exported = dir.path().join("keep.export");
        assert!(orch.export_save("keep", &exported).await.success);
        assert!(orch.import_save(&exported, "copy").await.success);
        let mut target = World::new();
        assert!(orch.load_game("copy", &mut target).await.success);
        assert_eq!(target.entity_count(), 3);

        assert!(orch.delete_save("keep").await);
        assert!(!orch.delete_save("keep").await);
        let ids: Vec<String> = orch
            .list_save_slots()
            .await
            .into_iter()
            .map(|s| s.slot_id.to_string())
            .collect();
        assert_eq!(ids, vec!["copy"]);

        let bogus = dir.path().join("bogus.bin");
        std::fs::write(&bogus, vec![1u8; 100]).unwrap();
        let imported = orch.import_save(&bogus, "copy").await;
        assert_eq!(imported.error.unwrap().code, ErrorCode::CorruptedData);
    }
}
