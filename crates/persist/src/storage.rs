//! Slot files on disk.
//!
//! ```text
//! <dir>/<slot>.wsav              live save
//! <dir>/.<slot>.wsav.tmp         in-flight write, renamed over the live file
//! <dir>/<slot>.wsav.bak.<n>      rotating backups, 1 = newest
//! <dir>/<slot>.wsav.v<M>_<m>.bak bytes as they were before a format migration
//! ```
//!
//! Every I/O call runs under a per-call timeout and is retried with
//! exponential backoff when the error is transient.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use worldsave_common::FormatVersion;

use crate::config::{PersistConfig, RetryPolicy};
use crate::error::StorageError;
use crate::format::{self, SaveHeader, MAX_HEADER_LEN};

pub const SAVE_EXTENSION: &str = "wsav";
pub const MAX_SLOT_ID_LEN: usize = 64;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A sanitized slot name, safe to use as a file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let invalid = |reason| StorageError::InvalidSlotId {
            id: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.len() > MAX_SLOT_ID_LEN {
            return Err(invalid("longer than 64 bytes"));
        }
        if raw.contains(['/', '\\', ':']) {
            return Err(invalid("contains a path separator or drive root"));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("contains a control character"));
        }
        if raw.contains("..") {
            return Err(invalid("contains a traversal sequence"));
        }
        if raw.starts_with('.') || raw.ends_with('.') {
            return Err(invalid("starts or ends with '.'"));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid("only [A-Za-z0-9_-] and interior '.' are allowed"));
        }
        let stem = raw.split('.').next().unwrap_or(raw);
        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
            return Err(invalid("reserved device name"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SlotId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// What slot listing shows, read from the header only.
///
/// Header fields are `None` when the header could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveSlotInfo {
    pub slot_id: SlotId,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub format_version: Option<FormatVersion>,
    pub entity_count: Option<u64>,
    pub saved_at: Option<DateTime<Utc>>,
}

/// Atomic slot storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    dir: PathBuf,
    max_backups: usize,
    retry: RetryPolicy,
}

impl StorageBackend {
    pub fn new(dir: impl Into<PathBuf>, max_backups: usize, retry: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            max_backups,
            retry,
        }
    }

    pub fn from_config(config: &PersistConfig) -> Self {
        Self::new(
            config.save_dir.clone(),
            config.max_backups_per_slot,
            config.retry.clone(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_path(&self, slot: &SlotId) -> PathBuf {
        self.dir.join(format!("{slot}.{SAVE_EXTENSION}"))
    }

    pub fn temp_path(&self, slot: &SlotId) -> PathBuf {
        self.dir.join(format!(".{slot}.{SAVE_EXTENSION}.tmp"))
    }

    pub fn backup_path(&self, slot: &SlotId, n: usize) -> PathBuf {
        self.dir.join(format!("{slot}.{SAVE_EXTENSION}.bak.{n}"))
    }

    pub fn pre_migration_path(&self, slot: &SlotId, version: FormatVersion) -> PathBuf {
        self.dir.join(format!(
            "{slot}.{SAVE_EXTENSION}.v{}_{}.bak",
            version.major, version.minor
        ))
    }

    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        let dir = &self.dir;
        self.retry_io("create save dir", move || tokio::fs::create_dir_all(dir))
            .await
    }

    pub async fn exists(&self, slot: &SlotId) -> Result<bool, StorageError> {
        let path = self.slot_path(slot);
        let path = &path;
        self.retry_io("stat slot", move || tokio::fs::try_exists(path))
            .await
    }

    /// Whole file contents of a slot.
    pub async fn read(&self, slot: &SlotId) -> Result<Vec<u8>, StorageError> {
        let path = self.slot_path(slot);
        let path = &path;
        match self.retry_io("read slot", move || tokio::fs::read(path)).await {
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(slot.to_string()))
            }
            other => other,
        }
    }

    /// Parse only the header block of a slot.
    pub async fn read_header(&self, slot: &SlotId) -> Result<SaveHeader, StorageError> {
        let path = self.slot_path(slot);
        let bytes = match self.read_prefix(&path, MAX_HEADER_LEN).await {
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(slot.to_string()));
            }
            other => other?,
        };
        SaveHeader::parse(&bytes)
            .map(|(header, _)| header)
            .map_err(|e| StorageError::NotASaveFile(path, e))
    }

    /// Listing entry for one slot.
    pub async fn info(&self, slot: &SlotId) -> Result<SaveSlotInfo, StorageError> {
        let path = self.slot_path(slot);
        let meta = {
            let path = &path;
            match self.retry_io("stat slot", move || tokio::fs::metadata(path)).await {
                Err(StorageError::Io { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    return Err(StorageError::NotFound(slot.to_string()));
                }
                other => other?,
            }
        };
        let header = match self.read_header(slot).await {
            Ok(header) => Some(header),
            Err(e) => {
                tracing::warn!(%slot, error = %e, "unreadable save header");
                None
            }
        };
        Ok(SaveSlotInfo {
            slot_id: slot.clone(),
            file_path: path,
            size_bytes: meta.len(),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            description: header.as_ref().map(|h| h.description.clone()),
            format_version: header.as_ref().map(|h| h.version),
            entity_count: header.as_ref().map(|h| h.entity_count),
            saved_at: header
                .as_ref()
                .and_then(|h| DateTime::from_timestamp_millis(h.saved_at_ms)),
        })
    }

    /// Every slot in the directory, sorted by id. A missing directory is empty.
    pub async fn list_slots(&self) -> Result<Vec<SaveSlotInfo>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("list slots", e)),
        };
        let suffix = format!(".{SAVE_EXTENSION}");
        let mut slots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("list slots", e))?
        {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) else {
                continue;
            };
            if let Ok(slot) = SlotId::parse(stem) {
                slots.push(slot);
            }
        }
        slots.sort();

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.info(&slot).await {
                Ok(info) => out.push(info),
                // Deleted between read_dir and stat.
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Existing rotating backups of a slot, newest first.
    pub async fn backups(&self, slot: &SlotId) -> Result<Vec<PathBuf>, StorageError> {
        let mut out = Vec::new();
        for n in 1..=self.max_backups {
            let path = self.backup_path(slot, n);
            let candidate = &path;
            if self
                .retry_io("stat backup", move || tokio::fs::try_exists(candidate))
                .await?
            {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Copy the live slot to `.bak.1`, shifting older backups up. Returns
    /// `None` if there was nothing to back up.
    ///
    /// The set may hold one backup past the cap until
    /// [`prune_backups`](Self::prune_backups) runs after a commit, so that
    /// [`drop_latest_backup`](Self::drop_latest_backup) can shift it back.
    pub async fn backup(&self, slot: &SlotId) -> Result<Option<PathBuf>, StorageError> {
        if self.max_backups == 0 || !self.exists(slot).await? {
            return Ok(None);
        }
        for n in (1..=self.max_backups).rev() {
            let from = self.backup_path(slot, n);
            let to = self.backup_path(slot, n + 1);
            self.rename_if_exists("rotate backup", &from, &to).await?;
        }
        let live = self.slot_path(slot);
        let newest = self.backup_path(slot, 1);
        {
            let (from, to) = (&live, &newest);
            self.retry_io("copy backup", move || tokio::fs::copy(from, to))
                .await?;
        }
        tracing::debug!(%slot, backup = %newest.display(), "slot backed up");
        Ok(Some(newest))
    }

    /// Remove the backup pushed past the cap by the last [`backup`](Self::backup).
    pub async fn prune_backups(&self, slot: &SlotId) -> Result<(), StorageError> {
        if self
            .remove_if_exists("prune backup", &self.backup_path(slot, self.max_backups + 1))
            .await?
        {
            tracing::debug!(%slot, "oldest backup pruned");
        }
        Ok(())
    }

    /// Undo the most recent [`backup`](Self::backup) without touching the live slot.
    pub async fn drop_latest_backup(&self, slot: &SlotId) -> Result<(), StorageError> {
        self.remove_if_exists("drop backup", &self.backup_path(slot, 1))
            .await?;
        self.shift_backups_down(slot).await
    }

    /// Put `.bak.1` back as the live slot. Returns whether a backup existed.
    pub async fn restore_latest_backup(&self, slot: &SlotId) -> Result<bool, StorageError> {
        let newest = self.backup_path(slot, 1);
        let live = self.slot_path(slot);
        if !self.rename_if_exists("restore backup", &newest, &live).await? {
            return Ok(false);
        }
        self.sync_dir().await;
        self.shift_backups_down(slot).await?;
        tracing::info!(%slot, "slot restored from backup");
        Ok(true)
    }

    /// Keep the bytes of a save as they were before migrating it.
    pub async fn backup_pre_migration(
        &self,
        slot: &SlotId,
        bytes: &[u8],
        version: FormatVersion,
    ) -> Result<PathBuf, StorageError> {
        let path = self.pre_migration_path(slot, version);
        self.write_synced("pre-migration backup", &path, bytes)
            .await?;
        tracing::info!(%slot, %version, path = %path.display(), "pre-migration backup written");
        Ok(path)
    }

    /// Write `bytes` to the slot's temp file and fsync it.
    pub async fn write_temp(&self, slot: &SlotId, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        self.ensure_dir().await?;
        let temp = self.temp_path(slot);
        self.write_synced("write temp", &temp, bytes).await?;
        Ok(temp)
    }

    /// Atomically rename the temp file over the live slot.
    ///
    /// A rename that times out is not retried: it may still land, so the
    /// outcome is read back from whether the temp file is gone.
    pub async fn commit(&self, slot: &SlotId) -> Result<(), StorageError> {
        let (temp, live) = (self.temp_path(slot), self.slot_path(slot));
        let renamed = {
            let (from, to) = (&temp, &live);
            self.retry_with("rename temp", false, move || tokio::fs::rename(from, to))
                .await
        };
        match renamed {
            Ok(()) => {}
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::TimedOut => {
                tokio::time::sleep(self.retry.delay(0)).await;
                let temp_left = tokio::fs::try_exists(&temp).await.unwrap_or(true);
                let live_there = tokio::fs::try_exists(&live).await.unwrap_or(false);
                if temp_left || !live_there {
                    return Err(StorageError::io("rename temp", source));
                }
                tracing::warn!(%slot, "rename timed out but completed");
            }
            Err(e) => return Err(e),
        }
        self.sync_dir().await;
        Ok(())
    }

    pub async fn discard_temp(&self, slot: &SlotId) -> Result<(), StorageError> {
        self.remove_if_exists("discard temp", &self.temp_path(slot))
            .await
            .map(|_| ())
    }

    /// Back up the live slot if any, then write atomically.
    pub async fn write(&self, slot: &SlotId, bytes: &[u8]) -> Result<Option<PathBuf>, StorageError> {
        self.ensure_dir().await?;
        let backup = self.backup(slot).await?;
        let written = async {
            self.write_temp(slot, bytes).await?;
            self.commit(slot).await
        }
        .await;
        match written {
            Ok(()) => {
                if let Err(e) = self.prune_backups(slot).await {
                    tracing::warn!(%slot, error = %e, "failed to prune backups");
                }
                Ok(backup)
            }
            Err(e) => {
                if let Err(cleanup) = self.discard_temp(slot).await {
                    tracing::warn!(%slot, error = %cleanup, "failed to discard temp file");
                }
                if backup.is_some() {
                    if let Err(undo) = self.drop_latest_backup(slot).await {
                        tracing::warn!(%slot, error = %undo, "failed to undo backup rotation");
                    }
                }
                Err(e)
            }
        }
    }

    /// Remove a slot with its temp file and every backup. Returns whether
    /// the live slot existed.
    pub async fn delete(&self, slot: &SlotId) -> Result<bool, StorageError> {
        let existed = self
            .remove_if_exists("delete slot", &self.slot_path(slot))
            .await?;
        self.discard_temp(slot).await?;

        let prefix = format!("{slot}.{SAVE_EXTENSION}.");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(existed),
            Err(e) => return Err(StorageError::io("delete backups", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("delete backups", e))?
        {
            let is_backup = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .is_some_and(is_backup_suffix);
            if is_backup {
                self.remove_if_exists("delete backup", &entry.path()).await?;
            }
        }
        self.sync_dir().await;
        if existed {
            tracing::info!(%slot, "slot deleted");
        }
        Ok(existed)
    }

    /// Copy a slot's file to `dest`. Returns the number of bytes copied.
    pub async fn export(&self, slot: &SlotId, dest: &Path) -> Result<u64, StorageError> {
        let live = self.slot_path(slot);
        if !self.exists(slot).await? {
            return Err(StorageError::NotFound(slot.to_string()));
        }
        let (from, to) = (&live, dest);
        self.retry_io("export slot", move || tokio::fs::copy(from, to))
            .await
    }

    /// Copy an external file into a slot after checking it looks like a save.
    pub async fn import(&self, src: &Path, slot: &SlotId) -> Result<(), StorageError> {
        let bytes = match self.retry_io("read import", move || tokio::fs::read(src)).await {
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(src.display().to_string()));
            }
            other => other?,
        };
        format::split(&bytes).map_err(|e| StorageError::NotASaveFile(src.to_path_buf(), e))?;
        self.write(slot, &bytes).await?;
        tracing::info!(%slot, src = %src.display(), "save imported");
        Ok(())
    }

    async fn shift_backups_down(&self, slot: &SlotId) -> Result<(), StorageError> {
        for n in 2..=self.max_backups + 1 {
            let from = self.backup_path(slot, n);
            let to = self.backup_path(slot, n - 1);
            self.rename_if_exists("shift backup", &from, &to).await?;
        }
        Ok(())
    }

    async fn read_prefix(&self, path: &Path, limit: usize) -> Result<Vec<u8>, StorageError> {
        self.retry_io("read header", move || async move {
            let file = tokio::fs::File::open(path).await?;
            let mut buf = Vec::with_capacity(limit);
            file.take(limit as u64).read_to_end(&mut buf).await?;
            Ok(buf)
        })
        .await
    }

    async fn write_synced(
        &self,
        op: &'static str,
        path: &Path,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.retry_io(op, move || async move {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await
        })
        .await
    }

    async fn remove_if_exists(&self, op: &'static str, path: &Path) -> Result<bool, StorageError> {
        self.retry_io(op, move || async move {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn rename_if_exists(
        &self,
        op: &'static str,
        from: &Path,
        to: &Path,
    ) -> Result<bool, StorageError> {
        self.retry_io(op, move || async move {
            match tokio::fs::rename(from, to).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn sync_dir(&self) {
        if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
            let _ = dir.sync_all().await;
        }
    }

    async fn retry_io<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        self.retry_with(op, true, call).await
    }

    async fn retry_with<T, F, Fut>(
        &self,
        op: &'static str,
        retry_timeouts: bool,
        mut call: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(self.retry.timeout(), call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) if !retry_timeouts => {
                    let err = io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out"));
                    return Err(StorageError::io(op, err));
                }
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out")),
            };
            attempt += 1;
            if attempt >= attempts || !is_transient(&err) {
                return Err(StorageError::io(op, err));
            }
            let delay = self.retry.delay(attempt - 1);
            tracing::warn!(op, attempt, error = %err, ?delay, "transient I/O error, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

/// `bak.<n>` or `v<major>_<minor>.bak`.
fn is_backup_suffix(rest: &str) -> bool {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if let Some(n) = rest.strip_prefix("bak.") {
        return digits(n);
    }
    rest.strip_prefix('v')
        .and_then(|r| r.strip_suffix(".bak"))
        .and_then(|r| r.split_once('_'))
        .is_some_and(|(major, minor)| digits(major) && digits(minor))
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ResourceBusy
    )
}
