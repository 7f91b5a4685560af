//! Error types for every layer of the save pipeline, and the flat
//! [`ErrorCode`] taxonomy surfaced to callers in result objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use worldsave_common::{FormatVersion, LocalId};

/// Stable error codes reported in [`crate::SaveResult`] and [`crate::LoadResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // save
    InvalidState,
    SerializationFailed,
    WriteFailed,
    ValidationFailed,
    InsufficientSpace,
    PermissionDenied,
    BackupFailed,
    // load
    FileNotFound,
    CorruptedData,
    InvalidChecksum,
    UnsupportedVersion,
    MigrationFailed,
    ModConflict,
    RestoreError,
    // either
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Component codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown component type: {0}")]
    UnknownComponentType(String),
    #[error("component type registered twice: {0}")]
    DuplicateComponentType(String),
    #[error("value stored under {0} does not have the registered type")]
    TypeMismatch(String),
    #[error("failed to encode component {type_name}: {reason}")]
    Encode { type_name: String, reason: String },
    #[error("failed to decode component {type_name}: {reason}")]
    Decode { type_name: String, reason: String },
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("compression error: {0}")]
    Compression(#[from] io::Error),
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),
}

/// Failures reading the binary file framing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("file too short to hold a checksum ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic number {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("header truncated while reading {0}")]
    Truncated(&'static str),
    #[error("malformed varint in {0}")]
    BadVarint(&'static str),
    #[error("description is not valid UTF-8")]
    BadDescription,
}

/// Slot storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid slot id {id:?}: {reason}")]
    InvalidSlotId { id: String, reason: &'static str },
    #[error("slot {0} not found")]
    NotFound(String),
    #[error("IO error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a save file: {1}")]
    NotASaveFile(PathBuf, FormatError),
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl StorageError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Code for a failure while writing.
    pub fn write_code(&self) -> ErrorCode {
        match self {
            Self::InvalidSlotId { .. } => ErrorCode::InvalidState,
            Self::Io { source, .. } => match source.kind() {
                io::ErrorKind::StorageFull => ErrorCode::InsufficientSpace,
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                    ErrorCode::PermissionDenied
                }
                _ => ErrorCode::WriteFailed,
            },
            Self::NotFound(_) => ErrorCode::FileNotFound,
            Self::NotASaveFile(..) | Self::Format(_) => ErrorCode::CorruptedData,
        }
    }

    /// Code for a failure while reading.
    pub fn read_code(&self) -> ErrorCode {
        match self {
            Self::InvalidSlotId { .. } => ErrorCode::InvalidState,
            Self::NotFound(_) => ErrorCode::FileNotFound,
            Self::Io { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::CorruptedData,
            },
            Self::NotASaveFile(_, FormatError::TooShort(_)) | Self::Format(FormatError::TooShort(_)) => {
                ErrorCode::InvalidChecksum
            }
            Self::NotASaveFile(..) | Self::Format(_) => ErrorCode::CorruptedData,
        }
    }
}

/// Migration failures.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("a migration step {from} -> {to} is already registered")]
    DuplicateStep { from: FormatVersion, to: FormatVersion },
    #[error("no migration path from {from} to {to}")]
    NoPath { from: FormatVersion, to: FormatVersion },
    #[error("save format {found} is newer than supported format {current}")]
    FromFuture {
        found: FormatVersion,
        current: FormatVersion,
    },
    #[error("migration step {step:?} ({from} -> {to}) failed: {reason}")]
    StepFailed {
        step: String,
        from: FormatVersion,
        to: FormatVersion,
        reason: String,
    },
}

impl MigrationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateStep { .. } | Self::StepFailed { .. } => ErrorCode::MigrationFailed,
            Self::NoPath { .. } | Self::FromFuture { .. } => ErrorCode::UnsupportedVersion,
        }
    }
}

/// Integrity problems found in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityIssue {
    #[error("entity {entity} references missing entity {target}")]
    DanglingReference { entity: LocalId, target: LocalId },
    #[error("local id {0} is used more than once")]
    DuplicateLocalId(LocalId),
    #[error("archetype [{0}] appears more than once")]
    DuplicateArchetype(String),
    #[error("mod data block {0:?} has no registered schema")]
    UnregisteredMod(String),
    #[error("entity {entity} has components that do not match its archetype")]
    ArchetypeMismatch { entity: LocalId },
    #[error("component {type_name} failed to encode: {reason}")]
    CaptureFailed { type_name: String, reason: String },
}

/// A failed load, carrying the code reported to callers.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct LoadError {
    pub code: ErrorCode,
    pub message: String,
}

impl LoadError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<MigrationError> for LoadError {
    fn from(err: MigrationError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
