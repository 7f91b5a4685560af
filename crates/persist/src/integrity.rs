//! Checksums and pre-save validation.
//!
//! Independent of codec internals: works on raw bytes and on the decoded
//! snapshot structure only.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use worldsave_common::LocalId;

use crate::error::IntegrityIssue;
use crate::mods::ModRegistry;
use crate::snapshot::{Snapshot, WorldState};

/// SHA-256 digest of `data`.
pub fn checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Recompute the digest of `data` and compare with `expected`.
pub fn verify(data: &[u8], expected: &[u8; 32]) -> bool {
    checksum(data) == *expected
}

/// Lowercase hex rendering of a digest.
pub fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_issues(issues: &[IntegrityIssue]) -> Self {
        Self {
            is_valid: issues.is_empty(),
            errors: issues.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
        }
    }
}

/// Structural problems inside a world state: duplicate local ids, records
/// that disagree with their archetype, and references to missing entities.
pub fn world_issues(world: &WorldState) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    let mut seen: BTreeSet<LocalId> = BTreeSet::new();
    let mut type_sets: BTreeSet<&BTreeSet<String>> = BTreeSet::new();
    for archetype in &world.archetypes {
        if !type_sets.insert(&archetype.component_types) {
            issues.push(IntegrityIssue::DuplicateArchetype(archetype.sort_key()));
        }
        for entity in &archetype.entities {
            if !seen.insert(entity.local_id) {
                issues.push(IntegrityIssue::DuplicateLocalId(entity.local_id));
            }
            if !entity.components.keys().eq(archetype.component_types.iter()) {
                issues.push(IntegrityIssue::ArchetypeMismatch {
                    entity: entity.local_id,
                });
            }
        }
    }
    for entity in world.entities() {
        for target in &entity.references {
            if !seen.contains(target) {
                issues.push(IntegrityIssue::DanglingReference {
                    entity: entity.local_id,
                    target: *target,
                });
            }
        }
    }
    issues
}

/// Reject snapshots with dangling references or unregistered mod blocks.
///
/// Pure: never touches storage or the snapshot.
pub fn validate_before_save(snapshot: &Snapshot, mods: &ModRegistry) -> ValidationResult {
    let mut issues = world_issues(snapshot.world());
    for mod_id in snapshot.mod_data().keys() {
        if !mods.contains(mod_id) {
            issues.push(IntegrityIssue::UnregisteredMod(mod_id.to_string()));
        }
    }
    if !issues.is_empty() {
        tracing::debug!(issues = issues.len(), "snapshot failed validation");
    }
    ValidationResult::from_issues(&issues)
}
