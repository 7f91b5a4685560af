//! Mod data compatibility.
//!
//! Mod blocks are opaque and versioned. A block is never partially merged:
//! it is kept verbatim, or replaced whole by the mod's upgrade function.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use worldsave_common::ModId;

use crate::snapshot::ModBlock;

/// Upgrades a whole block from `from_version` to the mod's current version.
pub type ModUpgradeFn = Arc<dyn Fn(u32, &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// A mod currently loaded by the game, with its data schema version.
#[derive(Clone)]
pub struct ModSchema {
    pub id: ModId,
    pub version: u32,
    upgrade: Option<ModUpgradeFn>,
}

impl ModSchema {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: ModId::new(id),
            version,
            upgrade: None,
        }
    }

    pub fn with_upgrade(
        mut self,
        upgrade: impl Fn(u32, &[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    ) -> Self {
        self.upgrade = Some(Arc::new(upgrade));
        self
    }
}

impl fmt::Debug for ModSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModSchema")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mod {0} registered twice")]
pub struct DuplicateMod(pub ModId);

/// Set of mods loaded in this session.
#[derive(Debug, Clone, Default)]
pub struct ModRegistry {
    mods: BTreeMap<ModId, ModSchema>,
}

impl ModRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ModSchema) -> Result<&mut Self, DuplicateMod> {
        if self.mods.contains_key(&schema.id) {
            return Err(DuplicateMod(schema.id));
        }
        self.mods.insert(schema.id.clone(), schema);
        Ok(self)
    }

    pub fn contains(&self, id: &ModId) -> bool {
        self.mods.contains_key(id)
    }

    pub fn get(&self, id: &ModId) -> Option<&ModSchema> {
        self.mods.get(id)
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    /// Compare saved blocks against the loaded mods.
    ///
    /// Returns the report and the mod data to hand back to the caller, with
    /// upgraded blocks replaced.
    pub fn check(
        &self,
        blocks: &BTreeMap<ModId, ModBlock>,
    ) -> (CompatibilityResult, BTreeMap<ModId, ModBlock>) {
        let mut report = CompatibilityResult::default();
        let mut out = BTreeMap::new();

        for (id, block) in blocks {
            let Some(schema) = self.mods.get(id) else {
                report
                    .warnings
                    .push(format!("mod {id} is not loaded; its data (v{}) is kept as-is", block.version));
                report.missing.push(id.clone());
                out.insert(id.clone(), block.clone());
                continue;
            };

            if block.version == schema.version {
                out.insert(id.clone(), block.clone());
            } else if block.version > schema.version {
                report.conflicts.push(ModConflictInfo {
                    mod_id: id.clone(),
                    saved_version: block.version,
                    loaded_version: schema.version,
                    reason: "save was written by a newer version of the mod".into(),
                });
                out.insert(id.clone(), block.clone());
            } else if let Some(upgrade) = &schema.upgrade {
                match run_upgrade(upgrade, block) {
                    Ok(bytes) => {
                        tracing::info!(mod_id = %id, from = block.version, to = schema.version, "mod data upgraded");
                        report.upgraded.push(id.clone());
                        out.insert(
                            id.clone(),
                            ModBlock {
                                version: schema.version,
                                bytes,
                            },
                        );
                    }
                    Err(reason) => {
                        report.conflicts.push(ModConflictInfo {
                            mod_id: id.clone(),
                            saved_version: block.version,
                            loaded_version: schema.version,
                            reason,
                        });
                        out.insert(id.clone(), block.clone());
                    }
                }
            } else {
                report.warnings.push(format!(
                    "mod {id} data is v{} but v{} is loaded and no upgrade is available; kept as-is",
                    block.version, schema.version
                ));
                report.outdated.push(id.clone());
                out.insert(id.clone(), block.clone());
            }
        }

        report.compatible = report.conflicts.is_empty();
        (report, out)
    }
}

fn run_upgrade(upgrade: &ModUpgradeFn, block: &ModBlock) -> Result<Vec<u8>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| upgrade(block.version, &block.bytes))) {
        Ok(result) => result,
        Err(_) => Err("upgrade function panicked".to_string()),
    }
}

/// A mod block that cannot be used with the loaded mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModConflictInfo {
    pub mod_id: ModId,
    pub saved_version: u32,
    pub loaded_version: u32,
    pub reason: String,
}

/// Result of comparing a save's mod data with the loaded mods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub compatible: bool,
    pub warnings: Vec<String>,
    pub missing: Vec<ModId>,
    pub outdated: Vec<ModId>,
    pub upgraded: Vec<ModId>,
    pub conflicts: Vec<ModConflictInfo>,
}
