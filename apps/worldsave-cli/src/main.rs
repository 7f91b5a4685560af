use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::Vec3;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use worldsave_common::Transform;
use worldsave_ecs::{Health, Inventory, Name, Owner, Placement, Velocity};
use worldsave_kernel::World;
use worldsave_persist::{
    PersistConfig, PlayerProgress, SaveMetadata, SaveOrchestrator, SaveRequest, SlotId,
    StorageBackend,
};

#[derive(Parser)]
#[command(name = "worldsave-cli", about = "Inspect and manage worldsave slots")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Save directory, overriding the config
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective configuration
    Info,
    /// List save slots (header-only read)
    List,
    /// Show the header of one slot
    Show { slot: String },
    /// Full integrity check of a slot
    Verify { slot: String },
    /// Save a generated demo world
    Save {
        slot: String,
        /// Number of creatures to spawn
        #[arg(short, long, default_value = "5")]
        entities: usize,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Autosave a generated demo world to the next rotating slot
    Autosave {
        #[arg(short, long, default_value = "5")]
        entities: usize,
    },
    /// Load a slot into an empty world and summarize it
    Load { slot: String },
    /// Delete a slot and its backups
    Delete { slot: String },
    /// Copy a slot out to a file
    Export { slot: String, dest: PathBuf },
    /// Copy a save file into a slot
    Import { src: PathBuf, slot: String },
    /// Put the newest backup of a slot back in place
    RestoreBackup { slot: String },
}

#[derive(Serialize)]
struct LoadSummary {
    slot: String,
    entities: usize,
    named: Vec<String>,
    chapter: u32,
    migrated_from: Option<String>,
    warnings: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => PersistConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PersistConfig::default(),
    };
    if let Some(dir) = &cli.dir {
        config.save_dir = dir.clone();
    }

    let registry = Arc::new(worldsave_ecs::builtin_registry()?);
    let migrator = Arc::new(worldsave_ecs::builtin_migrator()?);
    let orch = SaveOrchestrator::new(config.clone(), registry).with_migrator(migrator);

    match cli.command {
        Commands::Info => {
            println!("worldsave-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("format: {}", worldsave_common::FormatVersion::CURRENT);
            println!("save dir: {}", config.save_dir.display());
            println!(
                "backups per slot: {}, autosave slots: {}, compression: {}",
                config.max_backups_per_slot, config.max_auto_save_slots, config.compression_level
            );
        }
        Commands::List => {
            let slots = orch.list_save_slots().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&slots)?);
            } else if slots.is_empty() {
                println!("no saves in {}", config.save_dir.display());
            } else {
                for s in &slots {
                    println!(
                        "{:<24} {:>8} B  v{:<5} {:>6} entities  {}",
                        s.slot_id.as_str(),
                        s.size_bytes,
                        s.format_version.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
                        s.entity_count.map(|n| n.to_string()).unwrap_or_else(|| "?".into()),
                        s.description.as_deref().unwrap_or("<unreadable header>"),
                    );
                }
            }
        }
        Commands::Show { slot } => {
            let storage = StorageBackend::from_config(&config);
            let info = storage.info(&SlotId::parse(&slot)?).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("slot:         {}", info.slot_id);
                println!("file:         {}", info.file_path.display());
                println!("size:         {} bytes", info.size_bytes);
                if let Some(v) = info.format_version {
                    println!("format:       {v}");
                }
                if let Some(at) = info.saved_at {
                    println!("saved at:     {at}");
                }
                if let Some(n) = info.entity_count {
                    println!("entities:     {n}");
                }
                println!("description:  {}", info.description.unwrap_or_default());
            }
        }
        Commands::Verify { slot } => {
            let result = orch.verify_save_integrity(&slot).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.is_valid {
                println!("{slot}: OK");
            } else {
                for e in &result.errors {
                    println!("{slot}: {e}");
                }
            }
            if !result.is_valid {
                bail!("{slot} failed verification");
            }
        }
        Commands::Save {
            slot,
            entities,
            description,
        } => {
            let world = demo_world(entities);
            let request = SaveRequest::new(&world)
                .progress(demo_progress())
                .metadata(SaveMetadata::described(description));
            let result = orch.save_game(&slot, request).await;
            report_save(&result, cli.json)?;
        }
        Commands::Autosave { entities } => {
            let world = demo_world(entities);
            let request = SaveRequest::new(&world)
                .progress(demo_progress())
                .description("autosave");
            let result = orch.auto_save(request).await;
            report_save(&result, cli.json)?;
        }
        Commands::Load { slot } => {
            let mut world = World::new();
            let result = orch.load_game(&slot, &mut world).await;
            if let Some(err) = &result.error {
                bail!("load failed: {}: {}", err.code, err.message);
            }
            let mut named: Vec<String> = world
                .entity_ids()
                .into_iter()
                .filter_map(|id| world.get::<Name>(id).map(|n| n.0.clone()))
                .collect();
            named.sort();
            let summary = LoadSummary {
                slot,
                entities: result.entities_restored,
                named,
                chapter: result.progress.as_ref().map_or(0, |p| p.chapter),
                migrated_from: result.migrated_from.map(|v| v.to_string()),
                warnings: result.warnings,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "{}: {} entities, chapter {}",
                    summary.slot, summary.entities, summary.chapter
                );
                if let Some(from) = &summary.migrated_from {
                    println!("migrated from format {from}");
                }
                for w in &summary.warnings {
                    println!("warning: {w}");
                }
            }
        }
        Commands::Delete { slot } => {
            if orch.delete_save(&slot).await {
                println!("deleted {slot}");
            } else {
                bail!("{slot} does not exist or could not be deleted");
            }
        }
        Commands::Export { slot, dest } => {
            let result = orch.export_save(&slot, &dest).await;
            report_operation(&result, &format!("exported {slot} to {}", dest.display()))?;
        }
        Commands::Import { src, slot } => {
            let result = orch.import_save(&src, &slot).await;
            report_operation(&result, &format!("imported {} into {slot}", src.display()))?;
        }
        Commands::RestoreBackup { slot } => {
            let result = orch.restore_backup(&slot).await;
            report_operation(&result, &format!("restored {slot} from its newest backup"))?;
        }
    }

    Ok(())
}

fn report_save(result: &worldsave_persist::SaveResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if result.success {
        println!(
            "saved {} ({} entities, {} bytes, sha256 {})",
            result.slot_id,
            result.entity_count,
            result.bytes_written,
            result.checksum.as_deref().unwrap_or("-")
        );
    }
    for w in &result.warnings {
        tracing::warn!("{w}");
    }
    if let Some(err) = &result.error {
        bail!("save failed ({:?}): {}: {}", result.state, err.code, err.message);
    }
    Ok(())
}

fn report_operation(result: &worldsave_persist::OperationResult, done: &str) -> anyhow::Result<()> {
    match &result.error {
        Some(err) => bail!("{}: {}", err.code, err.message),
        None => {
            println!("{done}");
            Ok(())
        }
    }
}

/// A player, a companion owned by the player, and `creatures` wanderers.
fn demo_world(creatures: usize) -> World {
    let mut world = World::new();
    let player = world.spawn();
    world.insert(player, Name("player".into()));
    world.insert(player, Health::full(100));
    world.insert(player, Placement(Transform::default()));
    let mut bag = Inventory::default();
    bag.add("potion", 3);
    bag.add("torch", 1);
    world.insert(player, bag);

    let companion = world.spawn();
    world.insert(companion, Name("companion".into()));
    world.insert(companion, Owner(player));
    world.insert(companion, Health::full(60));

    for i in 0..creatures {
        let id = world.spawn();
        world.insert(
            id,
            Placement(Transform {
                position: Vec3::new(i as f32 * 2.0, 0.0, 0.0),
                ..Transform::default()
            }),
        );
        world.insert(id, Velocity(Vec3::new(0.0, 0.0, 1.0)));
    }
    world
}

fn demo_progress() -> PlayerProgress {
    let mut progress = PlayerProgress {
        play_time_secs: 3_600,
        chapter: 1,
        ..PlayerProgress::default()
    };
    progress.flags.insert("tutorial_done".into());
    progress.counters.insert("gold".into(), 250);
    progress
}
