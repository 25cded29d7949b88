//! FeatureGuard admin CLI — inspect and maintain a ledger offline.
//!
//! The pipeline itself embeds into a host process that owns the detector and
//! region backend; this binary is operational glue for the persistent state:
//!
//! ```bash
//! featureguard --ledger ./data status
//! featureguard --ledger ./data features "minecraft:*" --unregioned
//! featureguard --config guard.toml rules
//! featureguard --ledger ./data scanned overworld
//! featureguard --ledger ./data clear-scanned overworld
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use featureguard::types::{unpack_cell_key, CellPos};
use featureguard::{GuardConfig, Ledger};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "featureguard")]
#[command(about = "FeatureGuard ledger and rule inspection")]
#[command(version)]
struct CliArgs {
    /// Path to the ledger directory
    #[arg(long, default_value = "featureguard-data")]
    ledger: PathBuf,

    /// Path to the guard config TOML (for rule commands)
    #[arg(long, default_value = "guard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ledger counts and on-disk size
    Status,
    /// List ledgered features matching a glob pattern
    Features {
        #[arg(default_value = "*")]
        pattern: String,
        /// Only features lacking a region
        #[arg(long)]
        unregioned: bool,
    },
    /// Show the rules defined in the config file
    Rules,
    /// List the scanned-cell records for a world
    Scanned { world: String },
    /// Remove all scanned-cell records for a world (forces reprocessing)
    ClearScanned { world: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Status => {
            let ledger = open_ledger(&args.ledger)?;
            println!("features ledgered: {}", ledger.feature_count());
            println!("features regioned: {}", ledger.regioned_count()?);
            println!("feature types:     {}", ledger.feature_types()?.len());
            println!("size on disk:      {} bytes", ledger.size_on_disk());
        }
        Command::Features {
            pattern,
            unregioned,
        } => {
            let ledger = open_ledger(&args.ledger)?;
            let records = ledger.features_matching(&pattern, unregioned)?;
            if records.is_empty() {
                println!("no features match '{pattern}'");
                return Ok(());
            }
            for record in &records {
                let region = record.region_id.as_deref().unwrap_or("-");
                println!(
                    "{}  {},{}  world={}  region={}",
                    record.feature.feature_type,
                    record.feature.x,
                    record.feature.z,
                    record.feature.world,
                    region
                );
            }
            println!("{} feature(s)", records.len());
        }
        Command::Rules => {
            let config = GuardConfig::load(&args.config)
                .with_context(|| format!("loading {}", args.config.display()))?;
            let table = config.build_rule_table()?;
            if table.is_empty() {
                println!("no rules defined");
                return Ok(());
            }
            for rule in table.iter() {
                println!(
                    "{}  enabled={}  priority={}  radius={}  y={}..{}",
                    rule.pattern, rule.enabled, rule.priority, rule.radius, rule.y_min, rule.y_max
                );
            }
        }
        Command::Scanned { world } => {
            let ledger = open_ledger(&args.ledger)?;
            let keys = ledger.scanned_cells(&world)?;
            if keys.is_empty() {
                println!("no scanned cells recorded for '{world}'");
                return Ok(());
            }
            let mut cells: Vec<CellPos> = keys.into_iter().map(unpack_cell_key).collect();
            cells.sort_by_key(|cell| (cell.x, cell.z));
            for cell in &cells {
                println!("{},{}", cell.x, cell.z);
            }
            println!("{} cell(s)", cells.len());
        }
        Command::ClearScanned { world } => {
            let ledger = open_ledger(&args.ledger)?;
            let removed = ledger.clear_scanned_cells(&world)?;
            if removed == 0 {
                println!("no scanned cells recorded for '{world}'");
            } else {
                println!("cleared {removed} scanned cell(s) for '{world}'");
            }
        }
    }
    Ok(())
}

fn open_ledger(path: &PathBuf) -> Result<Ledger> {
    Ledger::open(path).with_context(|| format!("opening ledger at {}", path.display()))
}
