//! varstore CLI
//!
//! Inspect and edit persisted variables through the same storage engine a
//! running instance uses.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use varstore::{
    MemoryRegistry, SerializedRecord, SerializedValue, StorageConfig, StorageSet, StoragesConfig,
};

#[derive(Parser)]
#[command(name = "varstore")]
#[command(about = "Persistent variable storage CLI")]
#[command(version)]
struct Cli {
    /// Storage configuration file (TOML)
    #[arg(short, long, env = "VARSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, used when no configuration file is given
    #[arg(
        long,
        env = "VARSTORE_DB_PATH",
        default_value = "~/.local/share/varstore/variables.db"
    )]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List variables
    List {
        /// Only elements of this list (prefix of `prefix::*`)
        prefix: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one variable
    Get {
        name: String,
    },
    /// Set a variable
    Set {
        name: String,
        /// Type tag
        r#type: String,
        /// Payload as hex
        payload: String,
    },
    /// Delete a variable
    Unset {
        name: String,
    },
    /// Back up file-based storages
    Backup {
        /// Only this storage
        storage: Option<String>,
    },
    /// Show configured storages
    Storages,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let configs = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
            StoragesConfig::from_file(&path)
                .with_context(|| format!("reading {}", path.display()))?
                .storage
        }
        None => vec![StorageConfig::sqlite("default", cli.db_path.clone())],
    };

    let registry = Arc::new(MemoryRegistry::new());
    let set = StorageSet::load(&configs, registry.clone());
    if set.is_empty() {
        bail!("no storage could be loaded");
    }

    let result = run(cli.command, &set, &registry);
    set.close();
    result
}

fn run(command: Commands, set: &StorageSet, registry: &MemoryRegistry) -> anyhow::Result<()> {
    match command {
        Commands::List { prefix, json } => {
            let variables = match prefix {
                Some(prefix) => registry.list(&prefix),
                None => registry.snapshot(),
            };

            if json {
                let entries: Vec<serde_json::Value> = variables
                    .iter()
                    .map(|(name, value)| {
                        serde_json::json!({
                            "name": name,
                            "type": value.type_tag,
                            "payload": hex::encode(&value.payload),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for (name, value) in variables {
                    println!("{} [{}] {}", name, value.type_tag, hex::encode(&value.payload));
                }
            }
        }

        Commands::Get { name } => match registry.get(&name) {
            Some(value) => {
                let source = registry.source_of(&name).unwrap_or_default();
                println!(
                    "{} [{}] {} (storage: {})",
                    name,
                    value.type_tag,
                    hex::encode(&value.payload),
                    source
                );
            }
            None => bail!("variable '{}' is not set", name),
        },

        Commands::Set {
            name,
            r#type,
            payload,
        } => {
            let payload = hex::decode(payload.trim()).context("payload must be hex")?;
            let record = SerializedRecord::value(name.clone(), SerializedValue::new(r#type, payload));
            if !set.save(record) {
                bail!("no storage accepts variable '{}'", name);
            }
            println!("Set {}", name);
        }

        Commands::Unset { name } => {
            if !registry.contains(&name) {
                bail!("variable '{}' is not set", name);
            }
            if !set.save(SerializedRecord::tombstone(name.clone())) {
                bail!("no storage accepts variable '{}'", name);
            }
            println!("Deleted {}", name);
        }

        Commands::Backup { storage } => {
            let targets: Vec<_> = match &storage {
                Some(name) => vec![set
                    .get(name)
                    .with_context(|| format!("unknown storage '{}'", name))?],
                None => set
                    .storages()
                    .iter()
                    .filter(|s| s.backing_file().is_some())
                    .collect(),
            };

            for engine in targets {
                let path = engine.backup_now()?;
                println!("{}: {}", engine.name(), path.display());
            }
        }

        Commands::Storages => {
            for engine in set.storages() {
                let config = engine.config();
                println!(
                    "{} ({}) table={} pattern={} monitor={} state={:?}",
                    engine.name(),
                    config.backend.engine(),
                    config.table,
                    config.pattern.as_deref().unwrap_or(".*"),
                    config.monitor_changes,
                    engine.connection_state()
                );
            }
            for (name, error) in set.failures() {
                println!("{} FAILED: {}", name, error);
            }
        }
    }

    Ok(())
}
