//! agentsnap CLI - Inspect and maintain snapshot cases

use agentsnap_core::config::SnapshotConfig;
use agentsnap_core::normalize::{Normalizer, PayloadKind};
use agentsnap_core::store::{FsSnapshotStore, SnapshotStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agentsnap")]
#[command(about = "Snapshot testing for LLM agent loops", long_about = None)]
#[command(version)]
struct Cli {
    /// Snapshot directory (defaults to the loaded configuration)
    #[arg(short, long, global = true, env = "AGENTSNAP_SNAPSHOT_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recorded cases
    Cases,
    /// Show the records of a case
    Show {
        /// Case name
        case: String,
        /// Only show this loop
        #[arg(short, long = "loop")]
        loop_index: Option<usize>,
    },
    /// Remove transient actual-* artifacts of a case
    Clean {
        /// Case name
        case: String,
    },
    /// Normalize a JSON payload with the configured rules
    Normalize {
        /// Payload kind: request, response, event or tool_call
        kind: PayloadKind,
        /// JSON file to normalize
        file: PathBuf,
    },
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SnapshotConfig::load().context("loading configuration")?;
    if let Some(dir) = cli.dir {
        config = config.with_snapshot_dir(dir);
    }
    let store = FsSnapshotStore::new(&config.snapshot_dir);

    match cli.command {
        Commands::Version => {
            println!("agentsnap {}", env!("CARGO_PKG_VERSION"));
            println!("agentsnap-core {}", agentsnap_core::VERSION);
        }
        Commands::Cases => {
            let cases = store.list_cases()?;
            if cases.is_empty() {
                println!("No cases under {}", config.snapshot_dir.display());
            }
            for case in cases {
                let loops = store.count(&case)?;
                match store.read_manifest(&case)? {
                    Some(manifest) => println!(
                        "{:<32} {:>3} loops  {:<9}  recorded {}",
                        case,
                        loops,
                        manifest.mode,
                        manifest.recorded_at.format("%Y-%m-%d %H:%M:%S")
                    ),
                    None => println!("{:<32} {:>3} loops", case, loops),
                }
            }
        }
        Commands::Show { case, loop_index } => {
            let records = match loop_index {
                Some(index) => vec![store.read(&case, index)?],
                None => store.read_all(&case)?,
            };
            for record in records {
                println!("== {} loop {} ==", case, record.loop_index);
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        Commands::Clean { case } => {
            let removed = store.cleanup_transient(&case)?;
            tracing::info!(case = %case, removed = removed, "Cleaned transient artifacts");
            println!("Removed {} transient artifacts from {}", removed, case);
        }
        Commands::Normalize { kind, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", file.display()))?;
            let normalizer = Normalizer::new(config.normalizer.clone())?;
            let normalized = normalizer.normalize(kind, &payload);
            println!("{}", serde_json::to_string_pretty(&normalized)?);
        }
    }

    Ok(())
}
