use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tillslip_core::Config;
use tillslip_ocr::{default_backend, GeminiModel, OcrBackend, ReceiptPipeline};
use tokio::sync::mpsc;

mod intake;
mod store;
mod watch;

use intake::Intake;
use store::ReceiptStore;

/// Give writers a moment to finish before a newly created file is read.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

type AppIntake = Intake<Box<dyn OcrBackend>, GeminiModel>;

#[derive(Parser)]
#[command(name = "tillslip")]
#[command(about = "Turn receipt photos into structured records")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one receipt image and print the stored record
    Scan {
        /// Image file to process
        file: PathBuf,
        /// User the record belongs to
        #[arg(short, long)]
        user: String,
    },
    /// Watch a folder and extract every image dropped into it
    Watch {
        #[arg(short, long)]
        user: String,
        /// Folder to watch (defaults to <data dir>/intake)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Print a stored record
    Show {
        id: uuid::Uuid,
    },
    /// Print stored records, oldest first
    List {
        /// Only records belonging to this user
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dirs = directories::ProjectDirs::from("com", "tillslip", "Tillslip");

    let config_path = match (&cli.config, &project_dirs) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(dirs)) => Some(dirs.config_dir().join("config.toml")),
        (None, None) => None,
    };
    let loaded = match &config_path {
        Some(path) => Config::load(path)?,
        None => None,
    };
    let from_file = loaded.is_some();
    let config = loaded.unwrap_or_default().with_env_overrides();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    match (&config_path, from_file) {
        (Some(path), true) => tracing::debug!("Loaded config from {}", path.display()),
        (Some(path), false) => tracing::debug!("No config at {}, using defaults", path.display()),
        (None, _) => tracing::debug!("No config directory available, using defaults"),
    }

    let data_dir = match (&config.storage.data_dir, &project_dirs) {
        (Some(dir), _) => dir.clone(),
        (None, Some(dirs)) => dirs.data_dir().to_path_buf(),
        (None, None) => anyhow::bail!("No data directory configured and no home directory found"),
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    match cli.command {
        Commands::Scan { file, user } => {
            let intake = build_intake(&config, &data_dir)?;
            let record = intake.ingest_file(&user, &file).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Watch { user, dir } => {
            let dir = dir.unwrap_or_else(|| data_dir.join("intake"));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create intake directory {}", dir.display()))?;
            let intake = build_intake(&config, &data_dir)?;
            watch_folder(&intake, &user, &dir).await?;
        }
        Commands::Show { id } => {
            let record = ReceiptStore::new(&data_dir).load_record(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { user } => {
            let records = ReceiptStore::new(&data_dir).list_records(user.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn build_intake(config: &Config, data_dir: &Path) -> Result<AppIntake> {
    let recognizer = default_backend(&config.ocr);
    let model = GeminiModel::from_config(&config.model).context("Failed to set up model client")?;
    let pipeline = ReceiptPipeline::with_timeout(recognizer, model, config.model.timeout());
    Ok(Intake::new(pipeline, ReceiptStore::new(data_dir)))
}

async fn watch_folder(intake: &AppIntake, user: &str, dir: &Path) -> Result<()> {
    // The channel bridges the notify watcher thread and the async processor.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    // The watcher must be kept alive for as long as we process events.
    let _watcher = watch::spawn_intake_watcher(dir, tx)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    tracing::info!("Watching intake folder: {}", dir.display());

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(path) = received else { break };
                tokio::time::sleep(SETTLE_DELAY).await;
                tracing::info!("Processing receipt: {}", path.display());
                match intake.ingest_file(user, &path).await {
                    Ok(record) => println!("{}", serde_json::to_string(&record)?),
                    Err(e) => tracing::warn!("Receipt intake error for {}: {e}", path.display()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watcher");
                break;
            }
        }
    }
    Ok(())
}
