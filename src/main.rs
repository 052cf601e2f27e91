//! azstore -- command-line access to a blob-backed file storage.
//!
//! Every subcommand maps onto one façade operation; the configuration comes
//! from a YAML file and `AZURE_*` environment variables.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use azstore::config::{load_config, Config, LoggingConfig};
use azstore::{AzureStorage, Timestamp};

/// Command-line arguments for azstore.
#[derive(Parser, Debug)]
#[command(
    name = "azstore",
    version,
    about = "File storage on Azure Blob Storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "azstore.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List directories and files under a path.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print size, modification time and URL of a file as JSON.
    Stat { name: String },
    /// Print the URL of a file.
    Url {
        name: String,
        /// Signature lifetime in seconds; 0 for an unsigned URL.
        #[arg(long)]
        expire: Option<u64>,
    },
    /// Upload a local file; prints the name it was stored under.
    Put {
        file: PathBuf,
        /// Storage name; defaults to the local file name.
        name: Option<String>,
    },
    /// Write a file's content to stdout.
    Cat { name: String },
    /// Delete a file.
    Rm { name: String },
    /// Exit with status 1 when a file does not exist.
    Exists { name: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn format_timestamp(t: &Timestamp) -> String {
    match t {
        Timestamp::Aware(t) => t.to_rfc3339(),
        Timestamp::Naive(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?
    } else {
        Config::default()
    };
    config.storage.apply_env_overrides()?;

    init_tracing(&config.logging);
    if cli.config.exists() {
        info!("Loaded configuration from {}", cli.config.display());
    } else {
        debug!(
            "{} not found, using defaults and environment",
            cli.config.display()
        );
    }

    let storage = AzureStorage::new(config.storage);

    match cli.command {
        Command::Ls { path } => {
            let (dirs, files) = storage.listdir(&path).await?;
            for dir in dirs {
                println!("{dir}/");
            }
            for file in files {
                println!("{file}");
            }
        }
        Command::Stat { name } => {
            let size = storage.size(&name).await?;
            let modified = storage.get_modified_time(&name).await?;
            let stat = serde_json::json!({
                "name": name,
                "blob_name": storage.valid_path(&name)?,
                "size": size,
                "modified": format_timestamp(&modified),
                "url": storage.url(&name, Some(0)).await?,
            });
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Command::Url { name, expire } => {
            println!("{}", storage.url(&name, expire).await?);
        }
        Command::Put { file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .context("cannot derive a storage name from the local path")?,
            };
            let mut source = std::fs::File::open(&file)
                .with_context(|| format!("opening {}", file.display()))?;
            let stored = storage.save(&name, &mut source, None).await?;
            println!("{stored}");
        }
        Command::Cat { name } => {
            let mut handle = storage.open(&name, "rb")?;
            let data = handle.read_to_end().await?;
            handle.close().await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Command::Rm { name } => {
            storage.delete(&name).await?;
        }
        Command::Exists { name } => {
            if !storage.exists(&name).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
