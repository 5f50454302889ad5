use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sealpack::{archiver, config, key_manager::KeyManager, SymmetricKey};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// sealpack - Compressed, authenticated encryption for directories, files and data
#[derive(Parser)]
#[command(name = "sealpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file and generate an encryption key
    Init {
        /// Config file to create
        #[arg(long, default_value = "sealpack.json")]
        config_out: String,

        /// Encryption key file path
        #[arg(short, long, default_value = "./sealpack.key")]
        key_path: String,
    },

    /// Encrypt the contents of a directory into one file
    EncryptDir {
        /// Directory to archive
        input: PathBuf,

        /// Encrypted archive (defaults to <input>.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract an encrypted archive into a directory
    DecryptDir {
        /// Encrypted archive
        input: PathBuf,

        /// Destination directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Encrypt a single file
    EncryptFile {
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypt a single file
    DecryptFile {
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Encrypt data read from stdin
    EncryptData {
        /// Encrypted output file
        output: PathBuf,
    },

    /// Decrypt data to stdout
    DecryptData {
        input: PathBuf,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=info,sealpack=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "sealpack starting");

    if let Commands::Init {
        config_out,
        key_path,
    } = &cli.command
    {
        return cmd_init(config_out, key_path).await;
    }

    let cfg = config::Config::load_with_env(cli.config.as_deref())?;
    let km = KeyManager::new(&cfg).await?;
    let key = km.key().clone();

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::EncryptDir { input, output } => {
            let output = output.unwrap_or_else(|| cfg.sealed_path(&input));
            let spinner = create_spinner(&format!("Encrypting {}...", input.display()));
            let (i, o) = (input.clone(), output.clone());
            blocking(move || archiver::encrypt_directory(&i, &o, &key)).await?;
            spinner.finish_with_message(format!("{} -> {}", input.display(), output.display()));
        }

        Commands::DecryptDir { input, output } => {
            let output = output.unwrap_or_else(|| cfg.unsealed_path(&input));
            let spinner = create_spinner(&format!("Extracting {}...", input.display()));
            let (i, o) = (input.clone(), output.clone());
            let entries = blocking(move || archiver::decrypt_directory(&i, &o, &key)).await?;
            spinner.finish_with_message(format!(
                "Extracted {} entries -> {}",
                entries,
                output.display()
            ));
        }

        Commands::EncryptFile { input, output } => {
            let output = output.unwrap_or_else(|| cfg.sealed_path(&input));
            let size = fs::metadata(&input)
                .await
                .with_context(|| format!("reading metadata for {:?}", input))?
                .len();
            let pb = create_progress_bar(size, "Encrypting");
            let (i, o) = (input.clone(), output.clone());
            let bytes = blocking(move || archiver::encrypt_file(&i, &o, &key)).await?;
            pb.set_position(size);
            pb.finish_with_message(format!("Encrypted {} bytes", bytes));
            println!("  {} -> {}", input.display(), output.display());
        }

        Commands::DecryptFile { input, output } => {
            let output = output.unwrap_or_else(|| cfg.unsealed_path(&input));
            // Decrypted size is unknown until the stream is consumed
            let spinner = create_spinner(&format!("Decrypting {}...", input.display()));
            let (i, o) = (input.clone(), output.clone());
            let bytes = blocking(move || archiver::decrypt_file(&i, &o, &key)).await?;
            spinner.finish_with_message(format!(
                "Decrypted {} bytes -> {}",
                bytes,
                output.display()
            ));
        }

        Commands::EncryptData { output } => {
            let mut data = Vec::new();
            io::stdin()
                .read_to_end(&mut data)
                .context("reading data from stdin")?;
            let len = data.len();
            let o = output.clone();
            blocking(move || archiver::encrypt_data(&data, &o, &key)).await?;
            eprintln!("Encrypted {} bytes -> {}", len, output.display());
        }

        Commands::DecryptData { input, output } => {
            let i = input.clone();
            let data = blocking(move || archiver::decrypt_data(&i, &key)).await?;
            match output {
                Some(path) => {
                    write_plain(&path, &data).await?;
                    eprintln!("Decrypted {} bytes -> {}", data.len(), path.display());
                }
                None => {
                    io::stdout().write_all(&data)?;
                    io::stdout().flush()?;
                    eprintln!("Decrypted {} bytes to stdout", data.len());
                }
            }
        }
    }

    Ok(())
}

/// Run a pipeline operation off the async runtime.
async fn blocking<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> sealpack::error::Result<T> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(op).await??;
    Ok(value)
}

async fn write_plain(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .await
        .with_context(|| format!("writing to {:?}", path))
}

/// Create a styled progress bar for file operations
fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Write a config file and generate an encryption key
async fn cmd_init(config_path: &str, key_path: &str) -> Result<()> {
    println!("Initializing sealpack...");

    let cfg = config::Config {
        key_path: key_path.to_string(),
        ..config::Config::default()
    };
    cfg.validate()?;

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    if fs::try_exists(key_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Key file '{}' already exists. Remove it first or use a different path.",
            key_path
        );
    }

    // KeyManager creates the key file when it is missing
    let km = KeyManager::new(&cfg).await?;
    let key: &SymmetricKey = km.key();

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:  {}", config_path);
    println!("Key:     {} ({} bits)", key_path, key.bit_count());
    println!();
    println!("IMPORTANT: Keep your key file secure and backed up!");
    println!("Without it, your encrypted files cannot be recovered.");

    Ok(())
}
