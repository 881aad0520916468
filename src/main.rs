//! charmfs - Encrypted remote filesystem client
//!
//! Uploads, downloads and lists files on a Charm-style `/v1/fs` server with
//! client-side encryption.

use anyhow::Context;
use charmfs::{config::Config, crypto::KeyMaterial, fs::RemoteFs};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// charmfs - Encrypted remote filesystem client
#[derive(Parser, Debug)]
#[command(name = "charmfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "charmfs.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt and upload a local file
    Put { local: PathBuf, remote: String },
    /// Download, decrypt and print a remote file
    Cat { remote: String },
    /// List a remote directory
    Ls {
        #[arg(default_value = "")]
        dir: String,
    },
    /// Show metadata for a remote path
    Stat { remote: String },
    /// Remove a remote file
    Rm { remote: String },
    /// Remove an empty remote directory
    Rmdir { dir: String },
    /// Generate a new base64 master key
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides --log-level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Command::Keygen = args.command {
        println!("{}", KeyMaterial::generate_base64());
        return Ok(());
    }

    info!("Starting charmfs v{}", charmfs::VERSION);

    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {:?}", args.config))?;
    info!("Loaded configuration from {:?}", args.config);

    let fs = RemoteFs::from_config(&config)?;
    info!(root = %fs.root(), "Remote filesystem ready");
    let result = run(&fs, args.command).await;

    if args.print_metrics {
        eprintln!("{}", charmfs::metrics::gather_text());
    }

    result
}

async fn run(fs: &RemoteFs, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { local, remote } => {
            let file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("opening {:?}", local))?;
            let info = fs.put(&remote, file).await?;
            println!("{}\t{} bytes stored", info.remote, info.size);
        }
        Command::Cat { remote } => {
            let data = fs.open(&remote).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Command::Ls { dir } => {
            for entry in fs.list(&dir).await? {
                let kind = if entry.is_dir { "d" } else { "-" };
                let modified = entry
                    .mod_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{kind} {:>12} {modified} {}", entry.size, entry.remote);
            }
        }
        Command::Stat { remote } => {
            let info = fs.stat(&remote).await?;
            println!("{info:#?}");
        }
        Command::Rm { remote } => fs.remove(&remote).await?,
        Command::Rmdir { dir } => fs.rmdir(&dir).await?,
        Command::Keygen => println!("{}", KeyMaterial::generate_base64()),
    }

    Ok(())
}
