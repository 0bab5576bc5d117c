use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relayfs::config::Config;
use relayfs::fs::FileType;
use relayfs::worker::{self, Worker};
use relayfs::{Cache, Manager, RemoteFs, build_backend, load_config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relayfs")]
#[command(about = "Read remote object storage through a shared download worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Stream a remote file to stdout using ./relayfs cat --config relayfs.yaml /a.txt")]
    Cat {
        #[arg(long, value_name = "CONFIG")]
        config: String,
        #[arg(value_name = "PATH")]
        path: String,
    },
    #[command(about = "List a remote directory using ./relayfs ls --config relayfs.yaml /")]
    Ls {
        #[arg(long, value_name = "CONFIG")]
        config: String,
        #[arg(value_name = "PATH", default_value = "/")]
        path: String,
    },
    // Spawned by the manager; not meant to be run by hand.
    #[command(hide = true)]
    Worker {
        #[arg(long, value_name = "CONFIG")]
        config: String,
        #[arg(long, value_name = "FD")]
        control_fd: i32,
    },
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(config: &str) -> Result<(Config, PathBuf)> {
    let cfg = load_config(config)?;
    init_tracing(&cfg.log.filter);
    let path = std::fs::canonicalize(config)
        .with_context(|| format!("Failed to resolve config path {config}"))?;
    Ok((cfg, path))
}

async fn mount(cfg: &Config, config_path: &Path) -> Result<RemoteFs> {
    let backend = build_backend(&cfg.backend).await;
    let cache = Arc::new(Cache::new(backend, cfg.cache.metadata_capacity));
    let manager = Manager::spawn(cfg, Some(config_path), cache)
        .context("Failed to start download worker")?;
    Ok(RemoteFs::new(manager))
}

async fn cat(config: &str, path: &str) -> Result<()> {
    let (cfg, config_path) = load(config)?;
    let fs = mount(&cfg, &config_path).await?;
    let result = copy_to_stdout(&fs, path, cfg.download.chunk_size).await;
    fs.shutdown().await?;
    result
}

async fn copy_to_stdout(fs: &RemoteFs, path: &str, chunk: usize) -> Result<()> {
    let handle = fs
        .open(path, libc::O_RDONLY)
        .await
        .with_context(|| format!("Failed to open {path}"))?;
    let mut stdout = tokio::io::stdout();
    let mut offset = 0u64;
    loop {
        let data = fs.read(path, chunk, offset, handle).await?;
        if data.is_empty() {
            break;
        }
        stdout.write_all(&data).await?;
        offset += data.len() as u64;
    }
    stdout.flush().await?;
    fs.release(handle).await?;
    Ok(())
}

async fn ls(config: &str, path: &str) -> Result<()> {
    let (cfg, config_path) = load(config)?;
    let fs = mount(&cfg, &config_path).await?;
    let listing = fs
        .readdir(path)
        .await
        .with_context(|| format!("Failed to list {path}"));
    if let Ok(entries) = &listing {
        for entry in entries.iter().filter(|e| e.name != "." && e.name != "..") {
            match entry.kind {
                FileType::Dir => println!("{}/", entry.name),
                FileType::File => println!("{}", entry.name),
            }
        }
    }
    fs.shutdown().await?;
    listing.map(|_| ())
}

async fn run_worker(config: &str, control_fd: i32) -> Result<()> {
    let cfg = load_config(config)?;
    init_tracing(&cfg.log.filter);
    let backend = build_backend(&cfg.backend).await;
    let control = worker::control_from_fd(control_fd)
        .with_context(|| format!("Failed to adopt control descriptor {control_fd}"))?;
    Worker::new(control, backend, cfg.download).run().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Cat { config, path } => cat(&config, &path).await,
        Commands::Ls { config, path } => ls(&config, &path).await,
        Commands::Worker { config, control_fd } => run_worker(&config, control_fd).await,
    }
}
