//! Tiered Blobs CLI
//!
//! Entry point for the `tiered-blobs` command-line tool.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tiered_blobs::cache::SizeBudgetTracker;
use tiered_blobs::remote::S3Settings;
use tiered_blobs::{
    archive_blobs, ArchiveOptions, BlobKey, BlobStorage, EvictionWorker, FileBlobStorage,
    ObjectStoreRemote, TieredConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "tiered-blobs")]
#[command(about = "Read-through tiered blob storage", version)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload aged blobs from a primary blob directory to a bucket
    Archive {
        /// Primary blob directory
        blob_dir: PathBuf,

        /// Destination bucket
        bucket: String,

        /// Only archive blobs at least this many days old
        #[arg(long, default_value_t = 1)]
        age: u64,

        /// Only archive blobs at least this many bytes
        #[arg(long, default_value_t = 0)]
        size: u64,

        /// Delete local copies once archived
        #[arg(long)]
        destroy: bool,

        #[arg(long)]
        region: Option<String>,

        /// Custom endpoint URL (e.g. for MinIO)
        #[arg(long)]
        endpoint: Option<String>,

        /// Use `<remote-root>/<bucket>` on the local filesystem instead of S3
        #[arg(long)]
        remote_root: Option<PathBuf>,
    },

    /// Load one blob through the tiered store and print its local path
    Fetch {
        /// Path to tiered store config file
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Object id (hex, optional 0x prefix)
        oid: String,

        /// Revision serial (hex, optional 0x prefix)
        serial: String,
    },

    /// Run one eviction pass over the cache directory
    Evict {
        /// Path to tiered store config file
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Archive {
            blob_dir,
            bucket,
            age,
            size,
            destroy,
            region,
            endpoint,
            remote_root,
        } => {
            let settings = S3Settings {
                bucket,
                region,
                endpoint,
                ..Default::default()
            }
            .with_env_credentials();
            let opts = ArchiveOptions {
                min_size: size,
                destroy,
                ..Default::default()
            }
            .with_min_age_days(age);
            run_archive(blob_dir, settings, remote_root, opts);
        }
        Commands::Fetch {
            config,
            oid,
            serial,
        } => {
            run_fetch(config, &oid, &serial);
        }
        Commands::Evict { config } => {
            run_evict(config);
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tiered_blobs=info")),
        1 => EnvFilter::new("tiered_blobs=debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn run_archive(
    blob_dir: PathBuf,
    settings: S3Settings,
    remote_root: Option<PathBuf>,
    opts: ArchiveOptions,
) {
    let primary = match FileBlobStorage::open(&blob_dir) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error opening blob directory {}: {}", blob_dir.display(), e);
            process::exit(1);
        }
    };

    let remote = match remote_root {
        Some(root) => ObjectStoreRemote::local(&root.join(&settings.bucket)),
        None => ObjectStoreRemote::s3(&settings),
    };
    let remote = match remote {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error opening bucket {}: {}", settings.bucket, e);
            process::exit(1);
        }
    };

    match archive_blobs(&primary, &remote, &opts) {
        Ok(summary) => {
            print_json(&summary);
            if !summary.errors.is_empty() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Archive failed: {}", e);
            process::exit(1);
        }
    }
}

fn run_fetch(config_path: PathBuf, oid: &str, serial: &str) {
    let key = match BlobKey::parse(oid, serial) {
        Some(k) => k,
        None => {
            eprintln!("Invalid blob key: {} {}", oid, serial);
            process::exit(2);
        }
    };

    let store = match load_config(&config_path).open() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening tiered store: {}", e);
            process::exit(1);
        }
    };

    let result = store.load_blob(&key);
    let _ = store.close();
    match result {
        Ok(path) => println!("{}", path.display()),
        Err(e) => {
            eprintln!("Error loading {}: {}", key, e);
            process::exit(1);
        }
    }
}

fn run_evict(config_path: PathBuf) {
    let config = load_config(&config_path);
    let Some(limit) = config.cache_limit() else {
        eprintln!("Cache is unlimited; nothing to evict");
        return;
    };

    let target = SizeBudgetTracker::new(Some(limit)).target().unwrap_or(0);
    let worker = EvictionWorker::new(&config.cache_dir, target);
    match worker.run() {
        Ok(Some(report)) => print_json(&report),
        Ok(None) => {
            eprintln!("Another eviction is already running");
        }
        Err(e) => {
            eprintln!("Eviction failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_config(path: &Path) -> TieredConfig {
    match TieredConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}
