//! Mount a remote object store as a local filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use remote_vfs::cache::CacheMode;

mod app_config;
mod fuse_check;
mod mount;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "A caching filesystem over remote object stores.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a remote-vfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the filesystem and serve it until interrupted.
    Mount {
        /// Override the configured cache mode: off, minimal, writes or full.
        #[arg(long)]
        cache_mode: Option<CacheMode>,

        /// Mount read-only regardless of the configuration.
        #[arg(long)]
        read_only: bool,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln until tracing is initialized.
    let mut config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    let command = args.command.unwrap_or(Command::Mount {
        cache_mode: None,
        read_only: false,
    });
    match command {
        Command::Mount {
            cache_mode,
            read_only,
        } => {
            if let Some(mode) = cache_mode {
                config.cache.mode = mode;
            }
            config.read_only |= read_only;
            if let Err(error_messages) = config.validate() {
                error!("Configuration is invalid.");
                for msg in &error_messages {
                    error!(" - {msg}");
                }
                std::process::exit(1);
            }

            if let Err(e) = fuse_check::ensure_fuse() {
                error!("{e}");
                std::process::exit(1);
            }

            debug!(config = ?config, "Mounting with configuration...");
            if let Err(e) = mount::spawn(config) {
                error!("Mount failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
