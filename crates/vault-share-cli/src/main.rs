mod commands;
mod engines;
mod exit_code;
mod output;
mod remote_store;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vault_share_core::remote::RemoteError;
use vault_share_core::vaultstorage::VaultStorageError;
use vault_share_engine::{ImportError, SyncError, UploadError};

use crate::commands::{import, resume, share, status, sync_now};

/// Manual driver for the vault-share upload/sync/import engines.
#[derive(Parser)]
#[command(name = "vault-share")]
#[command(author, version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the vault directory this command operates on
    #[arg(value_name = "VAULT", global = true, default_value = ".")]
    vault: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a share from the vault's active files and upload it
    Share(share::Args),
    /// Resume every upload/import job still pending on disk
    Resume(resume::Args),
    /// Run one sync pass immediately, bypassing the debounce timer
    SyncNow(sync_now::Args),
    /// Claim a share by phrase and recover its files into this vault
    Import(import::Args),
    /// Show upload job and per-share sync status
    Status(status::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(exit_code::GENERAL_ERROR);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(categorize_error(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Share(args) => share::execute(&cli.vault, &args).await,
        Commands::Resume(args) => resume::execute(&cli.vault, &args).await,
        Commands::SyncNow(args) => sync_now::execute(&cli.vault, &args).await,
        Commands::Import(args) => import::execute(&cli.vault, &args).await,
        Commands::Status(args) => status::execute(&cli.vault, &args).await,
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Typed downcasting of the anyhow error chain, the way `oxcrypt-cli`
/// picks an exit code without depending on error message wording.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<RemoteError>() {
            return match err {
                RemoteError::VaultNotFound | RemoteError::NotAvailable => exit_code::NOT_FOUND,
                RemoteError::AlreadyClaimed | RemoteError::Revoked => exit_code::SHARE_UNAVAILABLE,
                _ => exit_code::GENERAL_ERROR,
            };
        }
        if let Some(err) = cause.downcast_ref::<UploadError>() {
            if matches!(err, UploadError::NotFound(_)) {
                return exit_code::NOT_FOUND;
            }
            if matches!(err, UploadError::Cancelled) {
                return exit_code::CANCELLED;
            }
        }
        if let Some(err) = cause.downcast_ref::<ImportError>() {
            if matches!(err, ImportError::Crypto(_)) {
                return exit_code::CRYPTO_FAILED;
            }
        }
        if cause.downcast_ref::<SyncError>().is_some() {
            return exit_code::GENERAL_ERROR;
        }
        if cause.downcast_ref::<VaultStorageError>().is_some() {
            return exit_code::NOT_FOUND;
        }
    }
    exit_code::GENERAL_ERROR
}
