//! Sync-now command - bypasses the debounce timer and runs one sync pass
//! immediately (§4.6).

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::engines::{self, Engines};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Directory the machine-local remote store persists to
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::sync_now", skip_all, fields(vault = %vault.display()))]
pub async fn execute(vault: &std::path::Path, args: &Args) -> Result<()> {
    let remote_dir = args.remote_dir.clone().unwrap_or_else(engines::default_remote_dir);
    let Engines { sync, .. } = engines::build(vault, &remote_dir);

    sync.sync_now().await;

    let status = sync.aggregate_status().await;
    println!("sync status: {status:?}");
    Ok(())
}
