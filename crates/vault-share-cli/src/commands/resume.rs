//! Resume command - picks back up every upload and import job still on disk
//! after an interruption (§4.5 step 14, §4.7 resumability).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::engines::{self, Engines};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Directory the machine-local remote store persists to
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::resume", skip_all, fields(vault = %vault.display()))]
pub async fn execute(vault: &std::path::Path, args: &Args) -> Result<()> {
    let remote_dir = args.remote_dir.clone().unwrap_or_else(engines::default_remote_dir);
    let Engines { upload, import, .. } = engines::build(vault, &remote_dir);

    // `resume_pending_uploads_if_needed` only schedules a debounced task; it's
    // built for a long-running host process, not a one-shot invocation. Give
    // it room to actually run before this process exits and the runtime
    // drops it mid-flight.
    upload.resume_pending_uploads_if_needed().await;
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    import.resume_pending_imports().await.context("resuming pending imports failed")?;

    println!("Resumed pending uploads and imports.");
    Ok(())
}
