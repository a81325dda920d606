//! Share command - build a new share from the vault's active files and
//! upload it under a phrase (§4.5).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;
use vault_share_core::model::SharePolicy;

use crate::engines::{self, Engines};
use crate::output::create_table;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Share phrase recipients will use to claim the share
    #[arg(long)]
    pub phrase: String,

    /// Fingerprint identifying the sharing owner
    #[arg(long)]
    pub owner: String,

    /// Revoke the share automatically after this many opens
    #[arg(long)]
    pub max_opens: Option<u32>,

    /// Allow recipients to take screenshots
    #[arg(long)]
    pub allow_screenshots: bool,

    /// Allow recipients to download files locally
    #[arg(long)]
    pub allow_downloads: bool,

    /// Directory the machine-local remote store persists to
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ShareResult {
    job_id: uuid::Uuid,
}

#[instrument(level = "info", name = "cmd::share", skip_all, fields(vault = %vault.display()))]
pub async fn execute(vault: &std::path::Path, args: &Args) -> Result<()> {
    let remote_dir = args.remote_dir.clone().unwrap_or_else(engines::default_remote_dir);
    let Engines { upload, .. } = engines::build(vault, &remote_dir);

    let policy = SharePolicy {
        expires_at: None,
        max_opens: args.max_opens,
        allow_screenshots: args.allow_screenshots,
        allow_downloads: args.allow_downloads,
    };

    let job_id = upload
        .start_upload(&args.phrase, policy, args.owner.clone())
        .await
        .context("upload failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ShareResult { job_id })?);
    } else {
        let mut table = create_table();
        table.set_header(vec!["Job ID", "Status"]);
        table.add_row(vec![job_id.to_string(), "complete".to_string()]);
        println!("{table}");
    }
    Ok(())
}
