//! Status command - snapshot of every upload job and active share's sync
//! progress for this vault.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use crate::engines::{self, Engines};
use crate::output::create_table;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Directory the machine-local remote store persists to
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct UploadJobStatus {
    job_id: uuid::Uuid,
    status: String,
}

#[derive(Serialize)]
struct ShareSyncStatus {
    share_vault_id: uuid::Uuid,
    sync_status: String,
    fraction_completed: f64,
    message: String,
}

#[derive(Serialize)]
struct StatusReport {
    sync_status: String,
    upload_jobs: Vec<UploadJobStatus>,
    shares: Vec<ShareSyncStatus>,
}

#[instrument(level = "info", name = "cmd::status", skip_all, fields(vault = %vault.display()))]
pub async fn execute(vault: &std::path::Path, args: &Args) -> Result<()> {
    let remote_dir = args.remote_dir.clone().unwrap_or_else(engines::default_remote_dir);
    let Engines { upload, sync, storage, .. } = engines::build(vault, &remote_dir);

    let upload_jobs: Vec<UploadJobStatus> = upload
        .list_jobs()
        .into_iter()
        .map(|(job_id, status)| UploadJobStatus { job_id, status: format!("{status:?}") })
        .collect();

    let index = storage.load_index().await.context("failed to load vault share index")?;
    let mut shares = Vec::new();
    for share_vault_id in index.active_shares.keys().copied() {
        if let Some(progress) = sync.share_progress(share_vault_id) {
            shares.push(ShareSyncStatus {
                share_vault_id,
                sync_status: format!("{:?}", progress.status),
                fraction_completed: progress.fraction_completed,
                message: progress.message,
            });
        }
    }

    let report = StatusReport {
        sync_status: format!("{:?}", sync.aggregate_status().await),
        upload_jobs,
        shares,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("sync status: {}", report.sync_status);

        let mut jobs_table = create_table();
        jobs_table.set_header(vec!["Upload Job", "Status"]);
        for job in &report.upload_jobs {
            jobs_table.add_row(vec![job.job_id.to_string(), job.status.clone()]);
        }
        println!("{jobs_table}");

        let mut shares_table = create_table();
        shares_table.set_header(vec!["Share Vault ID", "Status", "Progress", "Message"]);
        for share in &report.shares {
            shares_table.add_row(vec![
                share.share_vault_id.to_string(),
                share.sync_status.clone(),
                format!("{:.0}%", share.fraction_completed * 100.0),
                share.message.clone(),
            ]);
        }
        println!("{shares_table}");
    }
    Ok(())
}
