//! Import command - claims a share by phrase and recovers its files into
//! this vault (§4.7).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use crate::engines::{self, Engines};
use crate::output::create_table;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Share phrase to claim
    #[arg(long)]
    pub phrase: String,

    /// Directory the machine-local remote store persists to
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ImportResult {
    share_vault_id: uuid::Uuid,
}

#[instrument(level = "info", name = "cmd::import", skip_all, fields(vault = %vault.display()))]
pub async fn execute(vault: &std::path::Path, args: &Args) -> Result<()> {
    let remote_dir = args.remote_dir.clone().unwrap_or_else(engines::default_remote_dir);
    let Engines { import, .. } = engines::build(vault, &remote_dir);

    let share_vault_id = import.start_import(&args.phrase).await.context("import failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ImportResult { share_vault_id })?);
    } else {
        let mut table = create_table();
        table.set_header(vec!["Share Vault ID", "Status"]);
        table.add_row(vec![share_vault_id.to_string(), "imported".to_string()]);
        println!("{table}");
    }
    Ok(())
}
