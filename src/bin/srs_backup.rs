use anyhow::Result;
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use srsmail::arcgis::ArcGisClient;
use srsmail::backup::{self, S3Store};
use srsmail::config;
use srsmail::logging;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Back up the items of a portal folder to object storage"
)]
struct Args {
    /// Also append info-level logs to this file
    #[arg(long, env = "SRS_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_file.as_deref())?;

    let cfg = config::backup_from_env()?;
    info!(portal = %cfg.portal_url, "connecting to ArcGIS");
    let portal = ArcGisClient::connect(&cfg.portal_url, &cfg.username, &cfg.password).await?;
    let store = S3Store::new(&cfg.objectstore);

    let summary = backup::run_backup(
        &portal,
        &store,
        &cfg.ago_folder,
        &cfg.objectstore.folder,
        Local::now().date_naive(),
    )
    .await?;
    info!(uploaded = summary.uploaded.len(), "backup finished");
    Ok(())
}
