use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use srsmail::arcgis::FeatureSource;
use srsmail::config;
use srsmail::db;
use srsmail::logging;
use srsmail::mail::SmtpMailer;
use srsmail::notifier::{Notifier, RunContext};
use srsmail::template::Templates;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Email confirmations for new geospatial service requests and lead-assignment updates"
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
    info!("starting srsmail");

    // Upper bound of this run's window.
    let this_run = Utc::now();

    let cfg = config::from_env()?;
    let pool = db::init_pool(&cfg.db_path).await?;
    let source = FeatureSource::connect(&cfg.arcgis).await?;
    let mailer = SmtpMailer::new(&cfg.smtp.host)?;
    let templates = Templates::load(cfg.notify.template_dir.as_deref().map(Path::new))?;

    let ctx = RunContext {
        db: &pool,
        source: &source,
        mailer: &mailer,
    };
    let notifier = Notifier::new(ctx, &cfg.notify, &templates);
    let span = info_span!("run", run_id = %Uuid::new_v4());
    let result = notifier.run(this_run).instrument(span).await;
    pool.close().await;

    let summary = result?;
    info!(
        fetched = summary.notify.fetched,
        notified = summary.notify.notified,
        failed = summary.notify.failed,
        leads_notified = summary.follow_up.notified,
        marker = %summary.marker,
        "mailing complete"
    );
    Ok(())
}
