//! Single-cycle entry point.
//!
//! An external scheduler (cron or similar) invokes this binary at the
//! polling cadence. One invocation runs one collection cycle, a
//! retention pass, and the previous day's rollup, then exits.

use chrono::{Duration, Utc};
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kotomon_service::archive::Archive;
use kotomon_service::config::Config;
use kotomon_service::fetch::HttpSource;
use kotomon_service::pipeline::Pipeline;
use kotomon_service::rollup;

fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!(error = %e, "cycle aborted");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let archive = Archive::new(&config.data_dir);
    let source = HttpSource::new(&config.fetch)?;
    let pipeline = Pipeline::new(&config, &source, &archive);

    let now = Utc::now().with_timezone(&config.offset());
    pipeline.run_cycle(now)?;

    let today = now.date_naive();
    let stats = archive.prune(config.retention.horizon_days, today)?;
    info!(
        days = stats.days_removed,
        months = stats.months_removed,
        years = stats.years_removed,
        skipped = stats.skipped,
        "retention pass complete"
    );

    let yesterday = today - Duration::days(1);
    rollup::summarize(&archive, yesterday, config.polling.interval_minutes, now)?;

    Ok(())
}
