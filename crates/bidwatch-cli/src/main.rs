use anyhow::{bail, Result};
use bidwatch_sync::{run_pipeline, run_scheduled, Phases, Pipeline, PipelineConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Procurement portal bid watcher: scrape agency listings, normalize them,
/// and sync the records into the document store.
#[derive(Debug, Parser)]
#[command(name = "bidwatch", version)]
struct Cli {
    /// Run only the scrape phase (fetch raw snapshots)
    #[arg(long, conflicts_with_all = ["parse_only", "upload_only"])]
    scrape_only: bool,

    /// Run only the parse phase (raw snapshots -> clean records)
    #[arg(long, conflicts_with = "upload_only")]
    parse_only: bool,

    /// Run only the upload phase (clean records -> document store)
    #[arg(long)]
    upload_only: bool,

    /// Portal login email (overrides BIDWATCH_EMAIL)
    #[arg(long)]
    email: Option<String>,

    /// Portal login password (overrides BIDWATCH_PASSWORD)
    #[arg(long)]
    password: Option<String>,

    /// Hint for browser-backed login implementations; the HTTP login flow
    /// ignores it
    #[arg(long)]
    headless: bool,

    /// Run the selected phases on the configured cron schedule instead of once
    #[arg(long)]
    schedule: bool,
}

impl Cli {
    fn phases(&self) -> Phases {
        if !self.scrape_only && !self.parse_only && !self.upload_only {
            return Phases::all();
        }
        Phases {
            scrape: self.scrape_only,
            parse: self.parse_only,
            upload: self.upload_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if cli.email.is_some() {
        config.email = cli.email.clone();
    }
    if cli.password.is_some() {
        config.password = cli.password.clone();
    }
    if cli.headless {
        config.headless = true;
    }

    let phases = cli.phases();
    if phases.scrape && config.credentials().is_err() {
        bail!("the scrape phase needs portal credentials: pass --email/--password or set BIDWATCH_EMAIL and BIDWATCH_PASSWORD");
    }

    if cli.schedule || config.scheduler_enabled {
        info!(cron = %config.sync_cron, "running on schedule");
        return run_scheduled(config, phases).await;
    }

    let pipeline = Pipeline::new(config);
    run_pipeline(&pipeline, phases).await?;
    info!("run complete");
    Ok(())
}
