use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nlw_adapters::{adapter_for, AdapterSpec, Locality, SearchParams};
use nlw_core::SourceKind;
use nlw_storage::{ArtifactStore, HistoryStore};
use nlw_sync::{CycleRunner, SyncConfig, SyncPipeline, WatchOutcome};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nlw-cli")]
#[command(about = "New Listing Watch command-line interface")]
struct Cli {
    /// Overrides NLW_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one check cycle for a single source, query and locality.
    Check(CheckArgs),
    /// Run every enabled watch from the watch registry once.
    Sync,
    /// Run the registry on the NLW_SYNC_CRON schedule until interrupted.
    Schedule,
    /// Show what the history store holds for a source.
    History {
        #[arg(long)]
        source: SourceKind,
        /// Print the last N rows.
        #[arg(long, default_value_t = 10)]
        tail: usize,
    },
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long)]
    source: SourceKind,
    #[arg(long)]
    query: String,
    #[arg(long, allow_hyphen_values = true, requires = "long")]
    lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    long: Option<f64>,
    #[arg(long, requires = "state")]
    city: Option<i64>,
    #[arg(long, requires = "city")]
    state: Option<i64>,
    #[arg(long, requires = "country")]
    postal_code: Option<String>,
    #[arg(long, requires = "postal_code")]
    country: Option<String>,
    /// Source-specific search filter, passed through untouched.
    #[arg(long = "filter", value_name = "KEY=VALUE", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
    #[arg(long, conflicts_with = "feed_url", required_unless_present = "feed_url")]
    fixture: Option<PathBuf>,
    #[arg(long)]
    feed_url: Option<String>,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

impl CheckArgs {
    fn locality(&self) -> Result<Locality> {
        match (
            (self.lat, self.long),
            (self.city, self.state),
            (&self.postal_code, &self.country),
        ) {
            ((Some(lat), Some(long)), (None, None), (None, None)) => Ok(Locality::Coordinates { lat, long }),
            ((None, None), (Some(city), Some(state)), (None, None)) => Ok(Locality::CityState { city, state }),
            ((None, None), (None, None), (Some(postal_code), Some(country))) => Ok(Locality::Postal {
                postal_code: postal_code.clone(),
                country: country.clone(),
            }),
            _ => bail!("give exactly one locality: --lat/--long, --city/--state or --postal-code/--country"),
        }
    }

    fn params(&self) -> Result<SearchParams> {
        let mut params = SearchParams::new(self.query.clone(), self.locality()?);
        for (key, value) in &self.filters {
            params = params.with_filter(key.clone(), value.clone());
        }
        Ok(params)
    }

    fn adapter_spec(&self) -> Result<AdapterSpec> {
        match (&self.fixture, &self.feed_url) {
            (Some(path), None) => Ok(AdapterSpec::Fixture { path: path.clone() }),
            (None, Some(url)) => Ok(AdapterSpec::Feed { url: url.clone() }),
            _ => bail!("give exactly one of --fixture or --feed-url"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Check(args) => check(config, args).await?,
        Commands::Sync => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            for outcome in &summary.outcomes {
                match outcome {
                    WatchOutcome::Completed { report, .. } => println!("{}", report.summary_line()),
                    WatchOutcome::Failed {
                        watch_id, fault, error, ..
                    } => println!("[{watch_id}] failed ({fault}): {error}"),
                }
            }
            println!(
                "sync complete: run_id={} watches={} new={} failed={} reports={}",
                summary.run_id,
                summary.enabled_watches,
                summary.novel_listings,
                summary.failed_watches,
                summary.reports_dir
            );
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::History { source, tail } => history(config, source, tail).await?,
    }

    Ok(())
}

async fn check(config: SyncConfig, args: CheckArgs) -> Result<()> {
    let params = args.params()?;
    let spec = args.adapter_spec()?;
    let feed = config.feed_client()?;
    let adapter = adapter_for(args.source, &spec, &feed);
    let runner = CycleRunner::new(config.resolved_layout().await?);

    let report = runner
        .run(adapter.as_ref(), &params)
        .await
        .with_context(|| format!("check cycle for {} failed", args.source))?;
    println!("{}", report.summary_line());
    println!("artifact: {}", report.artifact.path);
    Ok(())
}

async fn history(config: SyncConfig, source: SourceKind, tail: usize) -> Result<()> {
    let store = HistoryStore::new(config.resolved_layout().await?);
    let path = store.layout().history_path(source);
    if !store.exists(source)? {
        println!("{source}: no history yet ({})", path.display());
        return Ok(());
    }
    let rows = store.load(source)?;
    println!("{source}: {} rows in {}", rows.len(), path.display());
    let recent = &rows[rows.len().saturating_sub(tail)..];
    let csv = ArtifactStore::render_csv(source.manifest(), recent).context("rendering history rows")?;
    print!("{}", String::from_utf8_lossy(&csv));
    Ok(())
}
