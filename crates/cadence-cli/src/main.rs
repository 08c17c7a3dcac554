use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_adapters::refresh_feed;
use cadence_core::{EventSource, PipelineConfig};
use cadence_metrics::{run_shows_metrics, upsert_history_file};
use cadence_storage::{HttpClientConfig, HttpFetcher};
use cadence_sync::{load_steps, run_daily, Step};
use chrono::Datelike;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cadence")]
#[command(about = "Daily lifestyle metrics pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full daily step sequence, reports, and history upsert.
    Sync {
        #[arg(long)]
        year: Option<i32>,
        /// Extra command appended to the sequence (repeatable).
        #[arg(long = "also-run")]
        also_run: Vec<String>,
        /// Step registry; the built-in sequence is used when this is absent.
        #[arg(long, default_value = "steps.yaml")]
        steps_file: PathBuf,
    },
    /// Refresh one event feed into its processed table.
    Fetch { source: FeedArg },
    /// Aggregate the combined, de-duplicated shows summary.
    Shows {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Upsert today's consolidated history row without running any steps.
    History {
        #[arg(long)]
        year: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeedArg {
    Aeg,
    Ticketmaster,
}

impl From<FeedArg> for EventSource {
    fn from(arg: FeedArg) -> Self {
        match arg {
            FeedArg::Aeg => EventSource::Aeg,
            FeedArg::Ticketmaster => EventSource::Ticketmaster,
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
    let config = PipelineConfig::from_env();

    match cli.command {
        None => sync(&config, None, Vec::new(), PathBuf::from("steps.yaml")).await,
        Some(Commands::Sync {
            year,
            also_run,
            steps_file,
        }) => sync(&config, year, also_run, steps_file).await,
        Some(Commands::Fetch { source }) => {
            let http = fetcher(&config)?;
            let rows = refresh_feed(source.into(), &http, &config).await?;
            println!("fetched {}: rows={rows}", EventSource::from(source));
            Ok(())
        }
        Some(Commands::Shows { year }) => {
            let year = year.unwrap_or_else(|| config.today().year());
            let summary = run_shows_metrics(&config, year)?;
            println!(
                "shows summary: year={} upcoming={} venues={} sources={}",
                summary.year,
                summary.upcoming_show_count,
                summary.unique_venues_count,
                summary.sources_present
            );
            Ok(())
        }
        Some(Commands::History { year }) => {
            let year = year.unwrap_or_else(|| config.today().year());
            let path = upsert_history_file(&config, config.today(), year)?;
            println!("upserted: {}", path.display());
            Ok(())
        }
    }
}

async fn sync(
    config: &PipelineConfig,
    year: Option<i32>,
    also_run: Vec<String>,
    steps_file: PathBuf,
) -> Result<()> {
    let year = year.unwrap_or_else(|| config.today().year());
    let exe = std::env::current_exe().context("resolving own executable path")?;

    let mut steps = load_steps(&steps_file, &exe, year)?;
    for (index, extra) in also_run.iter().enumerate() {
        steps.push(Step {
            name: format!("extra_{}", index + 1),
            command: extra.split_whitespace().map(str::to_string).collect(),
            required: false,
            run_if_exists: None,
        });
    }

    let summary = run_daily(config, steps, year).await?;
    println!(
        "sync complete: run_id={} date={} steps={} failed_required={}",
        summary.run_id,
        summary.date,
        summary.steps.len(),
        summary.failed_required
    );

    if summary.failed_required {
        std::process::exit(1);
    }
    Ok(())
}

fn fetcher(config: &PipelineConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}
