//! vigil-query - inspect, export and purge stored detection events

use anyhow::{bail, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vigil_storage::report::{
    render_class_statistics, render_collection, render_recent, render_window,
};
use vigil_storage::{
    open_store, write_export, Config, ExportFormat, PurgeConfirmation, StatisticsEngine,
    StoreError,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Store URL (postgres://... or memory://); overrides the configuration file.
    #[arg(long, env = "VIGIL_DATABASE_URL")]
    database_url: Option<String>,
    /// Event table name; overrides the configuration file.
    #[arg(long)]
    table: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the newest events across all sources.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Per-class detection statistics.
    Stats {
        #[arg(long)]
        source_id: Option<String>,
    },
    /// Events recorded in the last N hours with summed class counts.
    Window {
        #[arg(long, default_value_t = 1)]
        hours: u32,
        #[arg(long)]
        source_id: Option<String>,
    },
    /// Document count and index layout of the event table.
    Info,
    /// Export the newest events as JSON.
    Export {
        /// json (pretty array) or ndjson
        #[arg(long, default_value = "json")]
        format: ExportFormat,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Output file; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete events older than the retention window.
    Purge {
        #[arg(long)]
        max_age_days: Option<u32>,
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(table) = args.table {
        config.database.table = table;
    }

    let store = open_store(&config.database)
        .await
        .context("Failed to open event store")?;
    let engine = StatisticsEngine::new(store.clone());

    let result = run(&engine, &config, args.command).await;
    store.close().await;
    result
}

async fn run(engine: &StatisticsEngine, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Recent { limit } => {
            let events = engine.recent_events(limit).await?;
            print!("{}", render_recent(&events));
        }
        Command::Stats { source_id } => {
            let stats = engine.aggregate_by_class(source_id.as_deref()).await?;
            print!("{}", render_class_statistics(&stats, source_id.as_deref()));
        }
        Command::Window { hours, source_id } => {
            let report = engine.events_in_last(hours, source_id.as_deref()).await?;
            print!("{}", render_window(&report, hours));
        }
        Command::Info => {
            let info = engine.collection_info().await?;
            print!("{}", render_collection(&info));
        }
        Command::Export {
            format,
            limit,
            output,
        } => {
            let events = engine.recent_events(limit).await?;
            let written = match &output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    write_export(&events, format, BufWriter::new(file))?
                }
                None => write_export(&events, format, io::stdout().lock())?,
            };
            if let Some(path) = output {
                eprintln!("Exported {} events to {}", written, path.display());
            }
        }
        Command::Purge { max_age_days, yes } => {
            let days = max_age_days.unwrap_or(config.retention.max_age_days);
            if days == 0 {
                bail!("--max-age-days must be at least 1");
            }
            let max_age = Duration::try_days(i64::from(days))
                .with_context(|| format!("--max-age-days {} is out of range", days))?;

            let confirmation = if yes {
                PurgeConfirmation::Confirmed
            } else {
                confirm_interactively(days)?
            };

            match engine.purge(max_age, confirmation).await {
                Ok(report) => {
                    println!(
                        "Deleted {} events older than {}",
                        report.deleted,
                        report.cutoff.to_rfc3339()
                    );
                }
                Err(StoreError::PurgeConfirmationRequired { .. }) => {
                    println!("Purge cancelled");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn confirm_interactively(days: u32) -> Result<PurgeConfirmation> {
    let mut stdout = io::stdout();
    write!(
        stdout,
        "Delete all events older than {} days? Type 'yes' to confirm: ",
        days
    )?;
    stdout.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(PurgeConfirmation::from(answer.trim().eq_ignore_ascii_case("yes")))
}
