use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use permx_core::Jurisdiction;
use permx_sync::{ProgressHandle, SearchPipeline, SearchRequest};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "permx")]
#[command(about = "Permit records exporter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search one jurisdiction and write the xlsx workbook.
    Search(SearchArgs),
    /// Rebuild snapshot files from their upstream layers (all when no city is given).
    Refresh {
        #[arg(long)]
        city: Option<String>,
    },
    Jurisdictions,
    Serve,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    city: String,
    /// Window start, YYYY-MM-DD.
    #[arg(long)]
    start: Option<String>,
    /// Window end, YYYY-MM-DD (inclusive).
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long = "type")]
    permit_type: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Output path; defaults to `<city>_permits.xlsx` in the current directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

impl From<SearchArgs> for SearchRequest {
    fn from(args: SearchArgs) -> Self {
        SearchRequest {
            city: args.city,
            start_date: args.start,
            end_date: args.end,
            status: args.status,
            permit_type: args.permit_type,
            category: args.category,
        }
    }
}

fn spawn_progress_logger(progress: &ProgressHandle) -> tokio::task::JoinHandle<()> {
    let mut rx = progress.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        while rx.changed().await.is_ok() {
            let snap = rx.borrow_and_update().clone();
            if last == Some((snap.current, snap.status)) {
                continue;
            }
            last = Some((snap.current, snap.status));
            info!(current = snap.current, total = snap.total, status = ?snap.status, "progress");
            if snap.status.is_terminal() {
                break;
            }
        }
    })
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let pipeline = SearchPipeline::from_env().await?;
    let out = args.out.clone();
    let request = SearchRequest::from(args);
    let progress = ProgressHandle::new();
    let logger = spawn_progress_logger(&progress);
    let outcome = pipeline.search(&request, &progress).await;
    logger.abort();

    let workbook = outcome?;
    let path = out.unwrap_or_else(|| PathBuf::from(&workbook.file_name));
    tokio::fs::write(&path, &workbook.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    println!(
        "search complete: permits={} failed={} file={}",
        workbook.permits,
        workbook.failed,
        path.display()
    );
    Ok(())
}

async fn run_refresh(city: Option<String>) -> Result<()> {
    let pipeline = SearchPipeline::from_env().await?;
    match city {
        Some(city) => {
            let jurisdiction =
                Jurisdiction::parse(&city).with_context(|| format!("unsupported city `{city}`"))?;
            let stored = pipeline.refresh_snapshot(jurisdiction).await?;
            println!(
                "refresh complete: records={} bytes={} sha256={} path={}",
                stored.record_count,
                stored.byte_size,
                stored.content_hash,
                stored.path.display()
            );
        }
        None => {
            let refreshed = pipeline.refresh_all_snapshots().await;
            println!("refresh complete: snapshots={refreshed}");
        }
    }
    Ok(())
}

async fn run_jurisdictions() -> Result<()> {
    let pipeline = SearchPipeline::from_env().await?;
    for config in &pipeline.registry().jurisdictions {
        println!(
            "{:<10} source={:<15} detail={:?}",
            config.jurisdiction.display_name(),
            config.source.kind(),
            config.detail_mode()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "permx=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Search(args) => run_search(args).await?,
        Commands::Refresh { city } => run_refresh(city).await?,
        Commands::Jurisdictions => run_jurisdictions().await?,
        Commands::Serve => permx_web::serve_from_env().await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_flags_map_onto_the_request() {
        let cli = Cli::try_parse_from([
            "permx", "search", "--city", "Bellevue", "--start", "2024-01-01", "--type", "Building",
        ])
        .unwrap();
        let Commands::Search(args) = cli.command else {
            panic!("expected search");
        };
        let request = SearchRequest::from(args);
        assert_eq!(request.city, "Bellevue");
        assert_eq!(request.start_date.as_deref(), Some("2024-01-01"));
        assert_eq!(request.permit_type.as_deref(), Some("Building"));
        assert_eq!(request.end_date, None);
    }
}
