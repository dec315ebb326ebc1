use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jfind_core::PageRange;
use jfind_sync::{SearchConfig, SearchRunSummary};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jfind-cli")]
#[command(about = "Job Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape a range of results pages and score every listing against your skills.
    Search {
        /// Search text sent to the site.
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 1)]
        start_page: u32,
        #[arg(long, default_value_t = 1)]
        end_page: u32,
        /// Comma-separated skills, e.g. "Rust, SQL, Docker".
        #[arg(long)]
        skills: String,
        /// Cookie header for an already logged-in session; overrides JFIND_SESSION_COOKIE.
        #[arg(long)]
        cookie: Option<String>,
    },
    /// Serve the results viewer.
    Serve,
    /// Summarize recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jfind=info,warn"));

    let file_layer = match std::env::var("JFIND_LOG_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {path}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(file_layer)
        .init();
    Ok(())
}

fn print_summary(summary: &SearchRunSummary) {
    let outcome = &summary.outcome;
    println!(
        "search complete: run_id={} pages={}/{} listings={} skipped={} missing_descriptions={} reports={}",
        outcome.meta.run_id,
        outcome.pages_completed.len(),
        outcome.meta.range.len(),
        outcome.listings.len(),
        outcome.skipped.len(),
        outcome.degraded.len(),
        summary.reports_dir.display()
    );
    for listing in &outcome.listings {
        println!(
            "{:>7.2}%  {}  {}",
            listing.matching_percentage, listing.record.title, listing.record.link
        );
    }
    if let Some(failure) = &outcome.failure {
        eprintln!("run stopped early: {failure}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Commands::Search {
            query,
            start_page,
            end_page,
            skills,
            cookie,
        } => {
            let range = PageRange::new(start_page, end_page)?;
            let mut config = SearchConfig::from_env();
            if cookie.is_some() {
                config.session_cookie = cookie;
            }
            info!(%query, start_page, end_page, "starting search");
            let summary = jfind_sync::run_search_with_config(config, &query, &skills, range).await?;
            print_summary(&summary);
        }
        Commands::Serve => {
            jfind_web::serve_from_env().await?;
        }
        Commands::Report { runs } => {
            let markdown = jfind_sync::report_markdown(runs, None)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
