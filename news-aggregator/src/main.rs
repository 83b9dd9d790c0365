use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use interfaces::{ArticleFilter, SourceKind};
use news_aggregator::{AppConfig, JobStatus, NewsAggregator, DEFAULT_FETCH_LOG_LIMIT};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "news-aggregator", about = "Collects articles from news APIs, websites and mailboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic fetch scheduler until interrupted
    Serve,
    /// Fetch sources once and print the batch report
    Fetch {
        /// Fetch every source of this kind regardless of its interval
        #[arg(long)]
        kind: Option<SourceKind>,
        /// Fetch a single source
        #[arg(long, conflicts_with = "kind")]
        source: Option<Uuid>,
        #[arg(long, default_value_t = 600)]
        wait_secs: u64,
    },
    /// Register the starter site sources
    InitDefaults,
    /// Suggest settings for a website before registering it
    AnalyzeUrl { url: String },
    Summarize {
        article: Uuid,
        #[arg(long, default_value = "en")]
        language: String,
    },
    /// List the stored summaries of an article
    Summaries { article: Uuid },
    Analyze { article: Uuid },
    /// Print the stored analysis of an article without generating one
    ShowAnalysis { article: Uuid },
    /// Show the last fetch and the number of stored articles
    Status,
    /// Show recent fetch attempts of a source
    Logs {
        source: Uuid,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = DEFAULT_FETCH_LOG_LIMIT)]
        limit: usize,
    },
    /// List stored articles, newest first
    List {
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        kind: Option<SourceKind>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        days: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check the configured mailbox credentials
    TestMailbox,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;
    info!("Starting news aggregator with model {}", config.llm.model);

    let aggregator = NewsAggregator::from_config(&config)
        .await
        .context("initializing aggregator")?;

    match cli.command {
        Command::Serve => {
            let created = aggregator.initialize_defaults().await?;
            if !created.is_empty() {
                info!("Registered {} default site sources", created.len());
            }
            let tick = Duration::from_secs(config.scheduler_tick_minutes * 60);
            let ticker = aggregator.spawn_scheduler(tick);
            info!("Scheduler running every {} minutes; press Ctrl-C to stop", config.scheduler_tick_minutes);
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            ticker.abort();
            info!("Shutting down");
        }
        Command::Fetch { kind, source, wait_secs } => {
            let job = match (kind, source) {
                (_, Some(id)) => aggregator.start_fetch_one(id).await?,
                (Some(kind), None) => aggregator.start_fetch_all(kind).await?,
                (None, None) => aggregator.trigger_fetch().await?,
            };
            match aggregator.wait_for_job(job, Duration::from_secs(wait_secs)).await? {
                JobStatus::Completed(output) => print_json(&output)?,
                JobStatus::Failed(reason) => {
                    error!("Fetch job {} failed: {}", job, reason);
                    anyhow::bail!(reason);
                }
                other => print_json(&other)?,
            }
        }
        Command::InitDefaults => {
            let created = aggregator.initialize_defaults().await?;
            print_json(&created)?;
        }
        Command::AnalyzeUrl { url } => {
            let suggestion = aggregator.analyze_url(&url).await?;
            print_json(&suggestion)?;
        }
        Command::Summarize { article, language } => {
            let summary = aggregator.generate_summary(article, &language).await?;
            print_json(&summary)?;
        }
        Command::Summaries { article } => {
            let summaries = aggregator.list_summaries(article).await?;
            print_json(&summaries)?;
        }
        Command::Analyze { article } => {
            let analysis = aggregator.generate_analysis(article).await?;
            print_json(&analysis)?;
        }
        Command::ShowAnalysis { article } => {
            let analysis = aggregator.get_analysis(article).await?;
            print_json(&analysis)?;
        }
        Command::Status => {
            let status = aggregator.fetch_status().await?;
            print_json(&status)?;
        }
        Command::Logs { source, offset, limit } => {
            let logs = aggregator.fetch_logs(source, offset, limit).await?;
            print_json(&logs)?;
        }
        Command::List {
            language,
            kind,
            category,
            days,
            offset,
            limit,
        } => {
            let filter = ArticleFilter {
                language,
                source_kind: kind,
                category,
                days,
                offset,
                limit,
                ..ArticleFilter::default()
            };
            let articles = aggregator.list_articles(&filter).await?;
            print_json(&articles)?;
        }
        Command::TestMailbox => {
            let report = aggregator.test_mailbox_connection().await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
