//! pipelinectl - sales pipeline daemon and admin CLI
//!
//! `run` keeps the dashboard aggregate fresh until interrupted. The other
//! subcommands are one-shot administrative calls against the configured
//! store.

use chrono::{DateTime, Datelike, Utc};
use clap::{Parser, Subcommand};
use pipeline_daemon::{open_store, AggregateRefresher, PipelineConfig};
use pipeline_engine::PipelineEngine;
use pipeline_types::{CompanyId, DateRange, TenantScope};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// pipelinectl CLI
#[derive(Parser)]
#[command(name = "pipelinectl")]
#[command(about = "Sales pipeline daemon and administration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "PIPELINE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "PIPELINE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh the dashboard aggregate periodically until interrupted
    Run,
    /// Allocate and print the next document number
    NextNumber {
        company: String,
        /// Defaults to the current year
        #[arg(long)]
        year: Option<i32>,
    },
    /// Raise a counter to at least VALUE
    SetFloor {
        company: String,
        year: i32,
        value: u64,
    },
    /// List sequence counters
    Sequences {
        #[arg(long)]
        company: Option<String>,
    },
    /// Print pipeline statistics as JSON
    Stats {
        #[arg(long)]
        company: Option<String>,
        /// Inclusive lower bound on offer creation (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Inclusive upper bound on offer creation (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

fn scope_for(company: Option<String>) -> TenantScope {
    company.map_or(TenantScope::Unrestricted, TenantScope::company)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.log_json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let store = open_store(&config.storage).await?;
    let engine = Arc::new(PipelineEngine::new(store, config.engine_settings()));

    match cli.command {
        Command::Run => run(engine, &config).await?,
        Command::NextNumber { company, year } => {
            let company = CompanyId::new(company);
            let year = year.unwrap_or_else(|| Utc::now().year());
            let number = engine
                .numbering()
                .generate_number_for_year(&company, year)
                .await?;
            println!("{number}");
        }
        Command::SetFloor {
            company,
            year,
            value,
        } => {
            let after = engine
                .sequences()
                .set_floor(&CompanyId::new(company), year, value)
                .await?;
            println!("{after}");
        }
        Command::Sequences { company } => {
            for counter in engine.sequences().list(&scope_for(company)).await? {
                println!(
                    "{}\t{}\t{}",
                    counter.company_id, counter.year, counter.last_value
                );
            }
        }
        Command::Stats { company, from, to } => {
            let range = DateRange { from, to };
            let scope = scope_for(company);
            if range.is_unbounded() {
                engine.aggregates().refresh().await?;
            }
            let stats = engine
                .aggregates()
                .aggregated_pipeline_stats(&scope, Some(range))
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn run(engine: Arc<PipelineEngine>, config: &PipelineConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        companies = config.numbering.companies.len(),
        "pipelinectl starting"
    );

    let refresher = match config.aggregates.refresh_interval_secs {
        0 => {
            tracing::warn!("Aggregate refresh disabled");
            None
        }
        secs => {
            let refresher = AggregateRefresher::new(engine.clone(), Duration::from_secs(secs));
            let handle = tokio::spawn(refresher.clone().start());
            Some((refresher, handle))
        }
    };

    shutdown_signal().await;
    tracing::info!("pipelinectl shutting down");

    if let Some((refresher, handle)) = refresher {
        refresher.stop().await;
        handle.await?;
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
