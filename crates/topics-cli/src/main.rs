use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use topics_core::PhaseId;
use topics_engine::ServiceConfig;
use topics_storage::PgTopicStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "topics-cli")]
#[command(about = "Alumni topic aggregation engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply pending database migrations.
    Migrate,
    /// Rebuild the approvals of a single (domain, phase) bucket.
    Reconcile {
        #[arg(long)]
        domain: String,
        /// Phase number or selector, e.g. `5` or `"Phase 5"`.
        #[arg(long)]
        phase: String,
    },
    /// Rebuild every approval from every stored request.
    Regenerate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topics_cli=info,topics_engine=info,topics_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            topics_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = ServiceConfig::from_env()?;
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            PgTopicStore::connect(url).await?.migrate().await?;
            tracing::info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Reconcile { domain, phase } => {
            let phase = PhaseId::parse_selector(&phase)?;
            let (_, engine) = topics_engine::engine_from_env().await?;
            let outcome = engine.reconcile(&domain, phase).await?;
            println!(
                "reconciled {} / {}: requests={} approvals={} carried_over={} attempts={}",
                outcome.domain,
                outcome.phase.selector(),
                outcome.requests,
                outcome.approvals,
                outcome.carried_over,
                outcome.attempts
            );
        }
        Commands::Regenerate => {
            let (_, engine) = topics_engine::engine_from_env().await?;
            let summary = engine.regenerate_all().await?;
            println!(
                "regeneration complete: deleted={} requests={} domains={} approvals={}",
                summary.deleted, summary.requests, summary.domains, summary.approvals
            );
        }
    }

    Ok(())
}
