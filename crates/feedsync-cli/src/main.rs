use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedsync_sync::{
    build_scheduler, load_accounts, load_dotenv, sync_accounts, PgOfferStore, RunOutcome,
    SyncConfig, SyncRuntime,
};
use feedsync_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Offer feed ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the admin HTTP endpoint until interrupted.
    Serve,
    /// Run one ingestion cycle over every account and exit.
    Sync,
    /// Apply pending database migrations.
    Migrate,
    /// Write the configured accounts into the reference table.
    SyncAccounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync => {
            let runtime = SyncRuntime::bootstrap(config, CancellationToken::new()).await?;
            match runtime.offers.run().await {
                RunOutcome::Completed(report) => {
                    for account in &report.accounts {
                        println!(
                            "account={} fetched={} inserted={} updated={} unchanged={} stopped={} failed_writes={} finish={:?}",
                            account.account_id,
                            account.fetched,
                            account.inserted,
                            account.updated,
                            account.unchanged,
                            account.stopped,
                            account.failed_writes,
                            account.finish
                        );
                    }
                    println!("sync complete: run_id={}", report.run_id);
                }
                RunOutcome::AlreadyRunning => warn!("offers collector already running"),
            }
        }
        Commands::Migrate => {
            let store = PgOfferStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::SyncAccounts => {
            let accounts = load_accounts(&config.accounts_file)?;
            let store = PgOfferStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            let inserted = sync_accounts(&store, &accounts).await?;
            println!("accounts synced: configured={} inserted={}", accounts.len(), inserted);
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let runtime = SyncRuntime::bootstrap(config, shutdown.clone()).await?;

    let mut scheduler = if runtime.config.scheduler_enabled {
        let sched = build_scheduler(&runtime.registry).await?;
        sched.start().await.context("starting scheduler")?;
        Some(sched)
    } else {
        info!("scheduler disabled");
        None
    };
    runtime.registry.trigger_immediate();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let addr = runtime.config.listen_addr.clone();
    feedsync_web::serve(&addr, AppState::new(runtime.registry.clone()), shutdown.clone()).await?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
