use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tolov_core::adapters::{PostgresBalanceLedger, PostgresTransactionRepository};
use tolov_core::cli::{self, Cli, Commands, DbCommands, TxCommands};
use tolov_core::config::{Config, LogFormat};
use tolov_core::ports::SystemClock;
use tolov_core::services::Reconciler;
use tolov_core::{create_app, db, startup, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = Config::from_env()?;

    init_tracing(config.log_format);

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Tx(TxCommands::Show { provider, reference }) => {
            cli::handle_tx_show(&config, provider, &reference).await
        }
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(text)
        .with(json)
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let report = startup::validate_environment(&config, &pool).await?;
    if !report.is_valid() {
        report.print();
        anyhow::bail!("startup validation failed");
    }

    let ledger = Arc::new(PostgresBalanceLedger::new(pool.clone()));
    let repo = Arc::new(PostgresTransactionRepository::new(pool.clone()));
    let reconciler = Reconciler::new(repo, ledger, Arc::new(SystemClock), config.reconcile_policy());
    tracing::info!(
        expiry_ms = config.payment_expiry_ms,
        lock_timeout_ms = config.lock_timeout_ms,
        "reconciler initialized"
    );

    let app = create_app(AppState::new(&config, reconciler, Some(pool)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
