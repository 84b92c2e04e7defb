use clap::{Parser, Subcommand};

use crate::adapters::PostgresTransactionRepository;
use crate::config::Config;
use crate::domain::Provider;
use crate::ports::{RowKey, TransactionRepository};

#[derive(Parser)]
#[command(name = "tolov-core")]
#[command(about = "Tolov Core - payment gateway reconciliation service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Transaction inspection commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Show one transaction by its provider reference
    Show {
        /// payme, click or uzum
        #[arg(long)]
        provider: Provider,

        /// The provider's own transaction id
        #[arg(long)]
        reference: String,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_tx_show(config: &Config, provider: Provider, reference: &str) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let repo = PostgresTransactionRepository::new(pool);

    match repo.find(&RowKey::new(provider, reference)).await? {
        Some(tx) => {
            println!("{}", serde_json::to_string_pretty(&tx)?);
            Ok(())
        }
        None => {
            tracing::warn!(provider = %provider, reference, "Transaction not found");
            anyhow::bail!("Transaction {}:{} not found", provider, reference)
        }
    }
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub async fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Click Service ID: {}", config.click_service_id);
    println!("  Payment Expiry: {} ms", config.payment_expiry_ms);
    println!("  Lock Timeout: {} ms", config.lock_timeout_ms);
    println!(
        "  Minimum Amounts (tiyin): payme={} click={} uzum={}",
        config.payme_min_amount, config.click_min_amount, config.uzum_min_amount
    );

    let pool = crate::db::create_pool(config).await?;
    let report = crate::startup::validate_environment(config, &pool).await?;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("Configuration is invalid");
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");
    Ok(())
}

pub(crate) fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user_start = slash_pos + 2;
                let user = &url[user_start..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
