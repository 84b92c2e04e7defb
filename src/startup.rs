use crate::config::Config;
use anyhow::{Context, Result};
use sqlx::PgPool;

pub struct ValidationReport {
    pub environment: bool,
    pub database: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(self.environment));
        println!("Database Connectivity: {}", status(self.database));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "✅ OK" } else { "❌ FAIL" }
}

pub async fn validate_environment(config: &Config, pool: &PgPool) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        environment: true,
        database: true,
        errors: Vec::new(),
    };

    let env_errors = validate_env_vars(config);
    if !env_errors.is_empty() {
        report.environment = false;
        report
            .errors
            .extend(env_errors.into_iter().map(|e| format!("Environment: {}", e)));
    }

    if let Err(e) = validate_database(pool).await {
        report.database = false;
        report.errors.push(format!("Database: {:#}", e));
    }

    Ok(report)
}

/// Every problem found, not just the first one.
pub fn validate_env_vars(config: &Config) -> Vec<String> {
    let mut errors = Vec::new();

    if config.server_port == 0 {
        errors.push("SERVER_PORT must be greater than 0".to_string());
    }
    if let Err(e) = url::Url::parse(&config.database_url) {
        errors.push(format!("DATABASE_URL is not a valid URL: {}", e));
    }

    let secrets = [
        ("PAYME_KEY", &config.payme_key),
        ("CLICK_SERVICE_ID", &config.click_service_id),
        ("CLICK_SECRET_KEY", &config.click_secret_key),
        ("ADMIN_API_KEY", &config.admin_api_key),
    ];
    for (name, value) in secrets {
        if value.trim().is_empty() {
            errors.push(format!("{} is empty", name));
        }
    }

    if config.payment_expiry_ms <= 0 {
        errors.push("PAYMENT_EXPIRY_MS must be positive".to_string());
    }
    if config.lock_timeout_ms == 0 {
        errors.push("LOCK_TIMEOUT_MS must be positive".to_string());
    }
    for (name, value) in [
        ("PAYME_MIN_AMOUNT", config.payme_min_amount),
        ("CLICK_MIN_AMOUNT", config.click_min_amount),
        ("UZUM_MIN_AMOUNT", config.uzum_min_amount),
    ] {
        if value < 0 {
            errors.push(format!("{} must not be negative", name));
        }
    }

    errors
}

async fn validate_database(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Failed to connect to database")?;

    // Check if migrations are up to date
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;

    fn config() -> Config {
        Config {
            server_port: 3000,
            database_url: "postgres://tolov:pw@localhost:5432/tolov".to_string(),
            payme_key: "payme-key".to_string(),
            click_service_id: "77".to_string(),
            click_secret_key: "click-secret".to_string(),
            admin_api_key: "admin".to_string(),
            payment_expiry_ms: 43_200_000,
            lock_timeout_ms: 5_000,
            payme_min_amount: 100_000,
            click_min_amount: 100_000,
            uzum_min_amount: 100_000,
            log_format: LogFormat::Text,
        }
    }

    #[test]
    fn test_complete_config_has_no_errors() {
        assert!(validate_env_vars(&config()).is_empty());
    }

    #[test]
    fn test_reports_every_missing_secret() {
        let mut cfg = config();
        cfg.payme_key.clear();
        cfg.click_secret_key = "   ".to_string();

        let errors = validate_env_vars(&cfg);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("PAYME_KEY"));
        assert!(errors[1].contains("CLICK_SECRET_KEY"));
    }

    #[test]
    fn test_rejects_bad_database_url() {
        let mut cfg = config();
        cfg.database_url = "not a url".to_string();
        assert!(validate_env_vars(&cfg)[0].contains("DATABASE_URL"));
    }
}
