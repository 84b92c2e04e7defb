use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::reconciler::{
    ReconcilePolicy, DEFAULT_EXPIRY_MS, DEFAULT_LOCK_TIMEOUT, DEFAULT_MIN_AMOUNT_MINOR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub payme_key: String,
    pub click_service_id: String,
    pub click_secret_key: String,
    pub admin_api_key: String,
    pub payment_expiry_ms: i64,
    pub lock_timeout_ms: u64,
    pub payme_min_amount: i64,
    pub click_min_amount: i64,
    pub uzum_min_amount: i64,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL")?,
            payme_key: env::var("PAYME_KEY").unwrap_or_default(),
            click_service_id: env::var("CLICK_SERVICE_ID").unwrap_or_default(),
            click_secret_key: env::var("CLICK_SECRET_KEY").unwrap_or_default(),
            admin_api_key: env::var("ADMIN_API_KEY").unwrap_or_default(),
            payment_expiry_ms: parse_or("PAYMENT_EXPIRY_MS", DEFAULT_EXPIRY_MS)?,
            lock_timeout_ms: parse_or("LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT.as_millis() as u64)?,
            payme_min_amount: parse_or("PAYME_MIN_AMOUNT", DEFAULT_MIN_AMOUNT_MINOR)?,
            click_min_amount: parse_or("CLICK_MIN_AMOUNT", DEFAULT_MIN_AMOUNT_MINOR)?,
            uzum_min_amount: parse_or("UZUM_MIN_AMOUNT", DEFAULT_MIN_AMOUNT_MINOR)?,
            log_format: env::var("LOG_FORMAT").unwrap_or_default().parse()?,
        })
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            expiry_ms: self.payment_expiry_ms,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            payme_min_amount_minor: self.payme_min_amount,
            click_min_amount_minor: self.click_min_amount,
            uzum_min_amount_minor: self.uzum_min_amount,
        }
    }
}

fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_or_falls_back_when_unset() {
        let value: i64 = parse_or("TOLOV_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
