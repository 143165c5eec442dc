/// Configuration management for Payment Service
///
/// Loads configuration from environment variables. `.env` is read by `main`
/// through dotenvy in development.
use crate::domain::{limits, FeeRates, TransactionKind};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use webhook_inbox::RetryPolicy;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub fees: FeeConfig,
    pub processors: ProcessorsConfig,
    pub webhooks: WebhookConfig,
    pub workers: WorkerConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    pub env: String,
    pub host: String,
    pub http_port: u16,
    /// `json` for structured logs, anything else for human-readable output
    pub log_format: String,
    /// Receipt sink: `log` or `outbox`
    pub notification_sink: String,
    /// Currency used when a request does not name one
    pub default_currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Close connections idle for longer than this
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Recycle connections older than this
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the identity service
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
}

/// Fee schedule in basis points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub platform_fee_bps: u32,
    /// Processor fee estimate when a processor has no override
    pub processor_fee_bps: u32,
    pub processor_fee_overrides: HashMap<String, u32>,
    pub withdrawal_fee_bps: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: default_platform_fee_bps(),
            processor_fee_bps: default_processor_fee_bps(),
            processor_fee_overrides: HashMap::new(),
            withdrawal_fee_bps: limits::WITHDRAWAL_FEE_BPS,
        }
    }
}

impl FeeConfig {
    /// Rates applied when a transaction of `kind` settles through `processor`.
    /// Deposits carry no platform fee.
    pub fn rates_for(&self, kind: TransactionKind, processor: &str) -> FeeRates {
        let processor_bps = self
            .processor_fee_overrides
            .get(processor)
            .copied()
            .unwrap_or(self.processor_fee_bps);
        let platform_bps = match kind {
            TransactionKind::Deposit => 0,
            _ => self.platform_fee_bps,
        };
        FeeRates {
            platform_bps,
            processor_bps,
        }
    }

    pub fn validate(&self) -> Result<()> {
        FeeRates::new(self.platform_fee_bps, self.processor_fee_bps)
            .map_err(anyhow::Error::msg)
            .context("invalid default fee rates")?;
        for (processor, bps) in &self.processor_fee_overrides {
            FeeRates::new(self.platform_fee_bps, *bps)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid fee override for {}", processor))?;
        }
        if self.withdrawal_fee_bps > 10_000 {
            bail!("withdrawal fee must be at most 10000 bps");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    #[serde(skip_serializing)]
    pub secret_key: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub api_base: String,
    /// Product that subscription prices are created under
    pub subscription_product: String,
    pub signature_tolerance_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcbillConfig {
    pub account_number: String,
    pub subaccount: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    #[serde(skip_serializing)]
    pub webhook_salt: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorsConfig {
    pub stripe: Option<StripeConfig>,
    pub ccbill: Option<CcbillConfig>,
    /// Per-call timeout, capped at 10 seconds
    pub call_timeout_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_open_secs: u64,
}

impl ProcessorsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub max_attempts: u32,
    /// How long a claimed inbox entry stays invisible to other workers
    pub lease_secs: u64,
    pub retention_days: i64,
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.retry_base_secs),
            max_delay: Duration::from_secs(self.retry_max_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub webhook_retry_enabled: bool,
    pub webhook_poll_interval_secs: u64,
    pub webhook_batch_size: usize,
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
}

// Default values
fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

fn default_http_port() -> u16 {
    8090
}

fn default_platform_fee_bps() -> u32 {
    1000
}

fn default_processor_fee_bps() -> u32 {
    290
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_ccbill_api_base() -> String {
    "https://api.ccbill.com".to_string()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// `"ccbill=1050,stripe=290"` → map
fn parse_fee_overrides(raw: &str) -> Result<HashMap<String, u32>> {
    let mut overrides = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, bps) = pair
            .split_once('=')
            .with_context(|| format!("expected processor=bps, got '{}'", pair))?;
        let bps: u32 = bps
            .trim()
            .parse()
            .with_context(|| format!("invalid basis points in '{}'", pair))?;
        overrides.insert(name.trim().to_string(), bps);
    }
    Ok(overrides)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let app = AppConfig {
            env: env_string("APP_ENV", "development"),
            host: env_string("APP_HOST", "0.0.0.0"),
            http_port: env_or("PORT", default_http_port()),
            log_format: env_string("LOG_FORMAT", "text"),
            notification_sink: env_string("NOTIFICATION_SINK", "log"),
            default_currency: env_string("DEFAULT_CURRENCY", "USD"),
        };

        let database = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable not set")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", default_max_connections()),
            min_connections: env_or("DB_MIN_CONNECTIONS", default_min_connections()),
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", default_acquire_timeout_secs()),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", default_idle_timeout_secs()),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", default_max_lifetime_secs()),
        };

        let auth = AuthConfig {
            jwt_secret: std::env::var("JWT_SECRET")
                .context("JWT_SECRET environment variable not set")?,
            jwt_issuer: std::env::var("JWT_ISSUER").ok(),
        };

        let fees = FeeConfig {
            platform_fee_bps: env_or("PLATFORM_FEE_BPS", default_platform_fee_bps()),
            processor_fee_bps: env_or("PROCESSOR_FEE_BPS", default_processor_fee_bps()),
            processor_fee_overrides: parse_fee_overrides(
                &std::env::var("PROCESSOR_FEE_OVERRIDES").unwrap_or_default(),
            )
            .context("Failed to parse PROCESSOR_FEE_OVERRIDES")?,
            withdrawal_fee_bps: env_or("WITHDRAWAL_FEE_BPS", limits::WITHDRAWAL_FEE_BPS),
        };
        fees.validate()?;

        let stripe = match std::env::var("STRIPE_SECRET_KEY") {
            Ok(secret_key) => Some(StripeConfig {
                secret_key,
                webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                    .context("STRIPE_WEBHOOK_SECRET is required when STRIPE_SECRET_KEY is set")?,
                api_base: std::env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| default_stripe_api_base()),
                subscription_product: env_string("STRIPE_SUBSCRIPTION_PRODUCT", "creator_subscription"),
                signature_tolerance_secs: env_or("STRIPE_SIGNATURE_TOLERANCE_SECS", 300),
            }),
            Err(_) => None,
        };

        let ccbill = match std::env::var("CCBILL_ACCOUNT_NUMBER") {
            Ok(account_number) => Some(CcbillConfig {
                account_number,
                subaccount: env_string("CCBILL_SUBACCOUNT", "0000"),
                api_token: std::env::var("CCBILL_API_TOKEN")
                    .context("CCBILL_API_TOKEN is required when CCBILL_ACCOUNT_NUMBER is set")?,
                webhook_salt: std::env::var("CCBILL_WEBHOOK_SALT")
                    .context("CCBILL_WEBHOOK_SALT is required when CCBILL_ACCOUNT_NUMBER is set")?,
                api_base: std::env::var("CCBILL_API_BASE")
                    .unwrap_or_else(|_| default_ccbill_api_base()),
            }),
            Err(_) => None,
        };

        let processors = ProcessorsConfig {
            stripe,
            ccbill,
            call_timeout_ms: env_or("PROCESSOR_TIMEOUT_MS", default_call_timeout_ms())
                .min(default_call_timeout_ms()),
            breaker_failure_threshold: env_or("PROCESSOR_BREAKER_FAILURES", 5),
            breaker_open_secs: env_or("PROCESSOR_BREAKER_OPEN_SECS", 30),
        };

        let webhooks = WebhookConfig {
            retry_base_secs: env_or("WEBHOOK_RETRY_BASE_SECS", 30),
            retry_max_secs: env_or("WEBHOOK_RETRY_MAX_SECS", 3600),
            max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", 12),
            lease_secs: env_or("WEBHOOK_LEASE_SECS", 60),
            retention_days: env_or("WEBHOOK_RETENTION_DAYS", 30),
        };

        let workers = WorkerConfig {
            webhook_retry_enabled: env_flag("WEBHOOK_RETRY_WORKER_ENABLED", true),
            webhook_poll_interval_secs: env_or("WEBHOOK_POLL_INTERVAL_SECS", 5),
            webhook_batch_size: env_or("WEBHOOK_BATCH_SIZE", 50),
            sweep_enabled: env_flag("SUBSCRIPTION_SWEEP_ENABLED", true),
            sweep_interval_secs: env_or("SUBSCRIPTION_SWEEP_INTERVAL_SECS", 60),
            sweep_batch_size: env_or("SUBSCRIPTION_SWEEP_BATCH_SIZE", 100),
        };

        Ok(Config {
            app,
            database,
            auth,
            fees,
            processors,
            webhooks,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "JWT_SECRET",
        "PORT",
        "PLATFORM_FEE_BPS",
        "PROCESSOR_FEE_BPS",
        "PROCESSOR_FEE_OVERRIDES",
        "PROCESSOR_TIMEOUT_MS",
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "CCBILL_ACCOUNT_NUMBER",
        "DB_IDLE_TIMEOUT_SECS",
        "DB_MAX_LIFETIME_SECS",
    ];

    fn reset_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("JWT_SECRET", "secret");
    }

    #[test]
    #[serial]
    fn test_default_values() {
        reset_env();

        let config = Config::from_env().unwrap();

        assert_eq!(config.app.env, "development");
        assert_eq!(config.app.http_port, 8090);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.idle_timeout_secs, 600);
        assert_eq!(config.database.max_lifetime_secs, 1800);
        assert_eq!(config.fees.platform_fee_bps, 1000);
        assert_eq!(config.fees.processor_fee_bps, 290);
        assert_eq!(config.processors.call_timeout(), Duration::from_secs(10));
        assert!(config.processors.stripe.is_none());
        assert!(config.processors.ccbill.is_none());
        assert_eq!(config.webhooks.retry_policy().max_attempts, 12);
    }

    #[test]
    #[serial]
    fn test_timeout_is_capped() {
        reset_env();
        std::env::set_var("PROCESSOR_TIMEOUT_MS", "60000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.processors.call_timeout_ms, 10_000);
    }

    #[test]
    #[serial]
    fn test_fee_rates_must_not_exceed_gross() {
        reset_env();
        std::env::set_var("PLATFORM_FEE_BPS", "9000");
        std::env::set_var("PROCESSOR_FEE_BPS", "2000");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_stripe_requires_webhook_secret() {
        reset_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test");
        assert!(Config::from_env().is_err());

        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        let config = Config::from_env().unwrap();
        let stripe = config.processors.stripe.unwrap();
        assert_eq!(stripe.api_base, "https://api.stripe.com/v1");
        assert_eq!(stripe.signature_tolerance_secs, 300);
    }

    #[test]
    fn test_rates_for_kind_and_processor() {
        let mut fees = FeeConfig::default();
        fees.processor_fee_overrides.insert("ccbill".into(), 1050);

        let tip = fees.rates_for(TransactionKind::Tip, "stripe");
        assert_eq!((tip.platform_bps, tip.processor_bps), (1000, 290));

        let ccbill = fees.rates_for(TransactionKind::Subscription, "ccbill");
        assert_eq!(ccbill.processor_bps, 1050);

        let deposit = fees.rates_for(TransactionKind::Deposit, "stripe");
        assert_eq!(deposit.platform_bps, 0);
    }

    #[test]
    fn test_parse_fee_overrides() {
        let parsed = parse_fee_overrides("ccbill=1050, stripe=290").unwrap();
        assert_eq!(parsed.get("ccbill"), Some(&1050));
        assert_eq!(parsed.get("stripe"), Some(&290));
        assert!(parse_fee_overrides("").unwrap().is_empty());
        assert!(parse_fee_overrides("ccbill").is_err());
    }
}
