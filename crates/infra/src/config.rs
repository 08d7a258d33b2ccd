//! Runtime configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use ticketflow_observability::LogFormat;
use ticketflow_tickets::DEFAULT_MAX_PROOF_BYTES;

use crate::jobs::{JobExecutorConfig, RetryPolicy};
use crate::service::ServiceSettings;
use crate::workers::FinalizeSettings;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PROOF_BUCKET: &str = "bucket.tedx";
pub const DEFAULT_LEDGER_RANGE: &str = "Sheet1!A1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required when USE_PERSISTENT_STORES=true")]
    Missing { var: &'static str },
    #[error("{var} has invalid value `{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub log_format: LogFormat,
    pub proof_bucket: String,
    pub ledger_range: String,
    pub max_upload_bytes: usize,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub claim_timeout: Duration,
    pub max_attempts: u32,
    /// Deprecated: lets stage-1 tickets be verified without a proof.
    pub legacy_stage1_verify: bool,
    pub ticket_price: u64,
    /// Period of the analytics snapshot task; zero disables it.
    pub analytics_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            log_format: LogFormat::Json,
            proof_bucket: DEFAULT_PROOF_BUCKET.to_string(),
            ledger_range: DEFAULT_LEDGER_RANGE.to_string(),
            max_upload_bytes: DEFAULT_MAX_PROOF_BYTES,
            poll_interval: Duration::from_millis(250),
            max_concurrent: 4,
            claim_timeout: Duration::from_secs(300),
            max_attempts: 5,
            legacy_stage1_verify: false,
            ticket_price: 0,
            analytics_interval: Duration::from_secs(3600),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset or blank means default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let use_persistent_stores =
            parse_or(&get, "USE_PERSISTENT_STORES", defaults.use_persistent_stores)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing {
                var: "DATABASE_URL",
            });
        }

        let config = Self {
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            log_format: parse_or(&get, "TICKETFLOW_LOG_FORMAT", defaults.log_format)?,
            proof_bucket: get("TICKETFLOW_PROOF_BUCKET").unwrap_or(defaults.proof_bucket),
            ledger_range: get("TICKETFLOW_LEDGER_RANGE").unwrap_or(defaults.ledger_range),
            max_upload_bytes: parse_or(
                &get,
                "TICKETFLOW_MAX_UPLOAD_BYTES",
                defaults.max_upload_bytes,
            )?,
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "TICKETFLOW_POLL_INTERVAL_MS",
                250u64,
            )?),
            max_concurrent: parse_or(&get, "TICKETFLOW_MAX_CONCURRENT", defaults.max_concurrent)?,
            claim_timeout: Duration::from_secs(parse_or(
                &get,
                "TICKETFLOW_CLAIM_TIMEOUT_SECS",
                300u64,
            )?),
            max_attempts: parse_or(&get, "TICKETFLOW_MAX_ATTEMPTS", defaults.max_attempts)?,
            legacy_stage1_verify: parse_or(
                &get,
                "TICKETFLOW_LEGACY_STAGE1_VERIFY",
                defaults.legacy_stage1_verify,
            )?,
            ticket_price: parse_or(&get, "TICKETFLOW_TICKET_PRICE", defaults.ticket_price)?,
            analytics_interval: Duration::from_secs(parse_or(
                &get,
                "TICKETFLOW_ANALYTICS_INTERVAL_SECS",
                3600u64,
            )?),
        };

        if config.max_concurrent == 0 {
            return Err(invalid("TICKETFLOW_MAX_CONCURRENT", "0", "must be at least 1"));
        }
        if config.max_attempts == 0 {
            return Err(invalid("TICKETFLOW_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        Ok(config)
    }

    /// Policy applied to every queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("ticketflow-worker")
            .with_poll_interval(self.poll_interval)
            .with_max_concurrent(self.max_concurrent)
            .with_claim_timeout(self.claim_timeout)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            max_upload_bytes: self.max_upload_bytes,
            legacy_stage1_verify: self.legacy_stage1_verify,
            ticket_price: self.ticket_price,
        }
    }

    pub fn finalize_settings(&self) -> FinalizeSettings {
        FinalizeSettings {
            bucket: self.proof_bucket.clone(),
            ledger_range: self.ledger_range.clone(),
        }
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
