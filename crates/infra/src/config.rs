//! Process configuration.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::WelcomeTemplate;
use crate::jobs::{LaneConfig, RetryPolicy, WorkerPoolConfig};
use crate::scheduler::Timezone;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// WhatsApp Cloud API credentials. Absent means messages are only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatsAppConfig {
    pub base_url: String,
    pub phone_number_id: String,
    pub access_token: String,
}

/// Configuration loaded from environment variables.
///
/// Every field has a development default.
///
/// | Env Var                           | Default                            |
/// |-----------------------------------|------------------------------------|
/// | `BIND_ADDR`                       | `0.0.0.0:8080`                     |
/// | `DATABASE_URL`                    | unset: in-memory stores            |
/// | `DATABASE_MAX_CONNECTIONS`        | `10`                               |
/// | `WHATSAPP_API_BASE`               | `https://graph.facebook.com/v18.0` |
/// | `WHATSAPP_PHONE_NUMBER_ID`        | unset: logging gateway             |
/// | `WHATSAPP_ACCESS_TOKEN`           | unset: logging gateway             |
/// | `WEBHOOK_VERIFY_TOKEN`            | empty: handshake always refused    |
/// | `ADMIN_API_TOKEN`                 | empty: admin routes refused        |
/// | `QUEUE_RATE_LIMIT_PER_SEC`        | `10`                               |
/// | `QUEUE_CONCURRENCY`               | `5`                                |
/// | `JOB_MAX_ATTEMPTS`                | `3`                                |
/// | `JOB_BACKOFF_BASE_SECS`           | `60`                               |
/// | `JOB_TIMEOUT_SECS`                | `300`                              |
/// | `JOB_COMPLETED_RETENTION_SECS`    | `3600`                             |
/// | `JOB_FAILED_RETENTION_SECS`       | `604800`                           |
/// | `WORKER_POLL_INTERVAL_MS`         | `500`                              |
/// | `SEND_TIMEOUT_SECS`               | `60`                               |
/// | `INTER_MESSAGE_DELAY_MS`          | `3000`                             |
/// | `REPLY_CONTEXT_TTL_SECS`          | `665280`                           |
/// | `REPLY_CONTEXT_FALLBACK_AGE_SECS` | `691200`                           |
/// | `SWEEP_INTERVAL_SECS`             | `3600`                             |
/// | `DEFAULT_UTC_OFFSET`              | `+00:00`                           |
/// | `WELCOME_TEMPLATE`                | unset: plain text welcome          |
/// | `TEMPLATE_LANGUAGE`               | `en_US`                            |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub whatsapp: Option<WhatsAppConfig>,
    pub webhook_verify_token: String,
    pub admin_api_token: String,
    pub rate_limit_per_sec: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub job_timeout: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    pub poll_interval: Duration,
    pub send_timeout: Duration,
    pub message_delay: Duration,
    pub context_ttl: Duration,
    pub context_fallback_age: Duration,
    pub sweep_interval: Duration,
    pub default_timezone: Timezone,
    pub welcome_template: Option<WelcomeTemplate>,
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let whatsapp = match (
            vars.optional("WHATSAPP_PHONE_NUMBER_ID"),
            vars.optional("WHATSAPP_ACCESS_TOKEN"),
        ) {
            (Some(phone_number_id), Some(access_token)) => Some(WhatsAppConfig {
                base_url: vars.string("WHATSAPP_API_BASE", "https://graph.facebook.com/v18.0"),
                phone_number_id,
                access_token,
            }),
            _ => None,
        };

        let welcome_template = vars.optional("WELCOME_TEMPLATE").map(|name| WelcomeTemplate {
            name,
            language: vars.string("TEMPLATE_LANGUAGE", "en_US"),
        });

        Ok(Self {
            bind_addr: vars.parsed("BIND_ADDR", "0.0.0.0:8080")?,
            database_url: vars.optional("DATABASE_URL"),
            database_max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", "10")?,
            whatsapp,
            webhook_verify_token: vars.string("WEBHOOK_VERIFY_TOKEN", ""),
            admin_api_token: vars.string("ADMIN_API_TOKEN", ""),
            rate_limit_per_sec: vars.positive("QUEUE_RATE_LIMIT_PER_SEC", 10)?,
            concurrency: vars.positive("QUEUE_CONCURRENCY", 5)?,
            max_attempts: vars.positive("JOB_MAX_ATTEMPTS", 3)?,
            backoff_base: vars.seconds("JOB_BACKOFF_BASE_SECS", 60)?,
            job_timeout: vars.seconds("JOB_TIMEOUT_SECS", 300)?,
            completed_retention: vars.seconds("JOB_COMPLETED_RETENTION_SECS", 3600)?,
            failed_retention: vars.seconds("JOB_FAILED_RETENTION_SECS", 604_800)?,
            poll_interval: vars.millis("WORKER_POLL_INTERVAL_MS", 500)?,
            send_timeout: vars.seconds("SEND_TIMEOUT_SECS", 60)?,
            message_delay: vars.millis("INTER_MESSAGE_DELAY_MS", 3000)?,
            context_ttl: vars.seconds("REPLY_CONTEXT_TTL_SECS", 665_280)?,
            context_fallback_age: vars.seconds("REPLY_CONTEXT_FALLBACK_AGE_SECS", 691_200)?,
            sweep_interval: vars.seconds("SWEEP_INTERVAL_SECS", 3600)?,
            default_timezone: vars.parsed("DEFAULT_UTC_OFFSET", "+00:00")?,
            welcome_template,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base, Duration::from_secs(3600))
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::uniform(
            LaneConfig {
                concurrency: self.concurrency,
                rate_limit_per_sec: self.rate_limit_per_sec,
            },
            self.poll_interval,
        )
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, name: &'static str, default: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.string(name, default);
        value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        })
    }

    fn positive<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialOrd + Default + ToString,
        T::Err: std::fmt::Display,
    {
        let value: T = self.parsed(name, &default.to_string())?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                name,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn seconds(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parsed::<u64>(name, &default.to_string())
            .map(Duration::from_secs)
    }

    fn millis(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parsed::<u64>(name, &default.to_string())
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.database_url.is_none());
        assert!(config.whatsapp.is_none());
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.rate_limit_per_sec, 10);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.context_ttl, Duration::from_secs(665_280));
        assert_eq!(config.message_delay, Duration::from_millis(3000));
        assert_eq!(config.default_timezone, Timezone::utc());
        assert!(config.welcome_template.is_none());
    }

    #[test]
    fn whatsapp_needs_both_credentials() {
        let partial = load(&[("WHATSAPP_PHONE_NUMBER_ID", "123")]).unwrap();
        assert!(partial.whatsapp.is_none());

        let full = load(&[
            ("WHATSAPP_PHONE_NUMBER_ID", "123"),
            ("WHATSAPP_ACCESS_TOKEN", "secret"),
            ("WHATSAPP_API_BASE", "http://localhost:9000"),
        ])
        .unwrap();
        let whatsapp = full.whatsapp.unwrap();
        assert_eq!(whatsapp.base_url, "http://localhost:9000");
        assert_eq!(whatsapp.phone_number_id, "123");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("QUEUE_CONCURRENCY", "2"),
            ("DEFAULT_UTC_OFFSET", "+05:30"),
            ("WELCOME_TEMPLATE", "hello_world"),
            ("JOB_BACKOFF_BASE_SECS", "5"),
        ])
        .unwrap();

        assert_eq!(config.worker_pool().lanes.len(), 5);
        assert_eq!(config.retry_policy().base_delay, Duration::from_secs(5));
        assert_eq!(config.default_timezone.to_string(), "+05:30");
        assert_eq!(
            config.welcome_template,
            Some(WelcomeTemplate {
                name: "hello_world".to_string(),
                language: "en_US".to_string(),
            })
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = load(&[("QUEUE_CONCURRENCY", "0")]).unwrap_err();
        assert!(err.to_string().contains("QUEUE_CONCURRENCY"));

        let err = load(&[("DEFAULT_UTC_OFFSET", "Mars/Base")]).unwrap_err();
        assert!(err.to_string().contains("DEFAULT_UTC_OFFSET"));

        assert!(load(&[("BIND_ADDR", "nowhere")]).is_err());
    }
}
