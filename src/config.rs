use chrono::Duration;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

const MAX_TIMEOUT_SECONDS: u64 = 600;
const MAX_RETRIES: u32 = 10;
const MAX_BACKOFF_MS: u64 = 60_000;
const MAX_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;

use crate::{
    admission::Policy,
    api::CallerKey,
    error::Error,
    external::{openai::OpenAIConfig, retry::RetryPolicy},
};

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub openai: OpenAIConfig,
    pub retry: RetryPolicy,
    pub policy: Policy,
    pub caller_key: CallerKey,
}

impl Settings {
    /// Reads settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::config_error("OPENAI_API_KEY is not set"))?;

        let timeout_seconds = bounded(&lookup, "MODEL_TIMEOUT_SECONDS", 30, 1, MAX_TIMEOUT_SECONDS)?;
        let max_retries = bounded(&lookup, "MODEL_MAX_RETRIES", 2, 0, MAX_RETRIES)?;
        let backoff_ms = bounded(&lookup, "MODEL_RETRY_BACKOFF_MS", 500, 0, MAX_BACKOFF_MS)?;
        let window_seconds =
            bounded(&lookup, "RATE_LIMIT_WINDOW_SECONDS", 60, 1, MAX_WINDOW_SECONDS)?;

        let caller_mode = lookup("RATE_LIMIT_KEY");
        let caller_key = CallerKey::new(
            caller_mode.as_deref().map(str::trim).unwrap_or("global"),
            lookup("RATE_LIMIT_API_KEYS").as_deref(),
        )?;

        Ok(Self {
            bind_address: parse_or(
                &lookup,
                "BIND_ADDRESS",
                SocketAddr::from(([127, 0, 0, 1], 3000)),
            )?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            openai: OpenAIConfig {
                api_key,
                api_base: lookup("OPENAI_API_BASE")
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                discovery_model: lookup("DISCOVERY_MODEL").unwrap_or_else(|| "gpt-4o".into()),
                structuring_model: lookup("STRUCTURING_MODEL")
                    .unwrap_or_else(|| "gpt-4o-mini".into()),
                timeout: std::time::Duration::from_secs(timeout_seconds),
            },
            retry: RetryPolicy {
                timeout: std::time::Duration::from_secs(timeout_seconds),
                max_retries,
                backoff: std::time::Duration::from_millis(backoff_ms),
            },
            policy: Policy {
                capacity: parse_or(&lookup, "RATE_LIMIT_CAPACITY", 10)?,
                window: Duration::seconds(window_seconds),
            },
            caller_key,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::config_error(format!("invalid value for {}", name))),
        None => Ok(default),
    }
}

fn bounded<F, T>(lookup: &F, name: &str, default: T, min: T, max: T) -> Result<T, Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + std::fmt::Display,
{
    let value = parse_or(lookup, name, default)?;

    if value < min || value > max {
        return Err(Error::config_error(format!(
            "{} must be between {} and {}",
            name, min, max
        )));
    }

    Ok(value)
}

#[cfg(test)]
fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    move |name: &str| vars.get(name).cloned()
}

#[test]
fn defaults() {
    let settings = Settings::from_lookup(lookup_from(&[("OPENAI_API_KEY", "sk-test")])).unwrap();

    assert_eq!(settings.bind_address, "127.0.0.1:3000".parse().unwrap());
    assert_eq!(settings.database_url, None);
    assert_eq!(settings.policy, Policy::default());
    assert_eq!(settings.caller_key, CallerKey::Global);
    assert_eq!(settings.retry.max_retries, 2);
    assert_eq!(settings.retry.timeout, std::time::Duration::from_secs(30));
    assert_eq!(settings.openai.api_base, "https://api.openai.com/v1");
}

#[test]
fn overrides() {
    let settings = Settings::from_lookup(lookup_from(&[
        ("OPENAI_API_KEY", "sk-test"),
        ("BIND_ADDRESS", "0.0.0.0:8080"),
        ("DATABASE_URL", "postgresql://localhost/placefinder"),
        ("RATE_LIMIT_CAPACITY", "3"),
        ("RATE_LIMIT_WINDOW_SECONDS", "5"),
        ("RATE_LIMIT_KEY", "address"),
        ("MODEL_MAX_RETRIES", "0"),
    ]))
    .unwrap();

    assert_eq!(settings.bind_address.port(), 8080);
    assert_eq!(
        settings.database_url.as_deref(),
        Some("postgresql://localhost/placefinder")
    );
    assert_eq!(settings.policy.capacity, 3);
    assert_eq!(settings.policy.window, Duration::seconds(5));
    assert_eq!(settings.caller_key, CallerKey::ClientAddress);
    assert_eq!(settings.retry.max_retries, 0);
}

#[test]
fn missing_api_key_is_rejected() {
    let err = Settings::from_lookup(lookup_from(&[])).unwrap_err();
    assert_eq!(err.code, 1);
}

#[test]
fn unparsable_values_are_rejected() {
    for (name, value) in [
        ("RATE_LIMIT_CAPACITY", "ten"),
        ("RATE_LIMIT_WINDOW_SECONDS", "0"),
        ("RATE_LIMIT_WINDOW_SECONDS", "-60"),
        ("RATE_LIMIT_WINDOW_SECONDS", "10000000000000"),
        ("RATE_LIMIT_WINDOW_SECONDS", "9223372036854775807"),
        ("MODEL_RETRY_BACKOFF_MS", "18446744073709551615"),
        ("MODEL_TIMEOUT_SECONDS", "0"),
        ("MODEL_TIMEOUT_SECONDS", "99999999999"),
        ("MODEL_MAX_RETRIES", "4294967295"),
        ("RATE_LIMIT_KEY", "cookie"),
        ("RATE_LIMIT_KEY", "api_key"),
        ("BIND_ADDRESS", "localhost"),
    ] {
        let result =
            Settings::from_lookup(lookup_from(&[("OPENAI_API_KEY", "sk-test"), (name, value)]));
        assert!(result.is_err(), "{} = {} should be rejected", name, value);
    }
}

#[test]
fn api_key_mode_reads_issued_keys() {
    let settings = Settings::from_lookup(lookup_from(&[
        ("OPENAI_API_KEY", "sk-test"),
        ("RATE_LIMIT_KEY", "api_key"),
        ("RATE_LIMIT_API_KEYS", "team-a=key-a,team-b=key-b"),
    ]))
    .unwrap();

    assert!(matches!(settings.caller_key, CallerKey::ApiKey(_)));
    assert!(!format!("{:?}", settings).contains("key-a"));
}

#[test]
fn largest_accepted_window_is_usable() {
    let settings = Settings::from_lookup(lookup_from(&[
        ("OPENAI_API_KEY", "sk-test"),
        ("RATE_LIMIT_WINDOW_SECONDS", "604800"),
        ("MODEL_RETRY_BACKOFF_MS", "60000"),
        ("MODEL_MAX_RETRIES", "10"),
    ]))
    .unwrap();

    assert_eq!(settings.policy.window, Duration::seconds(MAX_WINDOW_SECONDS));

    let mut window = crate::admission::SlidingWindow::default();
    assert!(window.try_admit(&settings.policy, chrono::Utc::now()));
    assert!(settings.retry.delay(MAX_RETRIES) > std::time::Duration::ZERO);
}
