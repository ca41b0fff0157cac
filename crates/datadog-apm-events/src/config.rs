// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::ConfigError;
use crate::rate_counter::{DEFAULT_DECAY_FACTOR, DEFAULT_DECAY_PERIOD};

const DEFAULT_MAX_EPS: f64 = 200.0;
const DEFAULT_MAX_EVENTS_PER_TRACE: i64 = 200;
const DEFAULT_STATS_BUCKET_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STATS_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// service -> operation -> extraction rate
    pub analyzed_spans_by_service: HashMap<String, HashMap<String, f64>>,
    /// service -> extraction rate, only used when `analyzed_spans_by_service` is empty
    pub analyzed_rate_by_service_legacy: HashMap<String, f64>,
    /// negative: unbounded, zero: no events at all
    pub max_events_per_trace: i64,
    /// target for the events kept on top of those whose trace was sampled
    pub max_eps: f64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub decay_period: Duration,
    pub decay_factor: f64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub stats_bucket_interval: Duration,
    pub stats_epsilon: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            analyzed_spans_by_service: HashMap::new(),
            analyzed_rate_by_service_legacy: HashMap::new(),
            max_events_per_trace: DEFAULT_MAX_EVENTS_PER_TRACE,
            max_eps: DEFAULT_MAX_EPS,
            decay_period: DEFAULT_DECAY_PERIOD,
            decay_factor: DEFAULT_DECAY_FACTOR,
            stats_bucket_interval: DEFAULT_STATS_BUCKET_INTERVAL,
            stats_epsilon: DEFAULT_STATS_EPSILON,
        }
    }
}

impl Config {
    /// Builds the configuration from `DD_*` environment variables on top of the defaults.
    pub fn new() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Ok(spans) = env::var("DD_APM_ANALYZED_SPANS") {
            config.analyzed_spans_by_service = parse_analyzed_spans(&spans)?;
        }
        if let Ok(rates) = env::var("DD_APM_ANALYZED_RATE_BY_SERVICE") {
            config.analyzed_rate_by_service_legacy = parse_analyzed_rate_by_service(&rates)?;
        }
        if let Some(max_events) = env_parse::<i64>("DD_APM_MAX_EVENTS_PER_TRACE")? {
            config.max_events_per_trace = max_events;
        }
        if let Some(max_eps) = env_parse::<f64>("DD_APM_MAX_EPS")? {
            config.max_eps = max_eps;
        } else if let Some(max_eps) = env_parse::<f64>("DD_MAX_EPS")? {
            config.max_eps = max_eps;
        }
        if let Some(secs) = env_parse::<f64>("DD_APM_EVENTS_DECAY_PERIOD_SECS")? {
            config.decay_period = duration_from_secs("DD_APM_EVENTS_DECAY_PERIOD_SECS", secs)?;
        }
        if let Some(factor) = env_parse::<f64>("DD_APM_EVENTS_DECAY_FACTOR")? {
            config.decay_factor = factor;
        }
        if let Some(secs) = env_parse::<f64>("DD_APM_STATS_BUCKET_INTERVAL_SECS")? {
            config.stats_bucket_interval =
                duration_from_secs("DD_APM_STATS_BUCKET_INTERVAL_SECS", secs)?;
        }
        if let Some(epsilon) = env_parse::<f64>("DD_APM_STATS_EPSILON")? {
            config.stats_epsilon = epsilon;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (service, operations) in &self.analyzed_spans_by_service {
            for (operation, rate) in operations {
                validate_rate(&format!("{service}|{operation}"), *rate)?;
            }
        }
        for (service, rate) in &self.analyzed_rate_by_service_legacy {
            validate_rate(service, *rate)?;
        }
        if !self.max_eps.is_finite() || self.max_eps <= 0.0 {
            return Err(ConfigError::InvalidMaxEps(self.max_eps));
        }
        if self.decay_period.is_zero() {
            return Err(ConfigError::InvalidDecayPeriod(self.decay_period));
        }
        if !self.decay_factor.is_finite() || self.decay_factor <= 1.0 {
            return Err(ConfigError::InvalidDecayFactor(self.decay_factor));
        }
        if self.stats_bucket_interval.is_zero() {
            return Err(ConfigError::InvalidBucketInterval(self.stats_bucket_interval));
        }
        if !(self.stats_epsilon > 0.0 && self.stats_epsilon < 1.0) {
            return Err(ConfigError::InvalidEpsilon(self.stats_epsilon));
        }
        Ok(())
    }
}

pub(crate) fn validate_rate(target: &str, rate: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate {
            target: target.to_string(),
            rate,
        })
    }
}

fn env_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                key,
                reason: format!("'{value}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn duration_from_secs(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Parse {
        key,
        reason: format!("'{secs}': {e}"),
    })
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn parse_rate(key: &'static str, entry: &str, rate: &str) -> Result<f64, ConfigError> {
    rate.trim().parse::<f64>().map_err(|e| ConfigError::Parse {
        key,
        reason: format!("invalid rate in '{entry}': {e}"),
    })
}

/// Parses `service|operation=rate` entries separated by commas.
pub fn parse_analyzed_spans(
    value: &str,
) -> Result<HashMap<String, HashMap<String, f64>>, ConfigError> {
    const KEY: &str = "DD_APM_ANALYZED_SPANS";
    let mut analyzed_spans: HashMap<String, HashMap<String, f64>> = HashMap::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let malformed = || ConfigError::Parse {
            key: KEY,
            reason: format!("expected 'service|operation=rate', got '{entry}'"),
        };
        let (key, rate) = entry.split_once('=').ok_or_else(malformed)?;
        let (service, operation) = key.split_once('|').ok_or_else(malformed)?;
        let (service, operation) = (service.trim(), operation.trim());
        if service.is_empty() || operation.is_empty() {
            return Err(malformed());
        }
        let rate = parse_rate(KEY, entry, rate)?;
        analyzed_spans
            .entry(service.to_string())
            .or_default()
            .insert(operation.to_string(), rate);
    }

    Ok(analyzed_spans)
}

/// Parses `service=rate` entries separated by commas.
pub fn parse_analyzed_rate_by_service(value: &str) -> Result<HashMap<String, f64>, ConfigError> {
    const KEY: &str = "DD_APM_ANALYZED_RATE_BY_SERVICE";
    let mut rates = HashMap::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (service, rate) = entry
            .split_once('=')
            .filter(|(service, _)| !service.trim().is_empty())
            .ok_or_else(|| ConfigError::Parse {
                key: KEY,
                reason: format!("expected 'service=rate', got '{entry}'"),
            })?;
        rates.insert(service.trim().to_string(), parse_rate(KEY, entry, rate)?);
    }

    Ok(rates)
}
