// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::api::{AgentEndpoint, DEFAULT_AGENT_HOST, DEFAULT_AGENT_PORT};
use crate::buffer::{
    BufferConfig, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_SPANS, DEFAULT_MAX_PENDING_BATCHES,
};
use crate::errors::ConfigError;
use crate::sampling::SamplingRuleConfig;
use crate::writer::{
    WriterConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
};

const DEFAULT_RATE_LIMIT: i64 = 100;
const DEFAULT_PARTIAL_FLUSH_MIN_SPANS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub agent_endpoint: AgentEndpoint,
    /// Service given to spans submitted without one.
    pub service: Option<String>,
    pub env: Option<String>,
    pub version: Option<String>,
    /// Global rate applied when no rule matches. Agent rates are used when unset.
    pub sample_rate: Option<f64>,
    /// Kept traces per second. Negative disables the limiter.
    pub rate_limit: i64,
    pub sampling_rules: Vec<SamplingRuleConfig>,
    pub buffer: BufferConfig,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub partial_flush_enabled: bool,
    pub partial_flush_min_spans: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent_endpoint: AgentEndpoint::new(DEFAULT_AGENT_HOST, DEFAULT_AGENT_PORT),
            service: None,
            env: None,
            version: None,
            sample_rate: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            sampling_rules: Vec::new(),
            buffer: BufferConfig {
                max_batch_spans: DEFAULT_MAX_BATCH_SPANS,
                max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
                max_pending_batches: DEFAULT_MAX_PENDING_BATCHES,
            },
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            partial_flush_enabled: false,
            partial_flush_min_spans: DEFAULT_PARTIAL_FLUSH_MIN_SPANS,
        }
    }
}

impl Config {
    /// Reads the `DD_*` tracer variables. Unset or blank variables keep their defaults.
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        // DD_TRACE_AGENT_URL wins over the host/port pair
        let agent_endpoint = match read_var("DD_TRACE_AGENT_URL") {
            Some(url) => AgentEndpoint::parse(&url)?,
            None => AgentEndpoint::new(
                &read_var("DD_AGENT_HOST").unwrap_or_else(|| DEFAULT_AGENT_HOST.to_string()),
                parse_var("DD_TRACE_AGENT_PORT")?.unwrap_or(DEFAULT_AGENT_PORT),
            ),
        };

        let sampling_rules = match read_var("DD_TRACE_SAMPLING_RULES") {
            Some(json) => SamplingRuleConfig::parse_list(&json)?,
            None => Vec::new(),
        };

        let config = Config {
            agent_endpoint,
            service: read_var("DD_SERVICE"),
            env: read_var("DD_ENV"),
            version: read_var("DD_VERSION"),
            sample_rate: parse_var("DD_TRACE_SAMPLE_RATE")?,
            rate_limit: parse_var("DD_TRACE_RATE_LIMIT")?.unwrap_or(defaults.rate_limit),
            sampling_rules,
            buffer: BufferConfig {
                max_batch_spans: parse_var("DD_TRACE_BATCH_MAX_SPANS")?
                    .unwrap_or(defaults.buffer.max_batch_spans),
                max_batch_bytes: parse_var("DD_TRACE_BATCH_MAX_BYTES")?
                    .unwrap_or(defaults.buffer.max_batch_bytes),
                max_pending_batches: parse_var("DD_TRACE_BUFFER_MAX_BATCHES")?
                    .unwrap_or(defaults.buffer.max_pending_batches),
            },
            flush_interval: parse_millis("DD_TRACE_FLUSH_INTERVAL_MS")?
                .unwrap_or(defaults.flush_interval),
            request_timeout: parse_millis("DD_TRACE_AGENT_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            shutdown_timeout: parse_millis("DD_TRACE_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
            partial_flush_enabled: parse_bool("DD_TRACE_PARTIAL_FLUSH_ENABLED")?
                .unwrap_or(defaults.partial_flush_enabled),
            partial_flush_min_spans: parse_var("DD_TRACE_PARTIAL_FLUSH_MIN_SPANS")?
                .unwrap_or(defaults.partial_flush_min_spans),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rate) = self.sample_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::InvalidValue {
                    name: "DD_TRACE_SAMPLE_RATE",
                    value: rate.to_string(),
                });
            }
        }
        if let Some(rule) = self
            .sampling_rules
            .iter()
            .find(|rule| !(0.0..=1.0).contains(&rule.sample_rate))
        {
            return Err(ConfigError::InvalidValue {
                name: "DD_TRACE_SAMPLING_RULES",
                value: format!("sample_rate {} is outside [0, 1]", rule.sample_rate),
            });
        }

        let thresholds = [
            ("DD_TRACE_BATCH_MAX_SPANS", self.buffer.max_batch_spans),
            ("DD_TRACE_BATCH_MAX_BYTES", self.buffer.max_batch_bytes),
            ("DD_TRACE_BUFFER_MAX_BATCHES", self.buffer.max_pending_batches),
            ("DD_TRACE_PARTIAL_FLUSH_MIN_SPANS", self.partial_flush_min_spans),
        ];
        if let Some(&(name, _)) = thresholds.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidValue {
                name,
                value: "0".to_string(),
            });
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "agent timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            flush_interval: self.flush_interval,
            request_timeout: self.request_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    read_var(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}

fn parse_millis(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

fn parse_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    read_var(name)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value }),
        })
        .transpose()
}
