// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::Deserialize;

use crate::sampling::rate_sampler::RateSampler;

/// Key the agent uses for the rate that applies to unlisted services.
pub const DEFAULT_RATE_KEY: &str = "service:,env:";

/// Body of a successful `/v0.4/traces` response.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    rate_by_service: Option<HashMap<String, f64>>,
}

pub fn rate_key(service: &str, env: &str) -> String {
    format!("service:{service},env:{env}")
}

/// Per service/env rates computed by the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRates {
    by_key: HashMap<String, RateSampler>,
}

impl AgentRates {
    pub fn from_rates(rates: &HashMap<String, f64>) -> Self {
        AgentRates {
            by_key: rates
                .iter()
                .map(|(key, rate)| (key.clone(), RateSampler::new(*rate)))
                .collect(),
        }
    }

    /// Extracts the rate table from an agent response body.
    ///
    /// Returns `Ok(None)` for an empty body or a body without `rate_by_service`.
    pub fn parse_response(body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let response: AgentResponse = serde_json::from_slice(body)?;
        Ok(response.rate_by_service.as_ref().map(Self::from_rates))
    }

    /// The rate for `service`/`env`, falling back to the agent's default entry.
    pub fn lookup(&self, service: &str, env: &str) -> Option<RateSampler> {
        self.by_key
            .get(&rate_key(service, env))
            .or_else(|| self.by_key.get(DEFAULT_RATE_KEY))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
