// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::sampling::glob_matcher::GlobMatcher;
use crate::sampling::rate_sampler::RateSampler;
use crate::span::Span;

type SpanPredicate = Arc<dyn Fn(&Span) -> bool + Send + Sync>;

/// One entry of `DD_TRACE_SAMPLING_RULES`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRuleConfig {
    pub sample_rate: f64,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub service: Option<String>,

    /// Glob over the span (operation) name. `name` is the rule's own label.
    #[serde(default)]
    pub operation: Option<String>,

    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Higher wins. When absent, earlier rules in the list rank above later ones.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl SamplingRuleConfig {
    /// Parses a JSON array of rules.
    pub fn parse_list(json: &str) -> Result<Vec<SamplingRuleConfig>, ConfigError> {
        let rules: Vec<SamplingRuleConfig> = serde_json::from_str(json)?;
        for rule in &rules {
            if !(0.0..=1.0).contains(&rule.sample_rate) {
                return Err(ConfigError::InvalidValue {
                    name: "DD_TRACE_SAMPLING_RULES",
                    value: format!("sample_rate {} is outside [0, 1]", rule.sample_rate),
                });
            }
        }
        Ok(rules)
    }
}

/// A named predicate over the root span, with the rate applied to traces it matches.
#[derive(Clone)]
pub struct SamplingRule {
    name: String,
    priority: i32,
    sampler: RateSampler,
    predicate: SpanPredicate,
}

impl fmt::Debug for SamplingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("rate", &self.sampler.sample_rate())
            .finish()
    }
}

impl SamplingRule {
    pub fn new<F>(name: &str, priority: i32, rate: f64, predicate: F) -> Self
    where
        F: Fn(&Span) -> bool + Send + Sync + 'static,
    {
        SamplingRule {
            name: name.to_string(),
            priority,
            sampler: RateSampler::new(rate),
            predicate: Arc::new(predicate),
        }
    }

    /// Builds a glob-based rule. `default_priority` applies when the config sets none.
    pub fn from_config(config: &SamplingRuleConfig, default_priority: i32) -> Self {
        let service = config.service.as_deref().map(GlobMatcher::new);
        let operation = config.operation.as_deref().map(GlobMatcher::new);
        let resource = config.resource.as_deref().map(GlobMatcher::new);
        let tags: Vec<(String, GlobMatcher)> = config
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), GlobMatcher::new(v)))
            .collect();

        let name = config.name.clone().unwrap_or_else(|| {
            format!(
                "service={},operation={},resource={}",
                config.service.as_deref().unwrap_or("*"),
                config.operation.as_deref().unwrap_or("*"),
                config.resource.as_deref().unwrap_or("*"),
            )
        });

        SamplingRule::new(
            &name,
            config.priority.unwrap_or(default_priority),
            config.sample_rate,
            move |span: &Span| {
                let field_matches = |matcher: &Option<GlobMatcher>, value: &str| {
                    matcher.as_ref().map_or(true, |m| m.matches(value))
                };
                field_matches(&service, &span.service)
                    && field_matches(&operation, &span.name)
                    && field_matches(&resource, &span.resource)
                    && tags.iter().all(|(key, matcher)| match span.meta.get(key) {
                        Some(value) => matcher.matches(value),
                        None => matcher.matches_everything(),
                    })
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn rate(&self) -> f64 {
        self.sampler.sample_rate()
    }

    pub fn matches(&self, span: &Span) -> bool {
        (self.predicate)(span)
    }

    pub fn sample(&self, trace_id: u64) -> bool {
        self.sampler.sample(trace_id)
    }
}

/// Rules kept in descending priority order. Ties keep registration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<SamplingRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<SamplingRule>) -> Self {
        let mut set = RuleSet::default();
        for rule in rules {
            set.insert(rule);
        }
        set
    }

    pub fn insert(&mut self, rule: SamplingRule) {
        let index = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(index, rule);
    }

    pub fn find_match(&self, span: &Span) -> Option<&SamplingRule> {
        self.rules.iter().find(|rule| rule.matches(span))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Converts a configured list, ranking earlier entries above later ones unless a priority is set.
pub fn rules_from_config(configs: &[SamplingRuleConfig]) -> Vec<SamplingRule> {
    let count = i32::try_from(configs.len()).unwrap_or(i32::MAX);
    configs
        .iter()
        .enumerate()
        .map(|(i, config)| {
            let position = i32::try_from(i).unwrap_or(i32::MAX);
            SamplingRule::from_config(config, count.saturating_sub(position))
        })
        .collect()
}
