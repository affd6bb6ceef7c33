// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::sampling::agent_rates::AgentRates;
use crate::sampling::decision::{SamplingDecision, SamplingMechanism};
use crate::sampling::rate_limiter::RateLimiter;
use crate::sampling::rate_sampler::RateSampler;
use crate::sampling::rules::{RuleSet, SamplingRule};
use crate::trace::Trace;

/// Decides, once per trace, whether it is kept.
///
/// Evaluation order:
/// 1. a decision already attached to the trace context (propagated or manual) is returned as is
/// 2. the highest priority rule matching the root span, as recorded on the trace context when a
///    partial chunk does not carry it
/// 3. the configured global rate
/// 4. the rate table most recently received from the agent
/// 5. keep everything
///
/// A tentative keep from steps 2-5 then spends a slot of the [`RateLimiter`] and becomes a
/// reject once the current window is exhausted.
///
/// Rules and rate tables sit behind `RwLock`s and are replaced wholesale, so readers always see
/// a complete table. Decisions already attached to a trace are never revisited by an update.
#[derive(Debug)]
pub struct Sampler {
    rules: RwLock<RuleSet>,
    default_rate: RwLock<Option<RateSampler>>,
    agent_rates: RwLock<Arc<AgentRates>>,
    limiter: RateLimiter,
    default_env: String,
}

impl Sampler {
    pub fn new(limiter: RateLimiter) -> Self {
        Sampler {
            rules: RwLock::new(RuleSet::default()),
            default_rate: RwLock::new(None),
            agent_rates: RwLock::new(Arc::new(AgentRates::default())),
            limiter,
            default_env: String::new(),
        }
    }

    /// Env used for rate table lookups when the root span carries no `env` tag.
    pub fn with_default_env(mut self, env: Option<&str>) -> Self {
        self.default_env = env.unwrap_or_default().to_string();
        self
    }

    pub fn with_default_rate(self, rate: Option<f64>) -> Self {
        self.set_default_rate(rate);
        self
    }

    pub fn with_rules(self, rules: Vec<SamplingRule>) -> Self {
        self.update_rules(rules);
        self
    }

    pub fn register_rule(&self, rule: SamplingRule) {
        debug!("Registering sampling rule {}", rule.name());
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rule);
    }

    pub fn update_rules(&self, rules: Vec<SamplingRule>) {
        let set = RuleSet::new(rules);
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = set;
    }

    pub fn set_default_rate(&self, rate: Option<f64>) {
        *self
            .default_rate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = rate.map(RateSampler::new);
    }

    pub fn update_agent_rates(&self, rates: AgentRates) {
        debug!("Applying {} agent sampling rates", rates.len());
        *self
            .agent_rates
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(rates);
    }

    /// Applies the rate table found in an agent response body.
    ///
    /// Returns whether a table was present. A malformed body leaves the current table in place.
    pub fn update_agent_rates_from_json(&self, body: &[u8]) -> Result<bool, serde_json::Error> {
        match AgentRates::parse_response(body)? {
            Some(rates) => {
                self.update_agent_rates(rates);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn agent_rates(&self) -> Arc<AgentRates> {
        Arc::clone(&self.agent_rates.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Returns the trace's decision, computing and attaching it if the trace has none yet.
    ///
    /// Chunks of one trace racing here spend at most one limiter slot between them.
    pub fn decide(&self, trace: &Trace) -> SamplingDecision {
        trace.context().decide_with(|| self.compute(trace))
    }

    fn compute(&self, trace: &Trace) -> SamplingDecision {
        let Some(root) = trace.sampling_root() else {
            return SamplingDecision::default();
        };

        let (mechanism, sampler) = self.select_sampler(trace, &root);
        let mut keep = sampler.map_or(true, |s| s.sample(trace.trace_id()));

        let mut limiter_rate = None;
        if keep {
            keep = self.limiter.is_allowed();
            limiter_rate = Some(self.limiter.effective_rate());
        }

        SamplingDecision {
            priority: mechanism.to_priority(keep),
            mechanism,
            rate: sampler.map(|s| s.sample_rate()),
            limiter_rate,
        }
    }

    fn select_sampler(
        &self,
        trace: &Trace,
        root: &crate::span::Span,
    ) -> (SamplingMechanism, Option<RateSampler>) {
        {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(rule) = rules.find_match(root) {
                return (SamplingMechanism::Rule, Some(RateSampler::new(rule.rate())));
            }
        }

        let default_rate = *self
            .default_rate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sampler) = default_rate {
            return (SamplingMechanism::Rule, Some(sampler));
        }

        let env = root
            .meta
            .get("env")
            .map(String::as_str)
            .unwrap_or(&self.default_env);
        if let Some(sampler) = self.agent_rates().lookup(&root.service, env) {
            return (SamplingMechanism::AgentRate, Some(sampler));
        }

        debug!(
            "No sampler configured for trace {}, keeping by default",
            trace.trace_id()
        );
        (SamplingMechanism::Default, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::decision::SamplingPriority;
    use crate::sampling::rate_limiter::ManualClock;
    use crate::span::Span;
    use crate::trace::TraceContext;
    use std::collections::HashMap;

    fn trace(trace_id: u64, service: &str) -> Trace {
        Trace::new(vec![Span::new("web.request", trace_id, 1, None).with_service(service)])
    }

    fn sampler(limit: i64) -> Sampler {
        Sampler::new(RateLimiter::with_clock(limit, Arc::new(ManualClock::new())))
    }

    #[test]
    fn test_upstream_decision_is_honored() {
        let sampler = sampler(0);
        let context = Arc::new(
            TraceContext::new(3).with_propagated_priority(SamplingPriority::UserKeep),
        );
        let trace = Trace::from_context(context, vec![Span::new("op", 3, 1, None)], false);
        let decision = sampler.decide(&trace);
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, SamplingMechanism::Default);
        assert_eq!(decision.limiter_rate, None);
    }

    #[test]
    fn test_decision_is_attached_once() {
        let sampler = sampler(-1);
        let trace = trace(11, "web");
        let first = sampler.decide(&trace);
        sampler.set_default_rate(Some(0.0));
        assert_eq!(sampler.decide(&trace), first);
        assert_eq!(trace.sampling_decision(), Some(first));
    }

    #[test]
    fn test_rule_beats_default_rate() {
        let sampler = sampler(-1)
            .with_default_rate(Some(0.0))
            .with_rules(vec![SamplingRule::new("high-priority", 10, 1.0, |s| {
                s.service == "checkout"
            })]);

        let decision = sampler.decide(&trace(5, "checkout"));
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, SamplingMechanism::Rule);
        assert_eq!(decision.rate, Some(1.0));

        let decision = sampler.decide(&trace(6, "other"));
        assert_eq!(decision.priority, SamplingPriority::UserReject);
        assert_eq!(decision.rate, Some(0.0));
    }

    #[test]
    fn test_agent_rates_apply_when_nothing_configured() {
        let sampler = sampler(-1).with_default_env(Some("prod"));
        let applied = sampler
            .update_agent_rates_from_json(
                br#"{"rate_by_service":{"service:web,env:prod":0,"service:,env:":1}}"#,
            )
            .expect("valid body");
        assert!(applied);

        let decision = sampler.decide(&trace(8, "web"));
        assert_eq!(decision.mechanism, SamplingMechanism::AgentRate);
        assert_eq!(decision.priority, SamplingPriority::AutoReject);

        let decision = sampler.decide(&trace(9, "api"));
        assert_eq!(decision.priority, SamplingPriority::AutoKeep);
        assert_eq!(decision.rate, Some(1.0));
    }

    #[test]
    fn test_span_env_overrides_default_env() {
        let sampler = sampler(-1).with_default_env(Some("prod"));
        sampler.update_agent_rates(AgentRates::from_rates(&HashMap::from([(
            "service:web,env:staging".to_string(),
            0.0,
        )])));
        let mut span = Span::new("op", 21, 1, None).with_service("web");
        span.set_tag("env", "staging");
        let decision = sampler.decide(&Trace::new(vec![span]));
        assert_eq!(decision.priority, SamplingPriority::AutoReject);
    }

    #[test]
    fn test_limiter_downgrades_keep() {
        let sampler = sampler(2);
        let priorities: Vec<SamplingPriority> = (1..=4)
            .map(|id| sampler.decide(&trace(id, "web")).priority)
            .collect();
        assert_eq!(
            priorities,
            vec![
                SamplingPriority::AutoKeep,
                SamplingPriority::AutoKeep,
                SamplingPriority::AutoReject,
                SamplingPriority::AutoReject
            ]
        );
        assert_eq!(sampler.limiter().effective_rate(), 0.5);
    }

    #[test]
    fn test_malformed_rate_table_keeps_previous() {
        let sampler = sampler(-1);
        sampler.update_agent_rates(AgentRates::from_rates(&HashMap::from([(
            "service:,env:".to_string(),
            0.0,
        )])));
        assert!(sampler.update_agent_rates_from_json(b"{not json").is_err());
        assert_eq!(sampler.agent_rates().len(), 1);
    }

    #[test]
    fn test_partial_chunk_uses_root_rule() {
        let sampler = sampler(-1)
            .with_default_rate(Some(0.0))
            .with_rules(vec![SamplingRule::new("high-priority", 10, 1.0, |s| {
                s.service == "checkout"
            })]);
        let context = Arc::new(TraceContext::new(31).with_partial_flush(2));
        let root =
            context.start_span(Span::new("web.request", 31, 1, None).with_service("checkout"));
        let a = context.start_span(Span::new("db.query", 31, 2, Some(1)).with_service("pg"));
        let b = context.start_span(Span::new("db.query", 31, 3, Some(1)).with_service("pg"));

        assert!(context.finish_span(a).is_none());
        let partial = context.finish_span(b).expect("partial chunk");
        let decision = sampler.decide(&partial);
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, SamplingMechanism::Rule);
        assert_eq!(decision.rate, Some(1.0));

        let rest = context.finish_span(root).expect("root chunk");
        assert_eq!(sampler.decide(&rest).priority, SamplingPriority::UserKeep);
    }

    #[test]
    fn test_concurrent_decisions_spend_one_limiter_slot() {
        let sampler = sampler(1);
        let trace = trace(41, "web");
        let decisions: Vec<SamplingDecision> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| sampler.decide(&trace)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("decider panicked"))
                .collect()
        });
        assert!(decisions.iter().all(|d| *d == decisions[0]));
        assert_eq!(decisions[0].priority, SamplingPriority::AutoKeep);
        assert_eq!(sampler.limiter().effective_rate(), 1.0);
    }

    #[test]
    fn test_checkout_rule_with_default_rate() {
        let sampler = sampler(1_000)
            .with_default_rate(Some(0.1))
            .with_rules(vec![SamplingRule::new("high-priority", 10, 1.0, |s| {
                s.service == "checkout"
            })]);

        for id in 1..=50u64 {
            assert!(sampler.decide(&trace(id, "checkout")).is_keep());
        }
        let kept = (1_001..=2_000u64)
            .filter(|id| sampler.decide(&trace(*id, "other")).is_keep())
            .count();
        assert!((70..=130).contains(&kept), "kept {kept} of 1000");
    }
}
