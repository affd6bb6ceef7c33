// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-trace keep/reject decisions: rules, a global rate, agent-provided rates and a limiter.

pub mod agent_rates;
pub mod decision;
pub mod glob_matcher;
pub mod rate_limiter;
pub mod rate_sampler;
pub mod rules;
pub mod sampler;

pub use decision::{SamplingDecision, SamplingMechanism, SamplingPriority};
pub use rate_limiter::{Clock, ManualClock, MonotonicClock, RateLimiter};
pub use rules::{SamplingRule, SamplingRuleConfig};
pub use sampler::Sampler;
