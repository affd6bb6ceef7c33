// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Keep/reject classification attached to a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingPriority {
    UserReject,
    AutoReject,
    AutoKeep,
    UserKeep,
}

impl SamplingPriority {
    pub fn value(self) -> i8 {
        match self {
            SamplingPriority::UserReject => -1,
            SamplingPriority::AutoReject => 0,
            SamplingPriority::AutoKeep => 1,
            SamplingPriority::UserKeep => 2,
        }
    }

    pub fn from_value(value: i8) -> Option<Self> {
        match value {
            -1 => Some(SamplingPriority::UserReject),
            0 => Some(SamplingPriority::AutoReject),
            1 => Some(SamplingPriority::AutoKeep),
            2 => Some(SamplingPriority::UserKeep),
            _ => None,
        }
    }

    pub fn is_keep(self) -> bool {
        self.value() > 0
    }
}

impl fmt::Display for SamplingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// The subsystem that produced a sampling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplingMechanism {
    /// No sampler was involved, or the priority was propagated from upstream.
    #[default]
    Default,
    AgentRate,
    RemoteRate,
    /// A sampling rule or the global rate configured on the tracer.
    Rule,
    Manual,
    AppSec,
    RemoteUserRate,
}

impl SamplingMechanism {
    pub fn value(self) -> u8 {
        match self {
            SamplingMechanism::Default => 0,
            SamplingMechanism::AgentRate => 1,
            SamplingMechanism::RemoteRate => 2,
            SamplingMechanism::Rule => 3,
            SamplingMechanism::Manual => 4,
            SamplingMechanism::AppSec => 5,
            SamplingMechanism::RemoteUserRate => 6,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(SamplingMechanism::Default),
            1 => Some(SamplingMechanism::AgentRate),
            2 => Some(SamplingMechanism::RemoteRate),
            3 => Some(SamplingMechanism::Rule),
            4 => Some(SamplingMechanism::Manual),
            5 => Some(SamplingMechanism::AppSec),
            6 => Some(SamplingMechanism::RemoteUserRate),
            _ => None,
        }
    }

    /// Maps a keep/reject outcome onto the priority pair this mechanism is allowed to emit.
    pub fn to_priority(self, keep: bool) -> SamplingPriority {
        let user = matches!(
            self,
            SamplingMechanism::Rule
                | SamplingMechanism::Manual
                | SamplingMechanism::AppSec
                | SamplingMechanism::RemoteUserRate
        );
        match (user, keep) {
            (true, true) => SamplingPriority::UserKeep,
            (true, false) => SamplingPriority::UserReject,
            (false, true) => SamplingPriority::AutoKeep,
            (false, false) => SamplingPriority::AutoReject,
        }
    }
}

/// Rendered as the `_dd.p.dm` decision maker tag.
impl fmt::Display for SamplingMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}", self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub priority: SamplingPriority,
    pub mechanism: SamplingMechanism,
    /// Probability the sampler used, if a rate was involved.
    pub rate: Option<f64>,
    /// Effective rate of the limiter at decision time, if the limiter was consulted.
    pub limiter_rate: Option<f64>,
}

impl SamplingDecision {
    pub fn new(priority: SamplingPriority, mechanism: SamplingMechanism) -> Self {
        SamplingDecision {
            priority,
            mechanism,
            rate: None,
            limiter_rate: None,
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn is_keep(&self) -> bool {
        self.priority.is_keep()
    }
}

impl Default for SamplingDecision {
    fn default() -> Self {
        SamplingDecision::new(SamplingPriority::AutoKeep, SamplingMechanism::Default)
    }
}
