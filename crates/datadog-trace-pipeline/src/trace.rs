// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::errors::WriteError;
use crate::sampling::decision::{SamplingDecision, SamplingMechanism, SamplingPriority};
use crate::span::Span;

pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";
pub const DECISION_MAKER_KEY: &str = "_dd.p.dm";
pub const RULE_RATE_KEY: &str = "_dd.rule_psr";
pub const AGENT_RATE_KEY: &str = "_dd.agent_psr";
pub const LIMITER_RATE_KEY: &str = "_dd.limit_psr";

#[derive(Debug, Default)]
struct ContextState {
    /// The first span started, as it was when started.
    root: Option<Span>,
    open_spans: usize,
    finished: Vec<Span>,
}

/// State shared by every span of one trace while it is being recorded.
///
/// The sampling decision lives here, not on the spans, so every chunk of the trace observes the
/// same decision, including a later manual override.
#[derive(Debug)]
pub struct TraceContext {
    trace_id: u64,
    decision: RwLock<Option<SamplingDecision>>,
    state: Mutex<ContextState>,
    partial_flush_min_spans: Option<usize>,
}

impl TraceContext {
    pub fn new(trace_id: u64) -> Self {
        TraceContext {
            trace_id,
            decision: RwLock::new(None),
            state: Mutex::new(ContextState::default()),
            partial_flush_min_spans: None,
        }
    }

    /// Honors a priority received from an upstream service.
    pub fn with_propagated_priority(self, priority: SamplingPriority) -> Self {
        *self.decision.write().unwrap_or_else(PoisonError::into_inner) = Some(
            SamplingDecision::new(priority, SamplingMechanism::Default),
        );
        self
    }

    /// Emits finished spans as a partial chunk once `min_spans` of them are waiting on
    /// still-open siblings.
    pub fn with_partial_flush(mut self, min_spans: usize) -> Self {
        self.partial_flush_min_spans = Some(min_spans.max(1));
        self
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn root_span_id(&self) -> Option<u64> {
        self.lock_state().root.as_ref().map(|root| root.span_id)
    }

    /// The root span as it was when started. Chunks that do not contain the root are sampled
    /// against it.
    pub fn root_span(&self) -> Option<Span> {
        self.lock_state().root.clone()
    }

    /// Edits the recorded root span, for attributes filled in after it started.
    pub fn update_root<F>(&self, update: F)
    where
        F: FnOnce(&mut Span),
    {
        if let Some(root) = self.lock_state().root.as_mut() {
            update(root);
        }
    }

    pub fn sampling_decision(&self) -> Option<SamplingDecision> {
        *self.decision.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the decision for the whole trace.
    pub fn set_sampling_decision(&self, decision: SamplingDecision) {
        *self.decision.write().unwrap_or_else(PoisonError::into_inner) = Some(decision);
    }

    /// Returns the attached decision, or attaches the one `decide` computes.
    ///
    /// `decide` runs at most once per trace, with the decision slot locked, so concurrent
    /// callers never compute a decision that is thrown away.
    pub fn decide_with<F>(&self, decide: F) -> SamplingDecision
    where
        F: FnOnce() -> SamplingDecision,
    {
        if let Some(decision) = self.sampling_decision() {
            return decision;
        }
        let mut slot = self.decision.write().unwrap_or_else(PoisonError::into_inner);
        *slot.get_or_insert_with(decide)
    }

    /// Opens `span` in this trace, rewriting its trace id to this trace's. The first span
    /// started becomes the root.
    pub fn start_span(&self, mut span: Span) -> Span {
        span.trace_id = self.trace_id;
        let mut state = self.lock_state();
        if state.root.is_none() {
            state.root = Some(span.clone());
        }
        state.open_spans += 1;
        span
    }

    /// Hands a finished span back to the trace.
    ///
    /// Returns a chunk ready for sampling when the last open span closes, or a partial chunk
    /// when partial flushing is enabled and enough spans have finished.
    pub fn finish_span(self: &Arc<Self>, span: Span) -> Option<Trace> {
        let mut state = self.lock_state();
        state.finished.push(span);
        state.open_spans = state.open_spans.saturating_sub(1);

        if state.open_spans == 0 {
            let spans = std::mem::take(&mut state.finished);
            return Some(Trace::from_context(Arc::clone(self), spans, false));
        }

        match self.partial_flush_min_spans {
            Some(min_spans) if state.finished.len() >= min_spans => {
                debug!(
                    "Partial flush of trace {} with {} finished spans, {} still open",
                    self.trace_id,
                    state.finished.len(),
                    state.open_spans
                );
                let spans = std::mem::take(&mut state.finished);
                Some(Trace::from_context(Arc::clone(self), spans, true))
            }
            _ => None,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An ordered chunk of finished spans sharing one trace id.
#[derive(Debug, Clone)]
pub struct Trace {
    context: Arc<TraceContext>,
    spans: Vec<Span>,
    partial: bool,
}

impl Trace {
    /// Wraps already finished spans in a fresh context keyed by the first span's trace id.
    pub fn new(spans: Vec<Span>) -> Self {
        let trace_id = spans.first().map(|s| s.trace_id).unwrap_or_default();
        let context = TraceContext::new(trace_id);
        if let Some(root) = spans.iter().find(|s| s.is_root()) {
            context.lock_state().root = Some(root.clone());
        }
        Trace {
            context: Arc::new(context),
            spans,
            partial: false,
        }
    }

    pub fn from_context(context: Arc<TraceContext>, spans: Vec<Span>, partial: bool) -> Self {
        Trace {
            context,
            spans,
            partial,
        }
    }

    pub fn trace_id(&self) -> u64 {
        self.context.trace_id()
    }

    pub fn context(&self) -> &Arc<TraceContext> {
        &self.context
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn estimated_size(&self) -> usize {
        self.spans.iter().map(Span::estimated_size).sum()
    }

    pub fn sampling_decision(&self) -> Option<SamplingDecision> {
        self.context.sampling_decision()
    }

    /// The span sampling looks at: the context's root if present in this chunk, else the first
    /// span whose parent is not part of the chunk.
    pub fn root_span(&self) -> Option<&Span> {
        self.root_index().map(|i| &self.spans[i])
    }

    /// The span sampling rules are matched against: the root if this chunk holds it, else the
    /// root recorded on the context, else [`Trace::root_span`].
    pub fn sampling_root(&self) -> Option<Cow<'_, Span>> {
        if let Some(i) = self.context_root_index() {
            return Some(Cow::Borrowed(&self.spans[i]));
        }
        if let Some(root) = self.context.root_span() {
            return Some(Cow::Owned(root));
        }
        self.root_span().map(Cow::Borrowed)
    }

    fn context_root_index(&self) -> Option<usize> {
        let root_id = self.context.root_span_id()?;
        self.spans.iter().position(|s| s.span_id == root_id)
    }

    fn root_index(&self) -> Option<usize> {
        if let Some(i) = self.context_root_index() {
            return Some(i);
        }
        let ids: HashSet<u64> = self.spans.iter().map(|s| s.span_id).collect();
        self.spans
            .iter()
            .position(|s| s.parent_id.map_or(true, |p| !ids.contains(&p)))
            .or(if self.spans.is_empty() { None } else { Some(0) })
    }

    pub fn validate(&self) -> Result<(), WriteError> {
        if self.spans.is_empty() {
            return Err(WriteError::MalformedTrace("trace has no spans"));
        }
        let trace_id = self.trace_id();
        for span in &self.spans {
            span.validate().map_err(WriteError::MalformedTrace)?;
            if span.trace_id != trace_id {
                return Err(WriteError::MalformedTrace("spans belong to different traces"));
            }
        }
        Ok(())
    }

    /// Writes the attached decision onto the chunk's spans just before it is buffered.
    ///
    /// The priority goes on the root span of a full chunk, and on every span of a partial chunk
    /// since the agent may not see the root.
    pub fn apply_sampling_tags(&mut self) {
        let Some(decision) = self.sampling_decision() else {
            return;
        };
        let Some(root) = self.root_index() else {
            return;
        };
        let priority = f64::from(decision.priority.value());
        if self.partial {
            for span in &mut self.spans {
                span.set_metric(SAMPLING_PRIORITY_KEY, priority);
            }
        }

        let span = &mut self.spans[root];
        span.set_metric(SAMPLING_PRIORITY_KEY, priority);
        if decision.is_keep() {
            span.set_tag(DECISION_MAKER_KEY, &decision.mechanism.to_string());
        }
        match (decision.mechanism, decision.rate) {
            (SamplingMechanism::Rule, Some(rate)) => span.set_metric(RULE_RATE_KEY, rate),
            (SamplingMechanism::AgentRate, Some(rate)) => span.set_metric(AGENT_RATE_KEY, rate),
            _ => {}
        }
        if let Some(limiter_rate) = decision.limiter_rate {
            span.set_metric(LIMITER_RATE_KEY, limiter_rate);
        }
    }
}

/// Chunks compare by their spans. The shared context is bookkeeping, not data.
impl PartialEq for Trace {
    fn eq(&self, other: &Self) -> bool {
        self.spans == other.spans
    }
}
