// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Explicitly constructed entry point wiring the sampler, buffer and writer together.
//!
//! Instrumented code only ever calls [`TracePipeline::submit`], which returns nothing and never
//! waits on I/O. Every failure below it ends up in the [`Diagnostics`] counters.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{AgentApi, Api};
use crate::buffer::TraceBuffer;
use crate::config::Config;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::errors::{PipelineError, WriterError};
use crate::sampling::rules::rules_from_config;
use crate::sampling::{RateLimiter, Sampler};
use crate::span::Span;
use crate::trace::{Trace, TraceContext};
use crate::writer::{AgentWriter, AgentWriterHandle, CloseReport, FlushReport, WriterState};

#[derive(Debug, Clone, Default)]
struct SpanDefaults {
    service: Option<String>,
    env: Option<String>,
    version: Option<String>,
}

impl SpanDefaults {
    fn fill(&self, span: &mut Span, is_root: bool) {
        if let Some(service) = &self.service {
            if span.service.is_empty() {
                span.service.clone_from(service);
            }
        }
        if is_root {
            for (key, value) in [("env", &self.env), ("version", &self.version)] {
                if let Some(value) = value {
                    span.meta
                        .entry(key.to_string())
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }

    /// Fills the chunk's spans and the root recorded on its context, which partial chunks are
    /// sampled against.
    fn apply(&self, trace: &mut Trace) {
        let root_id = trace.root_span().map(|root| root.span_id);
        for span in trace.spans_mut() {
            let is_root = Some(span.span_id) == root_id;
            self.fill(span, is_root);
        }
        trace.context().update_root(|root| self.fill(root, true));
    }
}

pub struct TracePipeline {
    sampler: Arc<Sampler>,
    diagnostics: Arc<Diagnostics>,
    writer: AgentWriterHandle,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    defaults: SpanDefaults,
    partial_flush_min_spans: Option<usize>,
}

impl TracePipeline {
    /// Builds the pipeline from `config` and spawns the writer on the current tokio runtime.
    pub fn start(config: Config) -> Result<Self, PipelineError> {
        let api = Arc::new(AgentApi::new(config.agent_endpoint.clone()));
        Self::start_with_api(config, api)
    }

    /// Same as [`TracePipeline::start`], sending through `api` instead of the agent endpoint.
    pub fn start_with_api(config: Config, api: Arc<dyn Api>) -> Result<Self, PipelineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;

        let sampler = Arc::new(
            Sampler::new(RateLimiter::new(config.rate_limit))
                .with_default_env(config.env.as_deref())
                .with_default_rate(config.sample_rate)
                .with_rules(rules_from_config(&config.sampling_rules)),
        );
        let diagnostics = Arc::new(Diagnostics::new());
        let buffer = Arc::new(TraceBuffer::new(config.buffer, Arc::clone(&diagnostics)));

        info!(
            "Starting trace pipeline to {} with {} sampling rules",
            api.describe(),
            config.sampling_rules.len()
        );
        let (writer, handle) = AgentWriter::new(
            api,
            buffer,
            Arc::clone(&sampler),
            Arc::clone(&diagnostics),
            config.writer_config(),
        );
        let writer_task = runtime.spawn(writer.run());

        Ok(TracePipeline {
            sampler,
            diagnostics,
            writer: handle,
            writer_task: Mutex::new(Some(writer_task)),
            defaults: SpanDefaults {
                service: config.service,
                env: config.env,
                version: config.version,
            },
            partial_flush_min_spans: config
                .partial_flush_enabled
                .then_some(config.partial_flush_min_spans),
        })
    }

    /// A context for a new local trace, with partial flushing set up as configured.
    pub fn new_trace(&self, trace_id: u64) -> Arc<TraceContext> {
        let context = TraceContext::new(trace_id);
        Arc::new(match self.partial_flush_min_spans {
            Some(min_spans) => context.with_partial_flush(min_spans),
            None => context,
        })
    }

    /// Samples a finished trace chunk and queues it if kept.
    pub fn submit(&self, mut trace: Trace) {
        self.diagnostics.record_submitted(trace.span_count());

        if let Err(e) = trace.validate() {
            debug!("Dropping trace {}: {e}", trace.trace_id());
            self.diagnostics.record_malformed();
            return;
        }

        self.defaults.apply(&mut trace);
        let decision = self.sampler.decide(&trace);
        if !decision.is_keep() {
            debug!(
                "Trace {} rejected with priority {} by mechanism {}",
                trace.trace_id(),
                decision.priority,
                decision.mechanism
            );
            self.diagnostics.record_rejected();
            return;
        }

        trace.apply_sampling_tags();
        let trace_id = trace.trace_id();
        if let Err(e) = self.writer.write(trace) {
            debug!("Trace {trace_id} not buffered: {e}");
        }
    }

    pub async fn flush(&self) -> Result<FlushReport, WriterError> {
        self.writer.flush().await
    }

    /// Swaps the destination of later sends. Buffered traces are kept.
    pub async fn override_api(&self, api: Arc<dyn Api>) -> Result<(), WriterError> {
        self.writer.override_api(api).await
    }

    /// Drains the buffer within the shutdown deadline and stops the writer. Later submits are
    /// counted as writes after close. Calling it again returns an empty report.
    pub async fn shutdown(&self) -> Result<CloseReport, WriterError> {
        if self.writer.state() == WriterState::Closed {
            debug!("Trace pipeline already shut down");
            return Ok(CloseReport::default());
        }

        let report = self.writer.flush_and_close().await?;
        let task = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| WriterError::Stopped(format!("Writer task failed: {e}")))?;
        }
        info!(
            "Trace pipeline shut down, {} traces sent on close, {} dropped",
            report.flush.traces_sent,
            report.flush.traces_dropped + report.traces_dropped_shutdown
        );
        Ok(report)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics
            .snapshot(self.sampler.limiter().effective_rate())
    }

    /// Live sampler, for registering rules or pushing rate tables at runtime.
    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    pub fn writer(&self) -> &AgentWriterHandle {
        &self.writer
    }
}
