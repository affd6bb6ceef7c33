// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background task moving sealed batches from the [`TraceBuffer`] to the agent.
//!
//! A single [`AgentWriter`] task owns the transport, so at most one batch is in flight at any
//! time. Producers only touch the buffer through [`AgentWriterHandle::write`]. Flush, transport
//! override and shutdown requests travel to the task over a command channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{Api, TracePayload};
use crate::buffer::{Batch, TraceBuffer};
use crate::diagnostics::Diagnostics;
use crate::errors::{FailureKind, TransportError, WriteError, WriterError};
use crate::sampling::Sampler;
use crate::serializer;
use crate::trace::Trace;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub flush_interval: Duration,
    /// Deadline for one send attempt, connect included.
    pub request_timeout: Duration,
    /// Deadline for the final drain on close.
    pub shutdown_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Flushing,
    Closed,
}

/// Outcome of the batches sent by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub traces_sent: usize,
    /// Traces lost to send failures or encoding errors.
    pub traces_dropped: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.batches_sent += other.batches_sent;
        self.batches_failed += other.batches_failed;
        self.traces_sent += other.traces_sent;
        self.traces_dropped += other.traces_dropped;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub flush: FlushReport,
    /// Traces still buffered or in flight when the shutdown deadline expired.
    pub traces_dropped_shutdown: usize,
    pub timed_out: bool,
}

pub enum WriterCommand {
    Flush(oneshot::Sender<FlushReport>),
    OverrideApi(Arc<dyn Api>, oneshot::Sender<()>),
    Close(oneshot::Sender<CloseReport>),
}

#[derive(Clone)]
pub struct AgentWriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
    buffer: Arc<TraceBuffer>,
    state: watch::Receiver<WriterState>,
}

impl AgentWriterHandle {
    /// Queues a sampled trace. Never waits on the network.
    pub fn write(&self, trace: Trace) -> Result<(), WriteError> {
        self.buffer.push(trace)
    }

    /// Seals the open batch and sends everything buffered, returning once the sends are done.
    pub async fn flush(&self) -> Result<FlushReport, WriterError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(response_tx))
            .map_err(|e| WriterError::Stopped(format!("Failed to send flush command: {e}")))?;

        response_rx
            .await
            .map_err(|e| WriterError::Stopped(format!("Failed to receive flush response: {e}")))
    }

    /// Points later sends at `api`. Buffered traces are kept.
    pub async fn override_api(&self, api: Arc<dyn Api>) -> Result<(), WriterError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::OverrideApi(api, response_tx))
            .map_err(|e| WriterError::Stopped(format!("Failed to send override command: {e}")))?;

        response_rx
            .await
            .map_err(|e| WriterError::Stopped(format!("Failed to receive override response: {e}")))
    }

    /// Refuses further writes, drains the buffer within the shutdown deadline and stops the task.
    pub async fn flush_and_close(&self) -> Result<CloseReport, WriterError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Close(response_tx))
            .map_err(|e| WriterError::Stopped(format!("Failed to send close command: {e}")))?;

        response_rx
            .await
            .map_err(|e| WriterError::Stopped(format!("Failed to receive close response: {e}")))
    }

    pub fn state(&self) -> WriterState {
        *self.state.borrow()
    }
}

/// Send bookkeeping that survives the cancellation of a timed out drain.
#[derive(Default)]
struct Progress {
    report: FlushReport,
    in_flight: usize,
}

pub struct AgentWriter {
    api: Arc<dyn Api>,
    buffer: Arc<TraceBuffer>,
    sampler: Arc<Sampler>,
    diagnostics: Arc<Diagnostics>,
    config: WriterConfig,
    state: watch::Sender<WriterState>,
    rx: mpsc::UnboundedReceiver<WriterCommand>,
}

impl AgentWriter {
    pub fn new(
        api: Arc<dyn Api>,
        buffer: Arc<TraceBuffer>,
        sampler: Arc<Sampler>,
        diagnostics: Arc<Diagnostics>,
        config: WriterConfig,
    ) -> (Self, AgentWriterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(WriterState::Idle);

        let handle = AgentWriterHandle {
            tx,
            buffer: Arc::clone(&buffer),
            state: state_rx,
        };
        let writer = AgentWriter {
            api,
            buffer,
            sampler,
            diagnostics,
            config,
            state,
            rx,
        };
        (writer, handle)
    }

    pub async fn run(mut self) {
        debug!("Trace writer started, sending to {}", self.api.describe());

        let mut interval = time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(WriterCommand::Flush(response_tx)) => {
                        self.buffer.seal();
                        let mut progress = Progress::default();
                        self.send_ready(&mut progress).await;
                        if response_tx.send(progress.report).is_err() {
                            error!("Failed to send flush response - receiver dropped");
                        }
                    }
                    Some(WriterCommand::OverrideApi(api, response_tx)) => {
                        info!("Trace writer now sending to {}", api.describe());
                        self.api = api;
                        if response_tx.send(()).is_err() {
                            error!("Failed to send override response - receiver dropped");
                        }
                    }
                    Some(WriterCommand::Close(response_tx)) => {
                        let report = self.close().await;
                        if response_tx.send(report).is_err() {
                            error!("Failed to send close response - receiver dropped");
                        }
                        break;
                    }
                    None => {
                        debug!("All writer handles dropped");
                        self.close().await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.buffer.seal();
                    self.send_ready(&mut Progress::default()).await;
                }
                _ = self.buffer.sealed_notification() => {
                    self.send_ready(&mut Progress::default()).await;
                }
            }
        }

        debug!("Trace writer stopped");
    }

    async fn close(&self) -> CloseReport {
        info!("Closing trace writer");
        self.buffer.close();

        let mut progress = Progress::default();
        let timed_out = time::timeout(self.config.shutdown_timeout, self.send_ready(&mut progress))
            .await
            .is_err();

        let leftover: usize = self
            .buffer
            .drain_all()
            .iter()
            .map(Batch::trace_count)
            .sum::<usize>()
            + progress.in_flight;
        if leftover > 0 {
            warn!(
                "Shutdown deadline of {:?} expired, dropping {leftover} traces",
                self.config.shutdown_timeout
            );
            self.diagnostics.record_shutdown_drop(leftover);
        }

        self.state.send_replace(WriterState::Closed);
        CloseReport {
            flush: progress.report,
            traces_dropped_shutdown: leftover,
            timed_out,
        }
    }

    async fn send_ready(&self, progress: &mut Progress) {
        while let Some(batch) = self.buffer.take_ready() {
            self.state.send_replace(WriterState::Flushing);
            let report = self.send_batch(batch, &mut progress.in_flight).await;
            progress.report.merge(report);
        }
        if !self.buffer.is_closed() {
            self.state.send_replace(WriterState::Idle);
        }
    }

    async fn send_batch(&self, batch: Batch, in_flight: &mut usize) -> FlushReport {
        let mut report = FlushReport::default();

        let encoded = match serializer::encode_batch(&batch.traces) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode batch {}: {e}", batch.sequence);
                self.diagnostics
                    .record_serialization_drop(batch.trace_count());
                report.traces_dropped = batch.trace_count();
                return report;
            }
        };
        if encoded.dropped_traces > 0 {
            self.diagnostics
                .record_serialization_drop(encoded.dropped_traces);
            report.traces_dropped += encoded.dropped_traces;
        }
        if encoded.trace_count == 0 {
            return report;
        }

        let payload = TracePayload {
            body: encoded.payload,
            trace_count: encoded.trace_count,
        };
        *in_flight = payload.trace_count;
        let result = match time::timeout(self.config.request_timeout, self.api.send_traces(&payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        *in_flight = 0;

        match result {
            Ok(response) if response.is_success() => {
                debug!(
                    "Sent batch {} with {} traces, agent answered {}",
                    batch.sequence,
                    payload.trace_count,
                    response.status()
                );
                self.diagnostics
                    .record_sent(payload.trace_count, encoded.span_count);
                report.batches_sent = 1;
                report.traces_sent = payload.trace_count;

                match self.sampler.update_agent_rates_from_json(response.body()) {
                    Ok(true) => debug!("Updated agent sampling rates"),
                    Ok(false) => {}
                    Err(e) => warn!("Ignoring malformed agent rate table: {e}"),
                }
            }
            Ok(response) => {
                let kind = classify_status(response.status());
                self.record_failure(
                    &batch,
                    payload.trace_count,
                    kind,
                    &format!("agent answered {} {}", response.status(), response.reason()),
                );
                report.batches_failed = 1;
                report.traces_dropped += payload.trace_count;
            }
            Err(e) => {
                self.record_failure(&batch, payload.trace_count, e.kind(), &e.to_string());
                report.batches_failed = 1;
                report.traces_dropped += payload.trace_count;
            }
        }
        report
    }

    fn record_failure(&self, batch: &Batch, traces: usize, kind: FailureKind, reason: &str) {
        self.diagnostics.record_failure(kind, traces);
        match kind {
            FailureKind::Transient => warn!(
                "Dropping batch {} of {traces} traces after transient failure: {reason}",
                batch.sequence
            ),
            FailureKind::Fatal => error!(
                "Dropping batch {} of {traces} traces after fatal failure, pipeline degraded: {reason}",
                batch.sequence
            ),
        }
    }
}

/// Timeouts, throttling and server errors may clear up by the next flush. Any other non-2xx
/// status points at a request or configuration problem.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Fatal,
    }
}
