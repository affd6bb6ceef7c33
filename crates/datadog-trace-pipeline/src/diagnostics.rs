// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only counters describing what the pipeline kept, dropped and sent.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::errors::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushStatus {
    #[default]
    Never,
    Succeeded,
    TransientFailure,
    FatalFailure,
}

impl FlushStatus {
    fn as_u8(self) -> u8 {
        match self {
            FlushStatus::Never => 0,
            FlushStatus::Succeeded => 1,
            FlushStatus::TransientFailure => 2,
            FlushStatus::FatalFailure => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => FlushStatus::Succeeded,
            2 => FlushStatus::TransientFailure,
            3 => FlushStatus::FatalFailure,
            _ => FlushStatus::Never,
        }
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    traces_submitted: AtomicU64,
    spans_submitted: AtomicU64,
    traces_rejected: AtomicU64,
    traces_malformed: AtomicU64,
    writes_after_close: AtomicU64,
    traces_dropped_overflow: AtomicU64,
    spans_dropped_overflow: AtomicU64,
    traces_dropped_shutdown: AtomicU64,
    traces_dropped_serialization: AtomicU64,
    traces_dropped_send: AtomicU64,
    batches_sent: AtomicU64,
    traces_sent: AtomicU64,
    spans_sent: AtomicU64,
    transient_failures: AtomicU64,
    fatal_failures: AtomicU64,
    degraded: AtomicBool,
    last_flush: AtomicU8,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiagnosticsSnapshot {
    pub traces_submitted: u64,
    pub spans_submitted: u64,
    /// Rejected by the sampler and never buffered.
    pub traces_rejected: u64,
    pub traces_malformed: u64,
    pub writes_after_close: u64,
    pub traces_dropped_overflow: u64,
    pub spans_dropped_overflow: u64,
    pub traces_dropped_shutdown: u64,
    pub traces_dropped_serialization: u64,
    /// Traces in batches whose send failed.
    pub traces_dropped_send: u64,
    pub batches_sent: u64,
    pub traces_sent: u64,
    pub spans_sent: u64,
    pub transient_failures: u64,
    pub fatal_failures: u64,
    pub degraded: bool,
    pub last_flush: FlushStatus,
    /// Accept ratio of the rate limiter in its current window.
    pub limiter_effective_rate: f64,
}

impl DiagnosticsSnapshot {
    /// Every trace that reached the buffer and left it without being sent.
    pub fn traces_dropped(&self) -> u64 {
        self.traces_dropped_overflow
            + self.traces_dropped_shutdown
            + self.traces_dropped_serialization
            + self.traces_dropped_send
    }
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self, spans: usize) {
        add(&self.traces_submitted, 1);
        add(&self.spans_submitted, spans);
    }

    pub(crate) fn record_rejected(&self) {
        add(&self.traces_rejected, 1);
    }

    pub(crate) fn record_malformed(&self) {
        add(&self.traces_malformed, 1);
    }

    pub(crate) fn record_write_after_close(&self) {
        add(&self.writes_after_close, 1);
    }

    pub(crate) fn record_overflow(&self, traces: usize, spans: usize) {
        add(&self.traces_dropped_overflow, traces);
        add(&self.spans_dropped_overflow, spans);
    }

    pub(crate) fn record_shutdown_drop(&self, traces: usize) {
        add(&self.traces_dropped_shutdown, traces);
    }

    pub(crate) fn record_serialization_drop(&self, traces: usize) {
        add(&self.traces_dropped_serialization, traces);
    }

    pub(crate) fn record_sent(&self, traces: usize, spans: usize) {
        add(&self.batches_sent, 1);
        add(&self.traces_sent, traces);
        add(&self.spans_sent, spans);
        self.degraded.store(false, Ordering::Relaxed);
        self.last_flush
            .store(FlushStatus::Succeeded.as_u8(), Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, kind: FailureKind, traces: usize) {
        add(&self.traces_dropped_send, traces);
        let status = match kind {
            FailureKind::Transient => {
                add(&self.transient_failures, 1);
                FlushStatus::TransientFailure
            }
            FailureKind::Fatal => {
                add(&self.fatal_failures, 1);
                self.degraded.store(true, Ordering::Relaxed);
                FlushStatus::FatalFailure
            }
        };
        self.last_flush.store(status.as_u8(), Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, limiter_effective_rate: f64) -> DiagnosticsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            traces_submitted: get(&self.traces_submitted),
            spans_submitted: get(&self.spans_submitted),
            traces_rejected: get(&self.traces_rejected),
            traces_malformed: get(&self.traces_malformed),
            writes_after_close: get(&self.writes_after_close),
            traces_dropped_overflow: get(&self.traces_dropped_overflow),
            spans_dropped_overflow: get(&self.spans_dropped_overflow),
            traces_dropped_shutdown: get(&self.traces_dropped_shutdown),
            traces_dropped_serialization: get(&self.traces_dropped_serialization),
            traces_dropped_send: get(&self.traces_dropped_send),
            batches_sent: get(&self.batches_sent),
            traces_sent: get(&self.traces_sent),
            spans_sent: get(&self.spans_sent),
            transient_failures: get(&self.transient_failures),
            fatal_failures: get(&self.fatal_failures),
            degraded: self.is_degraded(),
            last_flush: FlushStatus::from_u8(self.last_flush.load(Ordering::Relaxed)),
            limiter_effective_rate,
        }
    }
}
