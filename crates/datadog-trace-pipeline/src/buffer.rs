// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, concurrent buffering of finished traces into batches.
//!
//! Producers call [`TraceBuffer::push`] from any thread. The call only takes a short mutex hold
//! and never performs I/O. Traces accumulate in an open batch which is sealed when:
//! - adding the next trace would exceed `max_batch_spans` or `max_batch_bytes`
//! - the open batch reaches either threshold
//! - the periodic flush timer calls [`TraceBuffer::seal`]
//!
//! Sealed batches wait in a FIFO queue for the writer task. A trace is never split across
//! batches, and a batch once sealed is never reopened, so no trace can appear in two batches.
//!
//! # Overflow policy
//!
//! At most `max_pending_batches` sealed batches are held. Sealing one more evicts the **oldest**
//! sealed batch, and its traces and spans are added to the overflow counters. Older data is the
//! least valuable under sustained backpressure, and the eviction order is fully deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::diagnostics::Diagnostics;
use crate::errors::WriteError;
use crate::trace::Trace;

/// Uncompressed payload size the agent accepts, in bytes.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 3_200_000;
pub const DEFAULT_MAX_BATCH_SPANS: usize = 1_000;
pub const DEFAULT_MAX_PENDING_BATCHES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub max_batch_spans: usize,
    pub max_batch_bytes: usize,
    pub max_pending_batches: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_batch_spans: DEFAULT_MAX_BATCH_SPANS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_pending_batches: DEFAULT_MAX_PENDING_BATCHES,
        }
    }
}

/// A sealed group of traces, sent as one request.
#[derive(Debug)]
pub struct Batch {
    /// Strictly increasing in sealing order.
    pub sequence: u64,
    pub traces: Vec<Trace>,
    pub span_count: usize,
    pub estimated_bytes: usize,
}

impl Batch {
    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }
}

#[derive(Default)]
struct BufferState {
    open: Vec<Trace>,
    open_spans: usize,
    open_bytes: usize,
    sealed: VecDeque<Batch>,
    next_sequence: u64,
    closed: bool,
}

pub struct TraceBuffer {
    config: BufferConfig,
    state: Mutex<BufferState>,
    notify: Notify,
    diagnostics: Arc<Diagnostics>,
}

impl TraceBuffer {
    pub fn new(config: BufferConfig, diagnostics: Arc<Diagnostics>) -> Self {
        TraceBuffer {
            config: BufferConfig {
                max_batch_spans: config.max_batch_spans.max(1),
                max_batch_bytes: config.max_batch_bytes.max(1),
                max_pending_batches: config.max_pending_batches.max(1),
            },
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
            diagnostics,
        }
    }

    /// Adds a finished trace to the open batch.
    ///
    /// # Errors
    ///
    /// * [`WriteError::MalformedTrace`] if the trace is empty, has spans without ids, or mixes
    ///   trace ids
    /// * [`WriteError::Closed`] once [`TraceBuffer::close`] was called
    ///
    /// Both are counted in [`Diagnostics`].
    pub fn push(&self, trace: Trace) -> Result<(), WriteError> {
        if let Err(e) = trace.validate() {
            debug!("Rejecting trace {}: {e}", trace.trace_id());
            self.diagnostics.record_malformed();
            return Err(e);
        }

        let spans = trace.span_count();
        let bytes = trace.estimated_size();
        let sealed = {
            let mut state = self.lock_state();
            if state.closed {
                self.diagnostics.record_write_after_close();
                return Err(WriteError::Closed);
            }

            let mut sealed = false;
            if !state.open.is_empty()
                && (state.open_spans + spans > self.config.max_batch_spans
                    || state.open_bytes + bytes > self.config.max_batch_bytes)
            {
                sealed |= self.seal_locked(&mut state);
            }

            state.open.push(trace);
            state.open_spans += spans;
            state.open_bytes += bytes;

            if state.open_spans >= self.config.max_batch_spans
                || state.open_bytes >= self.config.max_batch_bytes
            {
                sealed |= self.seal_locked(&mut state);
            }
            sealed
        };

        if sealed {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Seals the open batch, if it holds anything. Returns whether a batch was sealed.
    pub fn seal(&self) -> bool {
        let sealed = self.seal_locked(&mut self.lock_state());
        if sealed {
            self.notify.notify_one();
        }
        sealed
    }

    /// Pops the oldest sealed batch.
    pub fn take_ready(&self) -> Option<Batch> {
        self.lock_state().sealed.pop_front()
    }

    /// Seals the open batch and refuses every later push.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        self.seal_locked(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Seals the open batch and removes every sealed batch, oldest first.
    pub fn drain_all(&self) -> Vec<Batch> {
        let mut state = self.lock_state();
        self.seal_locked(&mut state);
        state.sealed.drain(..).collect()
    }

    /// Traces currently held, open or sealed.
    pub fn pending_traces(&self) -> usize {
        let state = self.lock_state();
        state.open.len() + state.sealed.iter().map(Batch::trace_count).sum::<usize>()
    }

    /// Resolves once a batch was sealed by a size threshold since the last wakeup.
    pub async fn sealed_notification(&self) {
        self.notify.notified().await;
    }

    fn seal_locked(&self, state: &mut MutexGuard<'_, BufferState>) -> bool {
        if state.open.is_empty() {
            return false;
        }

        let batch = Batch {
            sequence: state.next_sequence,
            traces: std::mem::take(&mut state.open),
            span_count: std::mem::take(&mut state.open_spans),
            estimated_bytes: std::mem::take(&mut state.open_bytes),
        };
        state.next_sequence += 1;

        if state.sealed.len() >= self.config.max_pending_batches {
            if let Some(evicted) = state.sealed.pop_front() {
                warn!(
                    "Trace buffer full, dropping batch {} with {} traces",
                    evicted.sequence,
                    evicted.trace_count()
                );
                self.diagnostics
                    .record_overflow(evicted.trace_count(), evicted.span_count);
            }
        }
        state.sealed.push_back(batch);
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use std::thread;
    use tracing_test::traced_test;

    fn single_span_trace(trace_id: u64) -> Trace {
        Trace::new(vec![Span::new("op", trace_id, trace_id, None)])
    }

    fn multi_span_trace(trace_id: u64, spans: u64) -> Trace {
        Trace::new(
            (1..=spans)
                .map(|i| Span::new("op", trace_id, i, if i == 1 { None } else { Some(1) }))
                .collect(),
        )
    }

    fn buffer(max_batch_spans: usize, max_pending_batches: usize) -> (TraceBuffer, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let config = BufferConfig {
            max_batch_spans,
            max_batch_bytes: usize::MAX,
            max_pending_batches,
        };
        (TraceBuffer::new(config, diagnostics.clone()), diagnostics)
    }

    #[test]
    fn test_s_plus_one_spans_seal_exactly_one_batch() {
        let (buffer, _) = buffer(5, 4);
        for id in 1..=6 {
            buffer.push(single_span_trace(id)).expect("push failed");
        }

        let batch = buffer.take_ready().expect("one batch should be sealed");
        assert_eq!(batch.span_count, 5);
        let ids: Vec<u64> = batch.traces.iter().map(Trace::trace_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(buffer.take_ready().is_none());
        assert_eq!(buffer.pending_traces(), 1);
    }

    #[test]
    fn test_trace_is_never_split() {
        let (buffer, _) = buffer(4, 4);
        buffer.push(multi_span_trace(1, 3)).expect("push failed");
        buffer.push(multi_span_trace(2, 3)).expect("push failed");

        let first = buffer.take_ready().expect("first trace sealed alone");
        assert_eq!(first.span_count, 3);
        assert_eq!(first.trace_count(), 1);

        // A trace larger than the threshold gets a batch of its own.
        buffer.push(multi_span_trace(3, 9)).expect("push failed");
        let second = buffer.take_ready().expect("second batch");
        assert_eq!(second.traces[0].trace_id(), 2);
        let third = buffer.take_ready().expect("oversized batch");
        assert_eq!(third.span_count, 9);
        assert!(second.sequence < third.sequence);
    }

    #[test]
    #[traced_test]
    fn test_overflow_drops_oldest_batch() {
        let (buffer, diagnostics) = buffer(1, 2);
        for id in 1..=5 {
            buffer.push(single_span_trace(id)).expect("push failed");
        }

        let remaining: Vec<u64> = std::iter::from_fn(|| buffer.take_ready())
            .map(|b| b.traces[0].trace_id())
            .collect();
        assert_eq!(remaining, vec![4, 5]);

        let snapshot = diagnostics.snapshot(1.0);
        assert_eq!(snapshot.traces_dropped_overflow, 3);
        assert_eq!(snapshot.spans_dropped_overflow, 3);
        assert!(logs_contain("Trace buffer full"));
    }

    #[test]
    fn test_byte_threshold_seals() {
        let diagnostics = Arc::new(Diagnostics::new());
        let trace_size = single_span_trace(1).estimated_size();
        let buffer = TraceBuffer::new(
            BufferConfig {
                max_batch_spans: usize::MAX,
                max_batch_bytes: trace_size * 2,
                max_pending_batches: 4,
            },
            diagnostics,
        );
        buffer.push(single_span_trace(1)).expect("push failed");
        assert!(buffer.take_ready().is_none());
        buffer.push(single_span_trace(2)).expect("push failed");
        assert_eq!(buffer.take_ready().map(|b| b.trace_count()), Some(2));
    }

    #[test]
    fn test_closed_buffer_rejects_writes() {
        let (buffer, diagnostics) = buffer(100, 4);
        buffer.push(single_span_trace(1)).expect("push failed");
        buffer.close();

        assert_eq!(buffer.push(single_span_trace(2)), Err(WriteError::Closed));
        assert_eq!(diagnostics.snapshot(1.0).writes_after_close, 1);

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].trace_count(), 1);
    }

    #[test]
    fn test_malformed_trace_is_counted() {
        let (buffer, diagnostics) = buffer(100, 4);
        let result = buffer.push(Trace::new(vec![Span::new("op", 1, 0, None)]));
        assert!(matches!(result, Err(WriteError::MalformedTrace(_))));
        assert_eq!(buffer.pending_traces(), 0);
        assert_eq!(diagnostics.snapshot(1.0).traces_malformed, 1);
    }

    #[test]
    fn test_concurrent_pushes_conserve_traces() {
        let (buffer, diagnostics) = buffer(7, 10_000);
        let buffer = Arc::new(buffer);
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..250u64 {
                        buffer
                            .push(single_span_trace(t * 1_000 + i + 1))
                            .expect("push failed");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer panicked");
        }

        let batches = buffer.drain_all();
        let mut ids: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.traces.iter().map(Trace::trace_id))
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(total, 2_000);
        assert_eq!(ids.len(), 2_000);
        assert!(batches.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(diagnostics.snapshot(1.0).traces_dropped_overflow, 0);
    }
}
