// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed per-span overhead of the encoded span map (keys, ids, timestamps), in bytes.
const SPAN_FIXED_SIZE: usize = 128;

/// A single timed unit of work.
///
/// A span is mutated through `&mut self` by whoever owns it and becomes read-only once it is
/// handed to its [`TraceContext`](crate::trace::TraceContext) with `finish_span`. Ownership, not
/// locking, guarantees a single writer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Span {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_type: String,
    pub trace_id: u64,
    pub span_id: u64,
    /// `None` for a root span, or a span whose parent lives in another process.
    pub parent_id: Option<u64>,
    /// Nanoseconds since the Unix epoch.
    pub start: i64,
    /// Nanoseconds.
    pub duration: i64,
    pub error: bool,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl Span {
    pub fn new(name: &str, trace_id: u64, span_id: u64, parent_id: Option<u64>) -> Self {
        Span {
            name: name.to_string(),
            resource: name.to_string(),
            trace_id,
            span_id,
            parent_id,
            start: now_nanos(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = service.to_string();
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }

    pub fn with_type(mut self, span_type: &str) -> Self {
        self.span_type = span_type.to_string();
        self
    }

    pub fn with_start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    pub fn set_tag(&mut self, key: &str, value: &str) {
        self.meta.insert(key.to_string(), value.to_string());
    }

    pub fn set_metric(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), value);
    }

    pub fn set_error(&mut self, error: bool) {
        self.error = error;
    }

    /// Records the end timestamp. A clock that went backwards yields a zero duration.
    pub fn finish(&mut self, end: i64) {
        self.duration = end.saturating_sub(self.start).max(0);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns the reason this span cannot be sent, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.trace_id == 0 {
            return Err("span is missing a trace id");
        }
        if self.span_id == 0 {
            return Err("span is missing a span id");
        }
        if self.parent_id == Some(0) {
            return Err("span has a zero parent id");
        }
        if self.duration < 0 {
            return Err("span has a negative duration");
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Rough size of this span once encoded, used for byte-based flush thresholds.
    pub fn estimated_size(&self) -> usize {
        let strings =
            self.service.len() + self.name.len() + self.resource.len() + self.span_type.len();
        let meta: usize = self.meta.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        let metrics: usize = self.metrics.keys().map(|k| k.len() + 10).sum();
        SPAN_FIXED_SIZE + strings + meta + metrics
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
