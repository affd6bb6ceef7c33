// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::api::{Api, TracePayload};
use crate::errors::TransportError;
use crate::http::{self, HttpResponse};
use crate::span::Span;
use crate::trace::Trace;

pub const RATES_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 41\r\n\r\n{\"rate_by_service\":{\"service:,env:\":0.5}}";

pub fn status_response(status_line: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\n\r\n").into_bytes()
}

pub fn single_span_trace(trace_id: u64) -> Trace {
    Trace::new(vec![Span::new("op", trace_id, trace_id, None)])
}

/// Answers every send with the same raw response and records the payloads.
pub struct RecordingApi {
    response: Vec<u8>,
    payloads: Mutex<Vec<TracePayload>>,
}

impl RecordingApi {
    pub fn new(response: &[u8]) -> Arc<Self> {
        Arc::new(RecordingApi {
            response: response.to_vec(),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(&status_response("200 OK"))
    }

    pub fn payloads(&self) -> Vec<TracePayload> {
        self.payloads.lock().expect("lock poisoned").clone()
    }

    pub fn sent_traces(&self) -> Vec<Trace> {
        self.payloads()
            .iter()
            .flat_map(|p| crate::serializer::decode_batch(&p.body).expect("payload did not decode"))
            .collect()
    }
}

#[async_trait]
impl Api for RecordingApi {
    async fn send_traces(&self, payload: &TracePayload) -> Result<HttpResponse, TransportError> {
        self.payloads
            .lock()
            .expect("lock poisoned")
            .push(payload.clone());
        http::read_response(self.response.as_slice()).await
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}
