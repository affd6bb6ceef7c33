// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Msgpack encoding of trace batches in the agent's `/v0.4/traces` layout.
//!
//! The payload is an array of traces, each an array of span maps. Spans are written straight into
//! the output buffer without building an intermediate value tree.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use rmp::decode;
use rmp::encode;
use tracing::warn;

use crate::errors::SerializationError;
use crate::span::Span;
use crate::trace::Trace;

const SPAN_FIELD_COUNT: u32 = 12;

#[derive(Debug, Default)]
pub struct EncodedBatch {
    pub payload: Vec<u8>,
    pub trace_count: usize,
    pub span_count: usize,
    /// Traces left out because one of their fields could not be encoded.
    pub dropped_traces: usize,
}

/// Encodes `traces` in order. A trace that fails to encode is logged and left out; the rest of
/// the batch is still produced.
pub fn encode_batch(traces: &[Trace]) -> Result<EncodedBatch, SerializationError> {
    let mut body = Vec::with_capacity(traces.iter().map(Trace::estimated_size).sum());
    let mut batch = EncodedBatch::default();

    for trace in traces {
        let mark = body.len();
        match encode_trace(&mut body, trace.spans()) {
            Ok(()) => {
                batch.trace_count += 1;
                batch.span_count += trace.span_count();
            }
            Err(e) => {
                body.truncate(mark);
                batch.dropped_traces += 1;
                warn!("Dropping trace {} that failed to encode: {e}", trace.trace_id());
            }
        }
    }

    let mut payload = Vec::with_capacity(body.len() + 5);
    encode::write_array_len(&mut payload, len_u32(batch.trace_count)?)?;
    payload.extend_from_slice(&body);
    batch.payload = payload;
    Ok(batch)
}

/// Appends one trace (an array of span maps) to `wr`.
pub fn encode_trace(wr: &mut Vec<u8>, spans: &[Span]) -> Result<(), SerializationError> {
    encode::write_array_len(wr, len_u32(spans.len())?)?;
    for span in spans {
        encode_span(wr, span)?;
    }
    Ok(())
}

fn encode_span(wr: &mut Vec<u8>, span: &Span) -> Result<(), SerializationError> {
    encode::write_map_len(wr, SPAN_FIELD_COUNT)?;

    write_string(wr, "service")?;
    write_string(wr, &span.service)?;
    write_string(wr, "name")?;
    write_string(wr, &span.name)?;
    write_string(wr, "resource")?;
    write_string(wr, &span.resource)?;
    write_string(wr, "type")?;
    write_string(wr, &span.span_type)?;

    write_string(wr, "trace_id")?;
    encode::write_u64(wr, span.trace_id)?;
    write_string(wr, "span_id")?;
    encode::write_u64(wr, span.span_id)?;
    write_string(wr, "parent_id")?;
    encode::write_u64(wr, span.parent_id.unwrap_or(0))?;

    write_string(wr, "start")?;
    encode::write_i64(wr, span.start)?;
    write_string(wr, "duration")?;
    encode::write_i64(wr, span.duration)?;
    write_string(wr, "error")?;
    encode::write_i32(wr, i32::from(span.error))?;

    write_string(wr, "meta")?;
    encode::write_map_len(wr, len_u32(span.meta.len())?)?;
    for (key, value) in &span.meta {
        write_string(wr, key)?;
        write_string(wr, value)?;
    }

    write_string(wr, "metrics")?;
    encode::write_map_len(wr, len_u32(span.metrics.len())?)?;
    for (key, value) in &span.metrics {
        write_string(wr, key)?;
        encode::write_f64(wr, *value)?;
    }
    Ok(())
}

fn write_string(wr: &mut Vec<u8>, value: &str) -> Result<(), SerializationError> {
    // rmp would silently truncate the length prefix past u32::MAX.
    len_u32(value.len())?;
    encode::write_str(wr, value)?;
    Ok(())
}

fn len_u32(len: usize) -> Result<u32, SerializationError> {
    u32::try_from(len).map_err(|_| SerializationError::TooLong(len))
}

/// Decodes a payload produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Trace>, SerializationError> {
    let mut rd = Cursor::new(bytes);
    let trace_count = decode::read_array_len(&mut rd)?;
    let mut traces = Vec::with_capacity(trace_count.min(1024) as usize);

    for _ in 0..trace_count {
        let span_count = decode::read_array_len(&mut rd)?;
        let mut spans = Vec::with_capacity(span_count.min(1024) as usize);
        for _ in 0..span_count {
            spans.push(decode_span(&mut rd)?);
        }
        traces.push(Trace::new(spans));
    }

    if rd.position() != bytes.len() as u64 {
        return Err(SerializationError::Decode(format!(
            "{} trailing bytes after batch",
            bytes.len() as u64 - rd.position()
        )));
    }
    Ok(traces)
}

fn decode_span(rd: &mut Cursor<&[u8]>) -> Result<Span, SerializationError> {
    let field_count = decode::read_map_len(rd)?;
    let mut span = Span::default();

    for _ in 0..field_count {
        let key = read_string(rd)?;
        match key.as_str() {
            "service" => span.service = read_string(rd)?,
            "name" => span.name = read_string(rd)?,
            "resource" => span.resource = read_string(rd)?,
            "type" => span.span_type = read_string(rd)?,
            "trace_id" => span.trace_id = decode::read_int(rd)?,
            "span_id" => span.span_id = decode::read_int(rd)?,
            "parent_id" => {
                let parent_id: u64 = decode::read_int(rd)?;
                span.parent_id = (parent_id != 0).then_some(parent_id);
            }
            "start" => span.start = decode::read_int(rd)?,
            "duration" => span.duration = decode::read_int(rd)?,
            "error" => span.error = decode::read_int::<i32, _>(rd)? != 0,
            "meta" => {
                let len = decode::read_map_len(rd)?;
                let mut meta = HashMap::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    let key = read_string(rd)?;
                    meta.insert(key, read_string(rd)?);
                }
                span.meta = meta;
            }
            "metrics" => {
                let len = decode::read_map_len(rd)?;
                let mut metrics = HashMap::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    let key = read_string(rd)?;
                    metrics.insert(key, decode::read_f64(rd)?);
                }
                span.metrics = metrics;
            }
            other => return Err(SerializationError::UnexpectedField(other.to_string())),
        }
    }
    Ok(span)
}

fn read_string(rd: &mut Cursor<&[u8]>) -> Result<String, SerializationError> {
    let len = decode::read_str_len(rd)? as usize;
    let remaining = rd.get_ref().len().saturating_sub(rd.position() as usize);
    if len > remaining {
        return Err(SerializationError::Decode(format!(
            "string of {len} bytes exceeds the {remaining} remaining"
        )));
    }
    let mut buf = vec![0; len];
    rd.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| SerializationError::Decode(e.to_string()))
}
