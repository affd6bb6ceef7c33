// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the trace pipeline

use std::io;

/// Whether a failed send should be expected to succeed on a later flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble or a timeout. The next periodic flush may succeed on its own.
    Transient,
    /// Malformed response or a configuration mismatch. The pipeline keeps running degraded.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid sampling rules: {0}")]
    InvalidSamplingRules(#[from] serde_json::Error),

    #[error("Invalid agent endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed before a response was received")]
    ConnectionClosed,

    #[error("Malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("Malformed header: {0:?}")]
    MalformedHeader(String),

    #[error("Response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Content length from http headers does not match content's actual length (declared {declared}, read {actual})")]
    ContentLengthMismatch { declared: usize, actual: usize },

    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Io(_) | TransportError::Timeout | TransportError::ConnectionClosed => {
                FailureKind::Transient
            }
            TransportError::MalformedStatusLine(_)
            | TransportError::MalformedHeader(_)
            | TransportError::HeadTooLarge(_)
            | TransportError::ContentLengthMismatch { .. }
            | TransportError::UnsupportedTransferEncoding(_) => FailureKind::Fatal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Failed to encode value: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    #[error("I/O error while encoding: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode value: {0}")]
    Decode(String),

    #[error("Unexpected field in span: {0}")]
    UnexpectedField(String),

    #[error("Length {0} does not fit the wire format")]
    TooLong(usize),
}

impl From<rmp::decode::ValueReadError> for SerializationError {
    fn from(err: rmp::decode::ValueReadError) -> Self {
        SerializationError::Decode(err.to_string())
    }
}

impl From<rmp::decode::NumValueReadError> for SerializationError {
    fn from(err: rmp::decode::NumValueReadError) -> Self {
        SerializationError::Decode(err.to_string())
    }
}

/// Why a trace was refused at the buffer entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("Writer is closed")]
    Closed,

    #[error("Malformed trace: {0}")]
    MalformedTrace(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("Writer task is not running: {0}")]
    Stopped(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("The trace writer needs a tokio runtime: {0}")]
    NoRuntime(String),
}
