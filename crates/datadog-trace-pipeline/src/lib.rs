// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Collection and delivery of finished traces to a Datadog agent.
//!
//! Finished trace chunks go through [`pipeline::TracePipeline::submit`], where the
//! [`sampling::Sampler`] decides whether they are kept. Kept chunks are batched by the
//! [`buffer::TraceBuffer`], encoded by [`serializer`] and posted by the [`writer::AgentWriter`]
//! task over the HTTP/1.1 framing in [`http`]. Agent rate tables found in responses flow back into
//! the sampler.

pub mod api;
pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod http;
pub mod pipeline;
pub mod sampling;
pub mod serializer;
pub mod span;
pub mod trace;
pub mod writer;

#[cfg(test)]
mod test_utils;

pub use api::{AgentApi, AgentEndpoint, Api, TracePayload};
pub use config::Config;
pub use diagnostics::DiagnosticsSnapshot;
pub use errors::{PipelineError, WriteError, WriterError};
pub use pipeline::TracePipeline;
pub use span::Span;
pub use trace::{Trace, TraceContext};
