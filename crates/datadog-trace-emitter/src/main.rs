// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use datadog_trace_pipeline::config::Config;
use datadog_trace_pipeline::pipeline::TracePipeline;
use datadog_trace_pipeline::span::{now_nanos, Span};

const SUBMIT_INTERVAL: Duration = Duration::from_millis(100);
const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SERVICE: &str = "trace-emitter";

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,{}", log_level);
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading trace pipeline configuration: {e}");
            return Err(e.into());
        }
    };
    let service = config
        .service
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVICE.to_string());

    let pipeline = TracePipeline::start(config).context("failed to start trace pipeline")?;

    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        ctrl_c_token.cancel();
    });

    let mut submit_interval = interval(SUBMIT_INTERVAL);
    submit_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_interval = interval(REPORT_INTERVAL);
    report_interval.tick().await; // discard first tick, which is instantaneous

    let mut trace_ids = TraceIdGenerator::new();
    info!("Emitting synthetic traces for service {service}");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = submit_interval.tick() => {
                emit_trace(&pipeline, trace_ids.next_id(), &service);
            }
            _ = report_interval.tick() => {
                debug!("Pipeline diagnostics: {:?}", pipeline.diagnostics());
            }
        }
    }

    info!("Shutting down trace emitter");
    let report = pipeline.shutdown().await?;
    if report.timed_out {
        error!(
            "Shutdown deadline expired with {} traces unsent",
            report.traces_dropped_shutdown
        );
    }

    let snapshot = pipeline.diagnostics();
    info!(
        "Submitted {} traces: {} sent, {} rejected by sampling, {} dropped, degraded: {}",
        snapshot.traces_submitted,
        snapshot.traces_sent,
        snapshot.traces_rejected,
        snapshot.traces_dropped(),
        snapshot.degraded
    );
    Ok(())
}

/// Emits a two span web request through the same path instrumented code would use.
fn emit_trace(pipeline: &TracePipeline, trace_id: u64, service: &str) {
    let context = pipeline.new_trace(trace_id);

    let mut root = context.start_span(
        Span::new("web.request", trace_id, 1, None)
            .with_service(service)
            .with_resource("GET /synthetic")
            .with_type("web"),
    );
    let mut query = context.start_span(
        Span::new("db.query", trace_id, 2, Some(1))
            .with_service(service)
            .with_resource("SELECT 1")
            .with_type("sql"),
    );

    query.set_tag("db.system", "postgresql");
    query.finish(now_nanos());
    if let Some(chunk) = context.finish_span(query) {
        pipeline.submit(chunk);
    }

    root.set_tag("http.method", "GET");
    root.set_tag("http.status_code", "200");
    root.finish(now_nanos());
    if let Some(chunk) = context.finish_span(root) {
        pipeline.submit(chunk);
    }
}

/// Spreads sequential ids over the whole u64 range so hash sampling sees varied input.
struct TraceIdGenerator {
    seed: u64,
    counter: u64,
}

impl TraceIdGenerator {
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        TraceIdGenerator { seed, counter: 0 }
    }

    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        (self.seed ^ self.counter)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .max(1)
    }
}
