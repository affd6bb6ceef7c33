// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{ConfigError, TransportError};
use crate::http::{self, HttpRequest, HttpResponse};

pub const TRACES_PATH: &str = "/v0.4/traces";
pub const DEFAULT_AGENT_HOST: &str = "localhost";
pub const DEFAULT_AGENT_PORT: u16 = 8126;
pub const TRACE_COUNT_HEADER: &str = "X-Datadog-Trace-Count";
const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A serialized batch ready to be posted.
#[derive(Debug, Clone, Default)]
pub struct TracePayload {
    pub body: Vec<u8>,
    pub trace_count: usize,
}

/// Destination for serialized batches. One call is one send attempt.
#[async_trait]
pub trait Api: Send + Sync {
    async fn send_traces(&self, payload: &TracePayload) -> Result<HttpResponse, TransportError>;

    /// Human readable destination, for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    host: String,
    port: u16,
}

impl Default for AgentEndpoint {
    fn default() -> Self {
        AgentEndpoint::new(DEFAULT_AGENT_HOST, DEFAULT_AGENT_PORT)
    }
}

impl AgentEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        AgentEndpoint {
            host: host.to_string(),
            port,
        }
    }

    /// Parses an `http://` agent URL. Path, query and userinfo are ignored and the port defaults
    /// to 80.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint(format!("{url}: {reason}"));

        let uri = hyper::Uri::from_str(url).map_err(|e| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(scheme) => return Err(invalid(&format!("unsupported scheme {scheme}"))),
            None => return Err(invalid("missing scheme")),
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;

        let host = authority.host();
        let bare_host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if bare_host.is_empty() {
            return Err(invalid("missing host"));
        }

        // `Authority::port` hides a port that does not parse, so check what follows the host.
        let after_userinfo = authority
            .as_str()
            .rsplit_once('@')
            .map_or(authority.as_str(), |(_, rest)| rest);
        let port = match (authority.port_u16(), after_userinfo.strip_prefix(host)) {
            (Some(port), _) => port,
            (None, Some("")) => 80,
            (None, _) => return Err(invalid("invalid port")),
        };
        Ok(AgentEndpoint::new(bare_host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value of the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Posts batches to a Datadog agent over plain TCP, one connection per batch.
#[derive(Debug, Clone)]
pub struct AgentApi {
    endpoint: AgentEndpoint,
    user_agent: String,
    headers: Vec<(String, String)>,
}

impl AgentApi {
    pub fn new(endpoint: AgentEndpoint) -> Self {
        let lang_version = option_env!("CARGO_PKG_RUST_VERSION")
            .filter(|v| !v.is_empty())
            .unwrap_or("unknown");
        AgentApi {
            endpoint,
            user_agent: format!("datadog-trace-pipeline/{TRACER_VERSION}"),
            headers: vec![
                ("Datadog-Meta-Lang".to_string(), "rust".to_string()),
                ("Datadog-Meta-Lang-Version".to_string(), lang_version.to_string()),
                ("Datadog-Meta-Tracer-Version".to_string(), TRACER_VERSION.to_string()),
                ("Content-Type".to_string(), "application/msgpack".to_string()),
                ("Connection".to_string(), "close".to_string()),
            ],
        }
    }

    pub fn endpoint(&self) -> &AgentEndpoint {
        &self.endpoint
    }

    /// Headers sent with a batch of `trace_count` traces, after the fixed framing headers.
    pub fn request_headers(&self, trace_count: usize) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        headers.push((TRACE_COUNT_HEADER.to_string(), trace_count.to_string()));
        headers
    }
}

#[async_trait]
impl Api for AgentApi {
    async fn send_traces(&self, payload: &TracePayload) -> Result<HttpResponse, TransportError> {
        let mut stream =
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        stream.set_nodelay(true)?;

        let headers = self.request_headers(payload.trace_count);
        let authority = self.endpoint.authority();
        let request = HttpRequest {
            method: "POST",
            path: TRACES_PATH,
            host: &authority,
            user_agent: &self.user_agent,
            headers: &headers,
            body: &payload.body,
        };
        let response = http::post(&mut stream, &request).await?;
        debug!(
            "Agent at {} answered {} {} to {} traces",
            authority,
            response.status(),
            response.reason(),
            payload.trace_count
        );
        Ok(response)
    }

    fn describe(&self) -> String {
        format!("http://{}{}", self.endpoint.authority(), TRACES_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;

    #[duplicate_item(
        test_name                   url                                 expected;
        [test_parse_host_port]      ["http://localhost:8126"]           [Some(("localhost", 8126))];
        [test_parse_with_path]      ["http://10.0.0.5:9000/ignored"]    [Some(("10.0.0.5", 9000))];
        [test_parse_default_port]   ["http://agent"]                    [Some(("agent", 80))];
        [test_parse_ipv6]           ["http://[::1]:8126"]               [Some(("::1", 8126))];
        [test_parse_userinfo]       ["http://user@agent:8126"]          [Some(("agent", 8126))];
        [test_parse_upper_scheme]   ["HTTP://agent:8126"]               [Some(("agent", 8126))];
        [test_parse_query]          ["http://agent:8126?x=1"]           [Some(("agent", 8126))];
        [test_parse_https]          ["https://agent:8126"]              [None];
        [test_parse_unix]           ["unix:///var/run/apm.socket"]      [None];
        [test_parse_bad_port]       ["http://agent:port"]               [None];
        [test_parse_empty_host]     ["http://:8126"]                    [None];
        [test_parse_no_scheme]      ["agent:8126"]                      [None];
    )]
    #[test]
    fn test_name() {
        let parsed = AgentEndpoint::parse(url).ok();
        let want: Option<(&str, u16)> = expected;
        assert_eq!(
            parsed.as_ref().map(|e| (e.host(), e.port())),
            want
        );
    }

    #[test]
    fn test_authority_brackets_ipv6() {
        assert_eq!(AgentEndpoint::new("::1", 8126).authority(), "[::1]:8126");
        assert_eq!(AgentEndpoint::default().authority(), "localhost:8126");
    }

    #[test]
    fn test_request_headers_carry_trace_count() {
        let api = AgentApi::new(AgentEndpoint::default());
        let headers = api.request_headers(7);
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get(TRACE_COUNT_HEADER), Some("7"));
        assert_eq!(get("Datadog-Meta-Lang"), Some("rust"));
        assert_eq!(get("Content-Type"), Some("application/msgpack"));
        assert_eq!(api.describe(), "http://localhost:8126/v0.4/traces");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let port = listener.local_addr().expect("no local addr").port();
        drop(listener);

        let api = AgentApi::new(AgentEndpoint::new("127.0.0.1", port));
        let result = api.send_traces(&TracePayload::default()).await;
        match result {
            Err(e) => assert_eq!(e.kind(), crate::errors::FailureKind::Transient),
            Ok(response) => panic!("expected a connection error, got {response:?}"),
        }
    }
}
