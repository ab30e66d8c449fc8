//! Request routing and per-endpoint metrics.
//!
//! Matching is deliberately simple: tables are selected by Host header,
//! endpoints by method and exact path. The connection runtime only depends
//! on `handle_request` and the metrics-recording surface, so a richer
//! matcher can replace this module without touching the request loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::http::{Method, Request, Response};
use crate::lifecycle::Lifecycle;
use crate::websocket::{WebSocketAcceptFn, WebSocketSession, WebSocketUpgradeResponse};

/// What a dispatched request produced.
#[derive(Debug)]
pub enum RouteResult {
    Response(Response),
    WebSocketUpgrade(WebSocketUpgradeResponse),
}

/// Dispatch outcome: the response plus the matched (table, endpoint)
/// indices, or `None` when no endpoint matched.
#[derive(Debug)]
pub struct HandleResult {
    pub result: RouteResult,
    pub matched: Option<(usize, usize)>,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = RouteResult> + Send>>;
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// One endpoint: method, exact path, handler.
pub struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

impl Route {
    /// Endpoint from a synchronous handler function.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        f: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        let handler: Handler = Arc::new(move |request| {
            let response = f(request);
            Box::pin(std::future::ready(RouteResult::Response(response))) as HandlerFuture
        });
        Self {
            method,
            path: path.into(),
            handler,
        }
    }

    /// Endpoint from an already-boxed asynchronous handler.
    pub fn from_handler(method: Method, path: impl Into<String>, handler: Handler) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
        }
    }

    pub fn get(
        path: impl Into<String>,
        f: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        Route::new(Method::Get, path, f)
    }

    pub fn post(
        path: impl Into<String>,
        f: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        Route::new(Method::Post, path, f)
    }

    pub fn put(
        path: impl Into<String>,
        f: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        Route::new(Method::Put, path, f)
    }

    pub fn delete(
        path: impl Into<String>,
        f: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        Route::new(Method::Delete, path, f)
    }

    /// WebSocket endpoint. Valid upgrade requests are accepted and the
    /// callback receives the upgraded session; anything else is rejected
    /// with the matching HTTP error.
    pub fn websocket(
        path: impl Into<String>,
        on_accepted: impl Fn(WebSocketSession) + Send + Sync + 'static,
    ) -> Self {
        let on_accepted: WebSocketAcceptFn = Arc::new(on_accepted);
        let handler: Handler = Arc::new(move |request| {
            let response =
                WebSocketUpgradeResponse::negotiate(&request, Arc::clone(&on_accepted));
            Box::pin(std::future::ready(RouteResult::WebSocketUpgrade(response)))
        });
        Self {
            method: Method::Get,
            path: path.into(),
            handler,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A set of endpoints, optionally pinned to one Host.
pub struct RouteTable {
    host: Option<String>,
    routes: Vec<Route>,
}

impl RouteTable {
    /// Table matching any Host.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { host: None, routes }
    }

    /// Table matching only requests for `host`.
    pub fn for_host(host: impl Into<String>, routes: Vec<Route>) -> Self {
        Self {
            host: Some(host.into()),
            routes,
        }
    }

    fn matches_host(&self, request: &Request) -> bool {
        match &self.host {
            None => true,
            Some(host) => request
                .header("host")
                .is_some_and(|h| h.eq_ignore_ascii_case(host)),
        }
    }

    fn find(&self, method: Method, path: &str) -> Option<usize> {
        self.routes
            .iter()
            .position(|r| r.method == method && r.path == path)
    }
}

/// Dispatches parsed requests to endpoint handlers.
pub struct Router {
    tables: Vec<RouteTable>,
    metrics: RouterMetrics,
    lifecycle: Lifecycle,
}

impl Router {
    pub fn new(table: RouteTable) -> Self {
        Router::with_tables(vec![table])
    }

    pub fn with_tables(tables: Vec<RouteTable>) -> Self {
        let metrics = RouterMetrics::for_tables(&tables);
        Self {
            tables,
            metrics,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn start(&self) {
        if self.lifecycle.start() {
            debug!(tables = self.tables.len(), "Router started");
        }
    }

    pub fn shutdown(&self) {
        if self.lifecycle.shutdown() {
            debug!("Router shut down");
        }
    }

    /// Dispatch one request. Unmatched requests produce a 404 and no
    /// endpoint attribution.
    pub async fn handle_request(&self, request: Request, now: DateTime<Utc>) -> HandleResult {
        // route on the path without any query string
        let path = request
            .path()
            .split('?')
            .next()
            .unwrap_or_else(|| request.path());

        for (table_index, table) in self.tables.iter().enumerate() {
            if !table.matches_host(&request) {
                continue;
            }
            if let Some(endpoint_index) = table.find(request.method(), path) {
                self.metrics
                    .count_request(table_index, endpoint_index, now);
                let result = (table.routes[endpoint_index].handler)(request).await;
                return HandleResult {
                    result,
                    matched: Some((table_index, endpoint_index)),
                };
            }
        }

        HandleResult {
            result: RouteResult::Response(Response::not_found()),
            matched: None,
        }
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }
}

/// Per-endpoint request and byte counters, addressed by the (table,
/// endpoint) indices returned in `HandleResult`.
pub struct RouterMetrics {
    endpoints: Vec<Vec<EndpointCounters>>,
}

struct EndpointCounters {
    method: Method,
    path: String,
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_request_millis: AtomicU64,
}

impl RouterMetrics {
    fn for_tables(tables: &[RouteTable]) -> Self {
        let endpoints = tables
            .iter()
            .map(|table| {
                table
                    .routes
                    .iter()
                    .map(|route| EndpointCounters {
                        method: route.method,
                        path: route.path.clone(),
                        requests: AtomicU64::new(0),
                        bytes_in: AtomicU64::new(0),
                        bytes_out: AtomicU64::new(0),
                        last_request_millis: AtomicU64::new(0),
                    })
                    .collect()
            })
            .collect();
        Self { endpoints }
    }

    fn endpoint(&self, table: usize, endpoint: usize) -> Option<&EndpointCounters> {
        self.endpoints.get(table).and_then(|t| t.get(endpoint))
    }

    fn count_request(&self, table: usize, endpoint: usize, now: DateTime<Utc>) {
        if let Some(counters) = self.endpoint(table, endpoint) {
            counters.requests.fetch_add(1, Ordering::AcqRel);
            counters
                .last_request_millis
                .store(now.timestamp_millis() as u64, Ordering::Release);
        }
    }

    /// Attribute one request/response exchange to an endpoint.
    pub fn count_bytes(&self, table: usize, endpoint: usize, bytes_in: u64, bytes_out: u64) {
        if let Some(counters) = self.endpoint(table, endpoint) {
            counters.bytes_in.fetch_add(bytes_in, Ordering::AcqRel);
            counters.bytes_out.fetch_add(bytes_out, Ordering::AcqRel);
        }
    }

    /// Inbound-only attribution (WebSocket traffic).
    pub fn count_request_bytes_in(&self, table: usize, endpoint: usize, bytes: u64) {
        if let Some(counters) = self.endpoint(table, endpoint) {
            counters.bytes_in.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Outbound-only attribution (WebSocket traffic).
    pub fn count_response_bytes_out(&self, table: usize, endpoint: usize, bytes: u64) {
        if let Some(counters) = self.endpoint(table, endpoint) {
            counters.bytes_out.fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Snapshot of every endpoint's counters.
    pub fn endpoint_reports(&self) -> Vec<EndpointReport> {
        self.endpoints
            .iter()
            .flat_map(|table| table.iter())
            .map(|c| EndpointReport {
                method: c.method.as_str().to_string(),
                path: c.path.clone(),
                requests: c.requests.load(Ordering::Acquire),
                bytes_in: c.bytes_in.load(Ordering::Acquire),
                bytes_out: c.bytes_out.load(Ordering::Acquire),
                last_request_millis: c.last_request_millis.load(Ordering::Acquire),
            })
            .collect()
    }
}

/// Per-endpoint slice of the metrics report.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub method: String,
    pub path: String,
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Unix millis of the most recent request, 0 if none yet.
    pub last_request_millis: u64,
}
