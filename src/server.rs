//! Connection lifecycle runtime: acceptor, session workers, idle sweeper.
//!
//! Three independently-triggered actors coordinate over the shared session
//! tables:
//! - the acceptor task waits on the listener and spawns one worker task per
//!   accepted connection, so a slow handshake never stalls further accepts
//! - each worker drives its session's read-parse-dispatch-write loop
//! - the sweeper periodically force-closes sessions whose pending read has
//!   outlived the configured read timeout
//!
//! Every exit path deregisters and closes the session; a successful
//! WebSocket upgrade instead hands the transport to the new session, and
//! the close becomes a no-op.

use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::{ServerError, SessionError};
use crate::http::Response;
use crate::lifecycle::Lifecycle;
use crate::metrics::{unix_millis, MetricsReport, RateCounter, SessionCounts, WebSocketCounts};
use crate::registry::{SessionGuard, SessionRegistry};
use crate::router::{RouteResult, RouteTable, Router};
use crate::session::{Session, SessionFactory, TcpSessionFactory};
use crate::websocket::{CountBytesFn, WebSocketSession, WebSocketUpgradeResponse};

/// Fixed interval between idle-timeout sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Buckets in the rolling session-acceptance rate window.
const RATE_WINDOW: usize = 100;

/// How a session's request loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Peer disconnected cleanly (zero-byte read).
    Disconnected,
    /// Served to completion: keep-alive declined, budget exhausted, or
    /// upgrade rejected.
    Closed,
    /// Transport handed off to a WebSocket session.
    Upgraded,
}

/// The embeddable server. Cheap to clone; clones share one runtime.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    lifecycle: Lifecycle,
    registry: Arc<SessionRegistry>,
    session_rate: RateCounter,
    factory: Box<dyn SessionFactory>,
    router: OnceLock<Arc<Router>>,
    shutdown: CancellationToken,
    bound_addr: OnceLock<SocketAddr>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Server over plain TCP sessions.
    pub fn new(config: ServerConfig) -> Self {
        Server::with_factory(config, Box::new(TcpSessionFactory))
    }

    /// Server with a custom session factory (e.g. for transport wrapping).
    pub fn with_factory(config: ServerConfig, factory: Box<dyn SessionFactory>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Self {
            inner: Arc::new(ServerInner {
                lifecycle: Lifecycle::new(),
                registry: Arc::new(SessionRegistry::new()),
                session_rate: RateCounter::new(RATE_WINDOW),
                factory,
                router: OnceLock::new(),
                shutdown: CancellationToken::new(),
                bound_addr: OnceLock::new(),
                connection_limit,
                config,
            }),
        }
    }

    /// Start serving a route table.
    pub fn start(&self, table: RouteTable) -> Result<bool, ServerError> {
        self.start_with_router(Router::new(table))
    }

    /// Bind the listener and start the router, the sweeper and the acceptor.
    ///
    /// Returns whether this call performed the start; repeated or concurrent
    /// calls after the first return `Ok(false)`. Must be called from within
    /// a tokio runtime. A failed bind leaves the server stopped.
    pub fn start_with_router(&self, router: Router) -> Result<bool, ServerError> {
        if !self.inner.lifecycle.start() {
            return Ok(false);
        }

        let listener = match bind_listener(self.inner.config.listen, self.inner.config.backlog) {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.lifecycle.shutdown();
                return Err(ServerError::Io(e));
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.lifecycle.shutdown();
                return Err(ServerError::Io(e));
            }
        };
        let _ = self.inner.bound_addr.set(addr);

        tokio::spawn(run_sweeper(Arc::clone(&self.inner)));

        let router = Arc::new(router);
        router.start();
        let _ = self.inner.router.set(Arc::clone(&router));

        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, router));

        info!(address = %addr, "Server listening");
        Ok(true)
    }

    /// Stop accepting connections and sweeping. No live session is forcibly
    /// closed; existing sessions drain naturally. Returns whether this call
    /// performed the shutdown.
    pub fn shutdown(&self) -> bool {
        if self.inner.lifecycle.shutdown() {
            self.inner.shutdown.cancel();
            true
        } else {
            false
        }
    }

    /// Address the listener is bound to. `None` before start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.bound_addr.get().copied()
    }

    /// Point-in-time view of the connection population.
    ///
    /// Individual counters are read atomically; the report as a whole is not
    /// a single linearized snapshot. Fails before `start`.
    pub fn metrics_report(&self) -> Result<MetricsReport, ServerError> {
        if !self.inner.lifecycle.is_started() {
            return Err(ServerError::NotStarted);
        }
        let router = self.inner.router.get().ok_or(ServerError::NotStarted)?;
        let registry = &self.inner.registry;
        let now = unix_millis();

        Ok(MetricsReport {
            time: Utc::now(),
            port: self.local_addr().map(|a| a.port()).unwrap_or(0),
            sessions: SessionCounts {
                current: registry.session_count(),
                max: registry.max_sessions() as usize,
                total: registry.accepted_sessions(),
                current_rate: self.inner.session_rate.current_rate(now),
                max_rate: self.inner.session_rate.max_rate(),
            },
            websocket_sessions: WebSocketCounts {
                current: registry.websocket_count(),
                max: registry.max_websockets() as usize,
                total: registry.accepted_websockets(),
            },
            endpoints: router.metrics().endpoint_reports(),
        })
    }

    #[cfg(test)]
    fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }
}

/// Bind with the configured backlog and address reuse.
fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(socket.into())
}

/// Accept connections until shutdown, spawning one worker per connection.
///
/// A failed accept after shutdown ends the loop cleanly; any other accept
/// failure is logged and the loop continues.
async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, router: Arc<Router>) {
    loop {
        // admission: wait for a connection slot before accepting
        let permit = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            permit = Arc::clone(&inner.connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if inner.lifecycle.is_shutdown() {
                        break;
                    }
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let session_id = inner.registry.next_session_id();
        debug!(session_id, peer = %peer, "New connection");

        let worker_inner = Arc::clone(&inner);
        let worker_router = Arc::clone(&router);
        tokio::spawn(async move {
            handle_new_connection(worker_inner, worker_router, session_id, stream).await;
            drop(permit);
        });
    }

    info!(
        accepted = inner.registry.accepted_sessions(),
        "Listener closed"
    );
    router.shutdown();
}

/// Establish, register and drive one accepted connection.
async fn handle_new_connection(
    inner: Arc<ServerInner>,
    router: Arc<Router>,
    session_id: u64,
    stream: TcpStream,
) {
    let session = match inner
        .factory
        .create_session(session_id, stream, inner.config.session.clone())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            // never register a session that failed to establish
            warn!(session_id, error = %e, "Error creating session");
            return;
        }
    };

    inner.session_rate.count(unix_millis(), 1);

    // run the worker as its own task: a panic is contained there, observed
    // here, and the registry guards still run during the unwind
    let worker = tokio::spawn(handle_session(Arc::clone(&inner), router, session));
    if let Err(e) = worker.await {
        if e.is_panic() {
            error!(session_id, "Internal server error handling session");
        }
    }
}

/// One session's request loop, with registry cleanup on every exit path.
async fn handle_session(inner: Arc<ServerInner>, router: Arc<Router>, mut session: Session) {
    let session_id = session.id();
    let registration = SessionGuard::register(Arc::clone(&inner.registry), session.handle());

    match drive_session(&inner, &router, &mut session).await {
        Ok(end) => trace!(session_id, ?end, "Session ended"),
        Err(SessionError::Protocol(msg)) => {
            warn!(session_id, error = %msg, "Error parsing or bad request");
        }
        // forced disconnects and socket errors are expected terminations
        Err(SessionError::Stream(_)) | Err(SessionError::Closed) => {}
    }

    // deregister before closing the transport, so the sweeper cannot find a
    // stale read entry pointing at a closed session
    drop(registration);
    session.close_quietly().await;
}

/// Read-parse-dispatch-write until the session terminates.
async fn drive_session(
    inner: &ServerInner,
    router: &Arc<Router>,
    session: &mut Session,
) -> Result<SessionEnd, SessionError> {
    loop {
        if session.is_disconnected() {
            return Ok(SessionEnd::Closed);
        }

        let read = {
            // visible to the sweeper only for the true duration of the read
            let _pending = inner.registry.track_read(session.id());
            session.read_to_buffer().await
        };
        if read? == 0 {
            return Ok(SessionEnd::Disconnected);
        }

        // drain the buffer of as many complete requests as are present
        loop {
            let (request, bytes_parsed) = match session.try_parse_next_request() {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    // parse-level failure: best-effort error response, no
                    // endpoint attribution, then tear down
                    let _ = session
                        .write_response(&Response::bad_request(), false)
                        .await;
                    return Err(e);
                }
            };

            let keep_alive_requested = request.keep_alive();
            let outcome = router.handle_request(request, Utc::now()).await;

            match outcome.result {
                RouteResult::Response(response) => {
                    let bytes_written = session
                        .write_response(&response, keep_alive_requested)
                        .await?;
                    if let Some((table, endpoint)) = outcome.matched {
                        router.metrics().count_bytes(
                            table,
                            endpoint,
                            bytes_parsed as u64,
                            bytes_written as u64,
                        );
                    }
                    if !keep_alive_requested || !session.consume_keep_alive() {
                        return Ok(SessionEnd::Closed);
                    }
                }
                RouteResult::WebSocketUpgrade(upgrade) => {
                    // an upgrade attempt ends the request loop either way
                    let (bytes_written, upgraded) =
                        handle_websocket_upgrade(inner, router, session, outcome.matched, upgrade)
                            .await?;
                    if let Some((table, endpoint)) = outcome.matched {
                        router.metrics().count_bytes(
                            table,
                            endpoint,
                            bytes_parsed as u64,
                            bytes_written as u64,
                        );
                    }
                    return Ok(if upgraded {
                        SessionEnd::Upgraded
                    } else {
                        SessionEnd::Closed
                    });
                }
            }
        }
    }
}

/// Write the upgrade response and, on acceptance, hand the transport to a
/// newly registered WebSocket session.
///
/// Returns (bytes written, upgraded). When not upgraded the caller still
/// owns a transport to close; when upgraded the later close is a no-op.
async fn handle_websocket_upgrade(
    inner: &ServerInner,
    router: &Arc<Router>,
    session: &mut Session,
    matched: Option<(usize, usize)>,
    upgrade: WebSocketUpgradeResponse,
) -> Result<(usize, bool), SessionError> {
    // the response goes out whether or not the upgrade is accepted; a
    // rejection is itself a valid upgrade response
    let bytes_written = session.write_upgrade_response(&upgrade).await?;

    let WebSocketUpgradeResponse::Accept { on_accepted, .. } = upgrade else {
        return Ok((bytes_written, false));
    };

    let stream = session.take_stream().ok_or(SessionError::Closed)?;
    let websocket_id = inner.registry.next_websocket_id();

    let (count_in, count_out): (CountBytesFn, CountBytesFn) = match matched {
        Some((table, endpoint)) => {
            let in_router = Arc::clone(router);
            let out_router = Arc::clone(router);
            (
                Arc::new(move |n| {
                    in_router
                        .metrics()
                        .count_request_bytes_in(table, endpoint, n)
                }),
                Arc::new(move |n| {
                    out_router
                        .metrics()
                        .count_response_bytes_out(table, endpoint, n)
                }),
            )
        }
        None => (Arc::new(|_| {}), Arc::new(|_| {})),
    };

    let registry = Arc::clone(&inner.registry);
    let websocket = WebSocketSession::new(
        websocket_id,
        stream,
        count_in,
        count_out,
        Box::new(move || registry.remove_websocket(websocket_id)),
    );
    inner.registry.insert_websocket(websocket_id);
    debug!(
        session_id = session.id(),
        websocket_id, "Session upgraded to WebSocket"
    );

    match catch_unwind(AssertUnwindSafe(|| on_accepted(websocket))) {
        Ok(()) => Ok((bytes_written, true)),
        Err(_) => {
            // roll back: no registered-but-abandoned WebSocket session
            inner.registry.remove_websocket(websocket_id);
            error!(websocket_id, "Error in WebSocket accept callback");
            Ok((bytes_written, false))
        }
    }
}

/// Periodic idle-read sweep.
///
/// A single task with sequential ticks, so one sweep can never overlap
/// another. The read-timestamp entry is left for the read's own guard to
/// clear; a session already gone from the registry is skipped.
async fn run_sweeper(inner: Arc<ServerInner>) {
    let mut ticks = tokio::time::interval(SWEEP_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let threshold_millis = inner.config.session.read_timeout.as_millis() as u64;

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticks.tick() => {}
        }

        let now = unix_millis();
        for (session_id, started) in inner.registry.reads_snapshot() {
            if now.saturating_sub(started) > threshold_millis {
                if let Some(handle) = inner.registry.session(session_id) {
                    debug!(session_id, "Session read timed out, force-closing");
                    handle.force_close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Route;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const UPGRADE_REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: x\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    fn demo_routes() -> RouteTable {
        RouteTable::new(vec![Route::get("/ping", |_| Response::text("pong"))])
    }

    fn started_server(config: ServerConfig, table: RouteTable) -> (Server, SocketAddr) {
        let server = Server::new(config);
        assert!(server.start(table).unwrap());
        let addr = server.local_addr().expect("bound");
        (server, addr)
    }

    async fn send_request(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Read exactly one response: headers plus Content-Length body.
    async fn read_one_response(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&data[..end]).into_owned();
                let content_length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + content_length {
                    return String::from_utf8_lossy(&data[..end + 4 + content_length])
                        .into_owned();
                }
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&data).into_owned();
            }
            data.extend_from_slice(&buf[..n]);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_and_shutdown_transition_once() {
        let server = Server::new(test_config());
        assert!(server.start(demo_routes()).unwrap());
        assert!(!server.start(demo_routes()).unwrap());
        assert!(server.shutdown());
        assert!(!server.shutdown());
    }

    #[tokio::test]
    async fn test_metrics_report_requires_start() {
        let server = Server::new(test_config());
        assert!(matches!(
            server.metrics_report(),
            Err(ServerError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_single_request_then_close() {
        let (server, addr) = started_server(test_config(), demo_routes());

        let response = send_request(addr, b"GET /ping HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Connection: close"));
        assert!(response.ends_with("pong"));

        wait_until(|| server.registry().session_count() == 0).await;
        let report = server.metrics_report().unwrap();
        assert_eq!(report.sessions.total, 1);
        assert_eq!(report.sessions.current, 0);
        assert_eq!(report.endpoints[0].requests, 1);
        assert!(report.endpoints[0].bytes_in > 0);
        assert!(report.endpoints[0].bytes_out > 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_keep_alive_budget_allows_final_response() {
        let mut config = test_config();
        config.session.max_keep_alives = 2;
        let (server, addr) = started_server(config, demo_routes());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request: &[u8] = b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n";

        // budget 2: two keep-alive continuations, the third response closes
        for expected in [
            "Connection: keep-alive",
            "Connection: keep-alive",
            "Connection: close",
        ] {
            stream.write_all(request).await.unwrap();
            let response = read_one_response(&mut stream).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"));
            assert!(
                response.contains(expected),
                "expected {expected} in {response}"
            );
        }

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        wait_until(|| server.registry().session_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_pipelined_requests_processed_in_order() {
        let (server, addr) = started_server(test_config(), demo_routes());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();
        let text = String::from_utf8_lossy(&data);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_read_is_swept() {
        let mut config = test_config();
        config.session.read_timeout = Duration::from_millis(50);
        let (server, addr) = started_server(config, demo_routes());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_until(|| server.registry().session_count() == 1).await;

        // no bytes sent: the sweeper force-closes within ~one sweep interval
        let mut buf = [0u8; 16];
        match tokio::time::timeout(Duration::from_secs(4), stream.read(&mut buf)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("unexpected {n} bytes"),
            Ok(Err(_)) => {} // reset is also an orderly outcome here
            Err(_) => panic!("session was not swept"),
        }
        wait_until(|| server.registry().session_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_active_session_is_not_swept() {
        let mut config = test_config();
        config.session.read_timeout = Duration::from_millis(2000);
        let (server, addr) = started_server(config, demo_routes());

        // a session with no outstanding read is never targeted: requests
        // spaced under the timeout keep this one alive across sweeps
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..3 {
            stream
                .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let response = read_one_response(&mut stream).await;
            assert!(response.starts_with("HTTP/1.1 200 OK"));
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }
        assert_eq!(server.registry().session_count(), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400_and_close() {
        let (server, addr) = started_server(test_config(), demo_routes());

        let response = send_request(addr, b"garbage\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        wait_until(|| server.registry().session_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404_without_attribution() {
        let (server, addr) = started_server(test_config(), demo_routes());

        let response = send_request(addr, b"GET /nope HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        let report = server.metrics_report().unwrap();
        assert!(report.endpoints.iter().all(|e| e.requests == 0));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_websocket_upgrade_hands_off_transport() {
        let accepted: Arc<Mutex<Option<WebSocketSession>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&accepted);
        let table = RouteTable::new(vec![Route::websocket("/ws", move |ws| {
            *slot.lock().unwrap() = Some(ws);
        })]);
        let (server, addr) = started_server(test_config(), table);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(UPGRADE_REQUEST).await.unwrap();
        let response = read_one_response(&mut stream).await;
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        // the originating session is gone; the websocket session is live
        wait_until(|| server.registry().session_count() == 0).await;
        let report = server.metrics_report().unwrap();
        assert_eq!(report.sessions.current, 0);
        assert_eq!(report.websocket_sessions.current, 1);
        assert_eq!(report.websocket_sessions.total, 1);

        // the handed-off transport still reaches the peer
        let mut ws = accepted.lock().unwrap().take().expect("callback ran");
        ws.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        ws.close().await;
        wait_until(|| server.registry().websocket_count() == 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_upgrade_callback_fault_rolls_back() {
        let table = RouteTable::new(vec![Route::websocket("/ws", |_| {
            panic!("embedder bug")
        })]);
        let (server, addr) = started_server(test_config(), table);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(UPGRADE_REQUEST).await.unwrap();

        // the 101 goes out before the callback runs, then the transport closes
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();
        assert!(data.starts_with(b"HTTP/1.1 101 Switching Protocols"));

        wait_until(|| server.registry().session_count() == 0).await;
        assert_eq!(server.registry().websocket_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_upgrade_is_rejected() {
        let table = RouteTable::new(vec![Route::websocket("/ws", |_| {})]);
        let (server, addr) = started_server(test_config(), table);

        let response = send_request(
            addr,
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"));

        wait_until(|| server.registry().session_count() == 0).await;
        assert_eq!(server.metrics_report().unwrap().websocket_sessions.total, 0);
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_accepts_account_exactly() {
        let (server, addr) = started_server(test_config(), demo_routes());

        // cap in-flight client sockets to stay under fd limits; the server
        // still sees 1000 accepts racing across worker threads
        let in_flight = Arc::new(Semaphore::new(200));
        let workers: Vec<_> = (0..1000)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let _slot = in_flight.acquire_owned().await.unwrap();
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    stream
                        .write_all(b"GET /ping HTTP/1.0\r\n\r\n")
                        .await
                        .unwrap();
                    let mut data = Vec::new();
                    stream.read_to_end(&mut data).await.unwrap();
                    assert!(data.starts_with(b"HTTP/1.1 200"));
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        wait_until(|| server.registry().session_count() == 0).await;
        let report = server.metrics_report().unwrap();
        assert_eq!(report.sessions.total, 1000);
        assert!(report.sessions.max >= 1);
        assert!(report.sessions.max <= 1000);
        assert!(report.sessions.max_rate >= 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (server, addr) = started_server(test_config(), demo_routes());

        assert!(server.shutdown());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
