//! Per-connection session state.
//!
//! A `Session` owns its transport exclusively until it is closed or, on a
//! WebSocket upgrade, the transport is taken out of it. The owning handle is
//! an `Option`: hand-off can happen exactly once, and a close after hand-off
//! is a no-op rather than a double close.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::http::{self, Request, Response};
use crate::registry::SessionHandle;
use crate::websocket::WebSocketUpgradeResponse;

/// Byte transport driving a session.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Per-session configuration, copied into each session at establishment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep-alive budget: continuations granted before mandatory closure.
    pub max_keep_alives: u32,
    /// Spare capacity reserved in the read buffer before each read.
    pub read_buffer_size: usize,
    /// Pending-read age beyond which the sweeper force-closes the session.
    pub read_timeout: Duration,
    /// Time allowed for a single response write.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keep_alives: 100,
            read_buffer_size: 4096,
            read_timeout: Duration::from_millis(5000),
            write_timeout: Duration::from_millis(5000),
        }
    }
}

/// One accepted connection in HTTP mode.
pub struct Session {
    id: u64,
    stream: Option<BoxedTransport>,
    buffer: BytesMut,
    config: SessionConfig,
    keep_alives_remaining: u32,
    disconnected: bool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(id: u64, stream: BoxedTransport, config: SessionConfig) -> Self {
        let keep_alives_remaining = config.max_keep_alives;
        Self {
            id,
            stream: Some(stream),
            buffer: BytesMut::with_capacity(config.read_buffer_size),
            config,
            keep_alives_remaining,
            disconnected: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn keep_alives_remaining(&self) -> u32 {
        self.keep_alives_remaining
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected || self.cancel.is_cancelled() || self.stream.is_none()
    }

    /// Registry view of this session, used to force-close it from outside.
    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.id, self.cancel.clone())
    }

    /// Spend one unit of keep-alive budget. Returns whether the session may
    /// continue onto another request.
    pub(crate) fn consume_keep_alive(&mut self) -> bool {
        if self.keep_alives_remaining > 0 {
            self.keep_alives_remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Read more bytes into the session buffer.
    ///
    /// Returns 0 on a clean peer disconnect. A force-close raced against the
    /// pending read surfaces as a stream error.
    pub async fn read_to_buffer(&mut self) -> Result<usize, SessionError> {
        if self.cancel.is_cancelled() {
            self.disconnected = true;
            return Err(SessionError::forced_close());
        }

        self.buffer.reserve(self.config.read_buffer_size);
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(SessionError::Closed),
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::forced_close()),
            read = stream.read_buf(&mut self.buffer) => match read {
                Ok(n) => Ok(n),
                Err(e) => Err(SessionError::Stream(e)),
            },
        };

        match result {
            Ok(0) | Err(_) => self.disconnected = true,
            Ok(_) => {}
        }
        result
    }

    /// Extract the next complete request from the buffer, if one is there.
    ///
    /// Non-blocking. On success the request's bytes are consumed from the
    /// buffer and their count returned alongside it.
    pub fn try_parse_next_request(&mut self) -> Result<Option<(Request, usize)>, SessionError> {
        match http::parse_request(&self.buffer)? {
            Some((request, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some((request, consumed)))
            }
            None => Ok(None),
        }
    }

    /// Write an ordinary response. The Connection header announces keep-alive
    /// only when the peer asked for it and budget remains.
    pub async fn write_response(
        &mut self,
        response: &Response,
        keep_alive: bool,
    ) -> Result<usize, SessionError> {
        let announce_keep_alive = keep_alive && self.keep_alives_remaining > 0;
        let bytes = response.serialize(announce_keep_alive);
        self.write_all_timed(&bytes).await?;
        Ok(bytes.len())
    }

    /// Write an upgrade response (acceptance or rejection alike).
    pub async fn write_upgrade_response(
        &mut self,
        response: &WebSocketUpgradeResponse,
    ) -> Result<usize, SessionError> {
        let bytes = response.serialize();
        self.write_all_timed(&bytes).await?;
        Ok(bytes.len())
    }

    async fn write_all_timed(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let write_timeout = self.config.write_timeout;
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(SessionError::Closed),
        };

        match tokio::time::timeout(write_timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnected = true;
                Err(SessionError::Stream(e))
            }
            Err(_) => {
                self.disconnected = true;
                Err(SessionError::write_timeout())
            }
        }
    }

    /// Take the transport out of the session for an upgrade hand-off.
    ///
    /// Succeeds at most once; afterwards the session reads as disconnected
    /// and `close_quietly` has nothing left to close.
    pub fn take_stream(&mut self) -> Option<BoxedTransport> {
        self.stream.take()
    }

    /// Close the transport, swallowing shutdown errors. Safe to call on any
    /// exit path, including after a hand-off.
    pub async fn close_quietly(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.disconnected = true;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("keep_alives_remaining", &self.keep_alives_remaining)
            .field("disconnected", &self.disconnected)
            .finish_non_exhaustive()
    }
}

pub type SessionFuture = Pin<Box<dyn Future<Output = Result<Session, SessionError>> + Send>>;

/// Strategy for establishing a session from a freshly accepted transport.
///
/// The default wraps nothing; an implementation may substitute its own
/// transport (TLS, instrumentation) before the request loop takes over.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, id: u64, stream: TcpStream, config: SessionConfig) -> SessionFuture;
}

/// Plain TCP sessions.
#[derive(Debug, Default)]
pub struct TcpSessionFactory;

impl SessionFactory for TcpSessionFactory {
    fn create_session(&self, id: u64, stream: TcpStream, config: SessionConfig) -> SessionFuture {
        Box::pin(async move {
            stream.set_nodelay(true)?;
            Ok(Session::new(id, Box::new(stream), config))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            max_keep_alives: 2,
            ..SessionConfig::default()
        }
    }

    fn duplex_session(config: SessionConfig) -> (Session, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (Session::new(1, Box::new(server), config), client)
    }

    #[tokio::test]
    async fn test_read_and_parse_request() {
        let (mut session, mut client) = duplex_session(test_config());
        client
            .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let n = session.read_to_buffer().await.unwrap();
        assert!(n > 0);

        let (request, consumed) = session
            .try_parse_next_request()
            .unwrap()
            .expect("complete request");
        assert_eq!(request.path(), "/status");
        assert_eq!(consumed, n);

        // buffer drained
        assert!(session.try_parse_next_request().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_zero_means_clean_disconnect() {
        let (mut session, client) = duplex_session(test_config());
        drop(client);

        let n = session.read_to_buffer().await.unwrap();
        assert_eq!(n, 0);
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_forced_close_interrupts_pending_read() {
        let (mut session, _client) = duplex_session(test_config());
        let handle = session.handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.force_close();
        });

        let result = session.read_to_buffer().await;
        assert!(matches!(result, Err(SessionError::Stream(_))));
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_read_error_is_stream_error() {
        let mock = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer reset",
            ))
            .build();
        let mut session = Session::new(1, Box::new(mock), test_config());

        let result = session.read_to_buffer().await;
        assert!(matches!(result, Err(SessionError::Stream(_))));
    }

    #[tokio::test]
    async fn test_keep_alive_budget_and_announcement() {
        let (mut session, mut client) = duplex_session(test_config());
        let response = Response::text("ok");

        // budget 2: two keep-alive announcements, then close
        session.write_response(&response, true).await.unwrap();
        assert!(session.consume_keep_alive());
        session.write_response(&response, true).await.unwrap();
        assert!(session.consume_keep_alive());
        session.write_response(&response, true).await.unwrap();
        assert!(!session.consume_keep_alive());

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(written.matches("Connection: keep-alive").count(), 2);
        assert_eq!(written.matches("Connection: close").count(), 1);
    }

    #[tokio::test]
    async fn test_non_keep_alive_request_announces_close() {
        let (mut session, mut client) = duplex_session(test_config());
        session
            .write_response(&Response::text("bye"), false)
            .await
            .unwrap();

        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_take_stream_happens_once() {
        let (mut session, _client) = duplex_session(test_config());

        assert!(session.take_stream().is_some());
        assert!(session.take_stream().is_none());
        assert!(session.is_disconnected());

        let result = session.write_response(&Response::text("x"), false).await;
        assert!(matches!(result, Err(SessionError::Closed)));

        // closing after hand-off is a no-op, not a double close
        session.close_quietly().await;
    }

    #[tokio::test]
    async fn test_close_quietly_is_idempotent() {
        let (mut session, _client) = duplex_session(test_config());
        session.close_quietly().await;
        session.close_quietly().await;
        assert!(session.is_disconnected());
    }
}
