//! WebSocket upgrade negotiation and the post-upgrade session.
//!
//! Frame encoding is deliberately not handled here: a `WebSocketSession`
//! owns the raw transport after hand-off and exposes counted reads and
//! writes, leaving the framing protocol to the embedder.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::http::{Request, Response};
use crate::session::BoxedTransport;

/// RFC 6455 magic GUID for Sec-WebSocket-Accept computation.
const WS_MAGIC_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Callback invoked with the new session once an upgrade is accepted.
pub type WebSocketAcceptFn = Arc<dyn Fn(WebSocketSession) + Send + Sync>;

/// Byte-count callback attributing traffic back to the upgraded endpoint.
pub type CountBytesFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Why an upgrade request was turned down.
#[derive(Debug)]
pub enum HandshakeError {
    MissingUpgradeHeader,
    MissingConnectionHeader,
    MissingKey,
    UnsupportedVersion,
}

impl HandshakeError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingUpgradeHeader | Self::MissingConnectionHeader | Self::MissingKey => 400,
            Self::UnsupportedVersion => 426,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingUpgradeHeader => "Missing or invalid Upgrade header",
            Self::MissingConnectionHeader => "Missing or invalid Connection header",
            Self::MissingKey => "Missing Sec-WebSocket-Key header",
            Self::UnsupportedVersion => "Unsupported WebSocket version (requires 13)",
        }
    }
}

/// Validate the upgrade headers of `request` (RFC 6455 sec 4.2), returning
/// the client's Sec-WebSocket-Key on success.
pub fn validate_upgrade_request(request: &Request) -> Result<&str, HandshakeError> {
    let upgrade_ok = request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(HandshakeError::MissingUpgradeHeader);
    }

    let connection_ok = request.header("connection").is_some_and(|v| {
        v.split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
    });
    if !connection_ok {
        return Err(HandshakeError::MissingConnectionHeader);
    }

    let key = request
        .header("sec-websocket-key")
        .map(str::trim)
        .ok_or(HandshakeError::MissingKey)?;

    let version_ok = request
        .header("sec-websocket-version")
        .is_some_and(|v| v.trim() == "13");
    if !version_ok {
        return Err(HandshakeError::UnsupportedVersion);
    }

    Ok(key)
}

/// Compute the Sec-WebSocket-Accept value: SHA-1(key + magic GUID) -> Base64.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID);
    BASE64.encode(hasher.finalize())
}

/// Response to a WebSocket upgrade request.
///
/// Both variants are written to the requesting session; only `Accept`
/// triggers the transport hand-off.
pub enum WebSocketUpgradeResponse {
    Accept {
        accept_key: String,
        on_accepted: WebSocketAcceptFn,
    },
    Reject(Response),
}

impl WebSocketUpgradeResponse {
    /// Negotiate an upgrade for `request`: a 101 acceptance when the
    /// handshake headers are valid, an HTTP rejection otherwise.
    pub fn negotiate(request: &Request, on_accepted: WebSocketAcceptFn) -> Self {
        match validate_upgrade_request(request) {
            Ok(client_key) => WebSocketUpgradeResponse::Accept {
                accept_key: compute_accept_key(client_key),
                on_accepted,
            },
            Err(e) => WebSocketUpgradeResponse::Reject(
                Response::text(e.message()).with_status(e.status_code()),
            ),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, WebSocketUpgradeResponse::Accept { .. })
    }

    /// Serialize the upgrade response bytes.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        match self {
            WebSocketUpgradeResponse::Accept { accept_key, .. } => format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept_key}\r\n\
                 \r\n"
            )
            .into_bytes(),
            WebSocketUpgradeResponse::Reject(response) => response.serialize(false),
        }
    }
}

impl std::fmt::Debug for WebSocketUpgradeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebSocketUpgradeResponse::Accept { accept_key, .. } => f
                .debug_struct("Accept")
                .field("accept_key", accept_key)
                .finish_non_exhaustive(),
            WebSocketUpgradeResponse::Reject(response) => {
                f.debug_tuple("Reject").field(response).finish()
            }
        }
    }
}

/// A connection after protocol upgrade.
///
/// Owns the transport transferred from the originating HTTP session. Reads
/// and writes are attributed back to the accepting endpoint through the
/// byte-count callbacks; the deregistration callback runs exactly once, on
/// close or drop.
pub struct WebSocketSession {
    id: u64,
    stream: BoxedTransport,
    count_bytes_in: CountBytesFn,
    count_bytes_out: CountBytesFn,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl WebSocketSession {
    pub(crate) fn new(
        id: u64,
        stream: BoxedTransport,
        count_bytes_in: CountBytesFn,
        count_bytes_out: CountBytesFn,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            id,
            stream,
            count_bytes_in,
            count_bytes_out,
            on_close: Some(on_close),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read raw bytes from the transport. Returns 0 on peer close.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf).await?;
        (self.count_bytes_in)(n as u64);
        Ok(n)
    }

    /// Write raw bytes to the transport.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        (self.count_bytes_out)(data.len() as u64);
        Ok(())
    }

    /// Close the transport and deregister.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
        self.run_on_close();
    }

    fn run_on_close(&mut self) {
        if let Some(callback) = self.on_close.take() {
            callback();
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.run_on_close();
    }
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_request;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn upgrade_request() -> Request {
        let buf = b"GET /chat HTTP/1.1\r\n\
                    Host: localhost\r\n\
                    Upgrade: websocket\r\n\
                    Connection: keep-alive, Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        parse_request(buf).unwrap().unwrap().0
    }

    fn plain_request() -> Request {
        parse_request(b"GET /chat HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap()
            .0
    }

    #[test]
    fn test_compute_accept_key_rfc_vector() {
        let key = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_upgrade_request() {
        let request = upgrade_request();
        assert_eq!(
            validate_upgrade_request(&request).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );
    }

    #[test]
    fn test_validate_rejects_plain_request() {
        let request = plain_request();
        let result = validate_upgrade_request(&request);
        assert!(matches!(result, Err(HandshakeError::MissingUpgradeHeader)));
        assert_eq!(result.unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_negotiate_accept_serializes_101() {
        let response =
            WebSocketUpgradeResponse::negotiate(&upgrade_request(), Arc::new(|_| {}));
        assert!(response.is_accept());

        let text = String::from_utf8(response.serialize()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_negotiate_reject_is_http_response() {
        let response =
            WebSocketUpgradeResponse::negotiate(&plain_request(), Arc::new(|_| {}));
        assert!(!response.is_accept());

        let text = String::from_utf8(response.serialize()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_session_counts_bytes_and_closes_once() {
        let (client, server) = tokio::io::duplex(256);
        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let in_counter = Arc::clone(&bytes_in);
        let out_counter = Arc::clone(&bytes_out);
        let close_counter = Arc::clone(&closes);
        let mut session = WebSocketSession::new(
            1,
            Box::new(server),
            Arc::new(move |n| {
                in_counter.fetch_add(n, Ordering::AcqRel);
            }),
            Arc::new(move |n| {
                out_counter.fetch_add(n, Ordering::AcqRel);
            }),
            Box::new(move || {
                close_counter.fetch_add(1, Ordering::AcqRel);
            }),
        );

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(bytes_in.load(Ordering::Acquire), 4);

        session.write_all(b"pong!").await.unwrap();
        assert_eq!(bytes_out.load(Ordering::Acquire), 5);
        let n = client_read.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong!");

        session.close().await;
        assert_eq!(closes.load(Ordering::Acquire), 1, "close runs the callback once");
    }

    #[test]
    fn test_drop_runs_close_callback() {
        let closes = Arc::new(AtomicUsize::new(0));
        let close_counter = Arc::clone(&closes);
        let mock = tokio_test::io::Builder::new().build();

        let session = WebSocketSession::new(
            2,
            Box::new(mock),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
            Box::new(move || {
                close_counter.fetch_add(1, Ordering::AcqRel);
            }),
        );
        drop(session);
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }
}
